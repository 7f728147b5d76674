// Pass scheduling
//
// Breadth-first layering of the operation/resource DAG:
//   first pass  - operations none of whose inputs are written by another operation
//   next pass   - every operation reading something the previous pass wrote
// repeated until a generated pass is empty. An operation reached in several
// generations keeps only its last one, so it lands after all its producers.
// Passes are then split so no pass has two writers of the same resource.

use std::collections::{BTreeSet, HashMap};

use super::connection::{ConnectionSet, OperationId, ResourceId};
use super::GraphError;

/// A group of operations recorded together, with the resources they touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pass {
    pub operations: Vec<OperationId>,
    pub inputs: BTreeSet<ResourceId>,
    pub outputs: BTreeSet<ResourceId>,
}

impl Pass {
    fn from_operations(operations: Vec<OperationId>, connections: &ConnectionSet) -> Self {
        let mut pass = Pass { operations, ..Default::default() };
        for &op in &pass.operations {
            pass.inputs.extend(connections.inputs(op));
            pass.outputs.extend(connections.outputs(op));
        }
        pass
    }
}

/// Whether another operation writes something `op` reads.
fn has_producer(connections: &ConnectionSet, op: OperationId) -> bool {
    connections
        .inputs(op)
        .any(|resource| connections.writers(resource).any(|writer| writer != op))
}

pub fn first_pass(connections: &ConnectionSet, operations: &[OperationId]) -> Vec<OperationId> {
    operations
        .iter()
        .copied()
        .filter(|&op| !has_producer(connections, op))
        .collect()
}

/// Consumers of everything `previous` wrote, in declaration order.
pub fn next_pass(connections: &ConnectionSet, operations: &[OperationId], previous: &[OperationId]) -> Vec<OperationId> {
    let written: BTreeSet<ResourceId> = previous.iter().flat_map(|&op| connections.outputs(op)).collect();

    operations
        .iter()
        .copied()
        .filter(|&op| {
            connections
                .inputs(op)
                .any(|resource| written.contains(&resource) && !previous_only_writer_is(connections, previous, resource, op))
        })
        .collect()
}

// An operation that reads and writes the same resource is not its own producer.
fn previous_only_writer_is(connections: &ConnectionSet, previous: &[OperationId], resource: ResourceId, op: OperationId) -> bool {
    previous
        .iter()
        .filter(|&&p| connections.writes(p, resource))
        .all(|&p| p == op)
}

/// Layer the graph into passes. Fails when the dependencies contain a cycle,
/// including one no source operation reaches.
pub fn get_passes(connections: &ConnectionSet, operations: &[OperationId]) -> Result<Vec<Pass>, GraphError> {
    let mut layers: Vec<Vec<OperationId>> = Vec::new();
    let mut current = first_pass(connections, operations);

    while !current.is_empty() {
        if layers.len() > operations.len() {
            let mut involved: Vec<_> = current.clone();
            involved.sort();
            return Err(GraphError::Cycle { operations: involved });
        }
        let next = next_pass(connections, operations, &current);
        layers.push(current);
        current = next;
    }

    // Keep each operation's last generation only
    let mut last_layer: HashMap<OperationId, usize> = HashMap::new();
    for (index, layer) in layers.iter().enumerate() {
        for &op in layer {
            last_layer.insert(op, index);
        }
    }

    // Every producer chain from an unreached operation loops back on itself.
    let mut unscheduled: Vec<OperationId> =
        operations.iter().copied().filter(|op| !last_layer.contains_key(op)).collect();
    if !unscheduled.is_empty() {
        unscheduled.sort();
        log::error!("{} operations sit on or behind a dependency cycle", unscheduled.len());
        return Err(GraphError::Cycle { operations: unscheduled });
    }

    let passes: Vec<Pass> = layers
        .into_iter()
        .enumerate()
        .map(|(index, layer)| layer.into_iter().filter(|op| last_layer[op] == index).collect::<Vec<_>>())
        .filter(|layer| !layer.is_empty())
        .map(|layer| Pass::from_operations(layer, connections))
        .collect();

    Ok(passes)
}

/// Hoist operations that share a written resource with another operation of
/// the same pass into singleton passes after the rest of that pass.
///
/// Hoisted writers each get their own pass, so one sweep already leaves no
/// pass with two writers of the same resource.
pub fn separate_passes(passes: Vec<Pass>, connections: &ConnectionSet) -> Vec<Pass> {
    let mut result = Vec::with_capacity(passes.len());

    for pass in passes {
        let mut writer_count: HashMap<ResourceId, usize> = HashMap::new();
        for &op in &pass.operations {
            for resource in connections.outputs(op) {
                *writer_count.entry(resource).or_default() += 1;
            }
        }

        let (hoisted, remainder): (Vec<_>, Vec<_>) = pass
            .operations
            .iter()
            .copied()
            .partition(|&op| connections.outputs(op).any(|r| writer_count[&r] > 1));

        if hoisted.is_empty() {
            result.push(pass);
            continue;
        }

        log::debug!("Splitting pass: {} operations share written resources", hoisted.len());
        if !remainder.is_empty() {
            result.push(Pass::from_operations(remainder, connections));
        }
        for op in hoisted {
            result.push(Pass::from_operations(vec![op], connections));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u32) -> Vec<OperationId> {
        (0..n).map(OperationId).collect()
    }

    #[test]
    fn source_operations_form_the_first_pass() {
        let mut c = ConnectionSet::new();
        let ops = ids(3);
        c.write(ops[0], ResourceId(0));
        c.read(ops[1], ResourceId(0));
        c.write(ops[1], ResourceId(1));
        c.read(ops[2], ResourceId(5)); // nobody writes r5

        assert_eq!(first_pass(&c, &ops), [ops[0], ops[2]]);
        assert_eq!(next_pass(&c, &ops, &[ops[0], ops[2]]), [ops[1]]);
    }

    #[test]
    fn read_modify_write_is_not_its_own_producer() {
        let mut c = ConnectionSet::new();
        let ops = ids(1);
        c.read(ops[0], ResourceId(0));
        c.write(ops[0], ResourceId(0));

        let passes = get_passes(&c, &ops).unwrap();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].operations, [ops[0]]);
    }

    #[test]
    fn diamond_keeps_last_generation() {
        // 0 -> r0 -> 1 -> r1 -> 2, and 0 -> r0 -> 2 directly
        let mut c = ConnectionSet::new();
        let ops = ids(3);
        c.write(ops[0], ResourceId(0));
        c.read(ops[1], ResourceId(0));
        c.write(ops[1], ResourceId(1));
        c.read(ops[2], ResourceId(0));
        c.read(ops[2], ResourceId(1));

        let passes = get_passes(&c, &ops).unwrap();
        let order: Vec<_> = passes.iter().map(|p| p.operations.clone()).collect();
        assert_eq!(order, [vec![ops[0]], vec![ops[1]], vec![ops[2]]]);
        assert_eq!(passes[2].inputs, BTreeSet::from([ResourceId(0), ResourceId(1)]));
    }

    #[test]
    fn cycles_are_reported() {
        let mut c = ConnectionSet::new();
        let ops = ids(3);
        c.write(ops[0], ResourceId(0));
        c.read(ops[1], ResourceId(0));
        c.write(ops[1], ResourceId(1));
        c.read(ops[2], ResourceId(1));
        c.write(ops[2], ResourceId(2));
        c.read(ops[1], ResourceId(2));

        assert!(matches!(get_passes(&c, &ops), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn cycles_without_a_source_are_reported() {
        // 0 reads r0 writes r1, 1 reads r1 writes r0; 2 is an unrelated source
        let mut c = ConnectionSet::new();
        let ops = ids(3);
        c.read(ops[0], ResourceId(0));
        c.write(ops[0], ResourceId(1));
        c.read(ops[1], ResourceId(1));
        c.write(ops[1], ResourceId(0));
        c.write(ops[2], ResourceId(2));

        match get_passes(&c, &ops) {
            Err(GraphError::Cycle { operations }) => assert_eq!(operations, [ops[0], ops[1]]),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn consumers_behind_a_cycle_are_reported_with_it() {
        let mut c = ConnectionSet::new();
        let ops = ids(3);
        c.read(ops[0], ResourceId(0));
        c.write(ops[0], ResourceId(1));
        c.read(ops[1], ResourceId(1));
        c.write(ops[1], ResourceId(0));
        c.read(ops[2], ResourceId(1));

        assert!(matches!(
            get_passes(&c, &ops),
            Err(GraphError::Cycle { operations }) if operations == [ops[0], ops[1], ops[2]]
        ));
    }

    #[test]
    fn shared_writers_are_hoisted_after_the_remainder() {
        let mut c = ConnectionSet::new();
        let ops = ids(4);
        c.write(ops[0], ResourceId(0));
        c.write(ops[1], ResourceId(1));
        c.write(ops[2], ResourceId(0));
        c.write(ops[3], ResourceId(0));

        let passes = separate_passes(get_passes(&c, &ops).unwrap(), &c);
        let order: Vec<_> = passes.iter().map(|p| p.operations.clone()).collect();
        assert_eq!(order, [vec![ops[1]], vec![ops[0]], vec![ops[2]], vec![ops[3]]]);
    }
}
