// Operation <-> Resource edges
//
// Handles index into the graph's arenas; the connection set only stores
// handles, so it never outlives or dangles past what it describes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u32);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OperationId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Edge direction, seen from the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub operation: OperationId,
    pub resource: ResourceId,
    pub direction: Direction,
}

/// Bipartite operation/resource graph. Edges keep insertion order, which is
/// the order operations see their inputs and outputs in.
#[derive(Debug, Default, Clone)]
pub struct ConnectionSet {
    edges: Vec<Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge; duplicates are ignored.
    pub fn connect(&mut self, operation: OperationId, resource: ResourceId, direction: Direction) {
        let edge = Connection { operation, resource, direction };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn read(&mut self, operation: OperationId, resource: ResourceId) {
        self.connect(operation, resource, Direction::Input);
    }

    pub fn write(&mut self, operation: OperationId, resource: ResourceId) {
        self.connect(operation, resource, Direction::Output);
    }

    pub fn edges(&self) -> &[Connection] {
        &self.edges
    }

    pub fn inputs(&self, operation: OperationId) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources_of(operation, Direction::Input)
    }

    pub fn outputs(&self, operation: OperationId) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources_of(operation, Direction::Output)
    }

    /// Operations reading `resource`.
    pub fn readers(&self, resource: ResourceId) -> impl Iterator<Item = OperationId> + '_ {
        self.operations_of(resource, Direction::Input)
    }

    /// Operations writing `resource`.
    pub fn writers(&self, resource: ResourceId) -> impl Iterator<Item = OperationId> + '_ {
        self.operations_of(resource, Direction::Output)
    }

    pub fn reads(&self, operation: OperationId, resource: ResourceId) -> bool {
        self.inputs(operation).any(|r| r == resource)
    }

    pub fn writes(&self, operation: OperationId, resource: ResourceId) -> bool {
        self.outputs(operation).any(|r| r == resource)
    }

    fn resources_of(&self, operation: OperationId, direction: Direction) -> impl Iterator<Item = ResourceId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.operation == operation && e.direction == direction)
            .map(|e| e.resource)
    }

    fn operations_of(&self, resource: ResourceId, direction: Direction) -> impl Iterator<Item = OperationId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.resource == resource && e.direction == direction)
            .map(|e| e.operation)
    }
}
