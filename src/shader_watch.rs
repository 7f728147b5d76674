// Shader hot reload
//
// Watches the shader directory and reports compiled SPIR-V files that were
// created or modified since the last poll. The frame loop reloads those
// stages and recompiles the graph.

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Event>,
    directory: PathBuf,
}

impl ShaderWatcher {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel::<notify::Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", directory))?;
        log::info!("Watching {:?} for shader changes", directory);

        Ok(Self { _watcher: watcher, events: rx, directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Drain pending events; changed `.spv` files, each once.
    pub fn poll(&self) -> Vec<PathBuf> {
        let mut changed = BTreeSet::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            changed.extend(event.paths.into_iter().filter(|p| is_spirv(p)));
        }
        changed.into_iter().collect()
    }
}

fn is_spirv(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "spv")
}
