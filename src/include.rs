use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::SystemTime,
};

use parking_lot::Mutex;

use crate::{ast::NodeId, error::RuntimeErrorKind, template::CompiledTemplate};

#[derive(Debug, Clone)]
struct CachedInclude {
    path: PathBuf,
    modified: Option<SystemTime>,
    template: CompiledTemplate,
}

/// Per-template cache of compiled includes, keyed by the include node.
///
/// An entry is valid only for the exact resolved path and modification time
/// it was compiled from. Concurrent renders may both miss and both store; the
/// last store wins and either entry is correct.
#[derive(Debug, Default)]
pub(crate) struct IncludeCache {
    entries: Mutex<HashMap<NodeId, CachedInclude>>,
    compilations: AtomicUsize,
}

impl IncludeCache {
    pub(crate) fn lookup(
        &self,
        node: NodeId,
        path: &Path,
        modified: Option<SystemTime>,
    ) -> Option<CompiledTemplate> {
        let entries = self.entries.lock();
        entries
            .get(&node)
            .filter(|entry| entry.path == path && entry.modified == modified)
            .map(|entry| entry.template.clone())
    }

    pub(crate) fn store(
        &self,
        node: NodeId,
        path: PathBuf,
        modified: Option<SystemTime>,
        template: CompiledTemplate,
    ) {
        self.entries.lock().insert(
            node,
            CachedInclude {
                path,
                modified,
                template,
            },
        );
    }

    pub(crate) fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

/// Joins a relative include path onto the including template's directory.
pub(crate) fn resolve_relative(dir: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        dir.join(target)
    }
}

pub(crate) fn last_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

pub(crate) fn read_source(path: &Path) -> Result<String, RuntimeErrorKind> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => RuntimeErrorKind::IncludeNotFound {
            path: path.to_path_buf(),
        },
        _ => RuntimeErrorKind::IncludeUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
    })
}
