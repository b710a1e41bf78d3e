use crate::handlers::{self, HandlerSet};
use crate::signals::SignalHub;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Emit a progress signal every this many parsed containers.
pub const PROGRESS_INTERVAL: usize = 20;

/// The index's owned state: both maps plus the original-case spelling of
/// every container path (map keys are lowercase POSIX; the original case is
/// needed to open files on case-sensitive filesystems).
#[derive(Debug, Clone, Default)]
pub struct IndexMaps {
    /// container → set of references it holds
    pub forward: HashMap<String, HashSet<String>>,
    /// reference → set of containers holding it
    pub reverse: HashMap<String, HashSet<String>>,
    /// lowercase container key → original-case relative path
    pub container_case: HashMap<String, String>,
}

/// Every container file under `root`, in walk order.
pub fn collect_containers(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| handlers::is_container_path(path))
        .collect()
}

/// Walk the tree once, fan parsing across the rayon pool, and assemble the
/// maps. Per-file parse errors are reported but never abort the build.
pub fn build_maps(root: &Path, handlers: &HandlerSet, signals: &SignalHub) -> IndexMaps {
    let start = Instant::now();
    let files = collect_containers(root);
    let total = files.len();
    if total == 0 {
        signals.warning("No container files found. Index is empty.");
        return IndexMaps::default();
    }

    let completed = AtomicUsize::new(0);
    let parsed: Vec<(String, HashSet<String>)> = files
        .par_iter()
        .filter_map(|path| {
            let rel = crate::to_rel_path(root, path)?;
            let result = handlers.parse_file(path);
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % PROGRESS_INTERVAL == 0 {
                signals.progress(done, total);
            }
            match result {
                Ok(refs) => Some((rel, refs)),
                Err(err) => {
                    warn!("could not parse {}: {err}", path.display());
                    signals.warning(format!("Could not parse {}: {err}", path.display()));
                    None
                },
            }
        })
        .collect();
    signals.progress(total, total);

    let mut maps = IndexMaps::default();
    for (rel, refs) in parsed {
        let key = rel.to_lowercase();
        for reference in &refs {
            maps.reverse
                .entry(reference.clone())
                .or_default()
                .insert(key.clone());
        }
        maps.forward.insert(key.clone(), refs);
        maps.container_case.insert(key, rel);
    }

    info!(
        "index built in {:.2?}; {} containers, {} distinct references",
        start.elapsed(),
        maps.forward.len(),
        maps.reverse.len()
    );
    maps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::signals::{Signal, SignalHub};
    use std::fs;
    use tempfile::TempDir;

    fn handler_set() -> HandlerSet {
        HandlerSet::new(&WatchConfig::default().tracked).unwrap()
    }

    #[test]
    fn test_collect_containers_filters_by_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mtl"), b"").unwrap();
        fs::write(dir.path().join("b.lua"), b"").unwrap();
        fs::write(dir.path().join("c.dds"), b"").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/d.lyr"), b"").unwrap();

        let mut names: Vec<String> = collect_containers(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.mtl", "b.lua", "d.lyr"]);
    }

    #[test]
    fn test_build_maps_populates_both_directions() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Mat.mtl"),
            br#"<M Texture="tex/Wall.dds"/>"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("level.lua"),
            br#"Load("tex/wall.dds")"#,
        )
        .unwrap();

        let maps = build_maps(dir.path(), &handler_set(), &SignalHub::disconnected());

        assert_eq!(maps.forward.len(), 2);
        assert!(maps.forward["mat.mtl"].contains("tex/wall.dds"));
        let holders = &maps.reverse["tex/wall.dds"];
        assert!(holders.contains("mat.mtl"));
        assert!(holders.contains("level.lua"));
        assert_eq!(maps.container_case["mat.mtl"], "Mat.mtl");
    }

    #[test]
    fn test_build_maps_emits_final_progress() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mtl"), b"").unwrap();
        let (hub, rx) = SignalHub::new();
        build_maps(dir.path(), &handler_set(), &hub);

        let signals: Vec<Signal> = rx.try_iter().collect();
        assert!(signals.contains(&Signal::ProgressUpdated {
            current: 1,
            total: 1
        }));
    }

    #[test]
    fn test_build_maps_empty_tree() {
        let dir = TempDir::new().unwrap();
        let maps = build_maps(dir.path(), &handler_set(), &SignalHub::disconnected());
        assert!(maps.forward.is_empty());
        assert!(maps.reverse.is_empty());
    }
}
