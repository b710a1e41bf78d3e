use crate::atomic::AtomicWriter;
use crate::builder::{self, IndexMaps};
use crate::config::WatchConfig;
use crate::error::{Error, Result};
use crate::handlers::{HandlerSet, Replacements};
use crate::signals::{Signal, SignalHub};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long events on a path we just wrote are suppressed.
///
/// The host filesystem re-emits modify events for every container we rewrite;
/// without this window the index would re-parse its own writes and loop.
pub const WRITE_COOLDOWN: Duration = Duration::from_secs(2);

/// Thread-safe bidirectional index of asset references.
///
/// `forward` maps a container to the references it holds, `reverse` maps a
/// reference to the containers holding it; `c ∈ reverse[r] ⇔ r ∈ forward[c]`
/// at every step. All keys are lowercase POSIX relative paths.
pub struct ReferenceIndex {
    root: PathBuf,
    config: Arc<WatchConfig>,
    handlers: HandlerSet,
    writer: AtomicWriter,
    signals: SignalHub,
    state: Mutex<IndexState>,
}

#[derive(Default)]
struct IndexState {
    maps: IndexMaps,
    cooldowns: std::collections::HashMap<PathBuf, Instant>,
}

impl ReferenceIndex {
    pub fn new(
        root: PathBuf,
        config: Arc<WatchConfig>,
        signals: SignalHub,
        writer: AtomicWriter,
    ) -> Result<Self> {
        let handlers =
            HandlerSet::new(&config.tracked).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            root,
            config,
            handlers,
            writer,
            signals,
            state: Mutex::new(IndexState::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Rebuild both maps from disk. Idempotent; progress is emitted by the
    /// builder.
    pub fn rebuild(&self) {
        let maps = builder::build_maps(&self.root, &self.handlers, &self.signals);
        self.state.lock().maps = maps;
    }

    // ---- cooldowns ----

    pub fn set_cooldown(&self, path: &Path) {
        self.state
            .lock()
            .cooldowns
            .insert(path.to_path_buf(), Instant::now() + WRITE_COOLDOWN);
    }

    pub fn is_on_cooldown(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        Self::check_cooldown(&mut state, path)
    }

    fn check_cooldown(state: &mut IndexState, path: &Path) -> bool {
        match state.cooldowns.get(path) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                state.cooldowns.remove(path);
                false
            },
            None => false,
        }
    }

    pub fn prune_cooldowns(&self) {
        let now = Instant::now();
        self.state.lock().cooldowns.retain(|_, deadline| *deadline > now);
    }

    // ---- container updates ----

    /// Re-parse a created or modified container and splice the diff into the
    /// maps. Skipped while the path is on cooldown; an unreadable file leaves
    /// the index unchanged.
    pub fn upsert_container(&self, abs: &Path) {
        let Some(rel) = crate::to_rel_path(&self.root, abs) else {
            return;
        };
        {
            let mut state = self.state.lock();
            if Self::check_cooldown(&mut state, abs) {
                return;
            }
        }

        let refs = match self.handlers.parse_file(abs) {
            Ok(refs) => refs,
            Err(err) => {
                warn!("skipping unreadable container {}: {err}", abs.display());
                self.signals
                    .warning(format!("Could not read {}: {err}", abs.display()));
                return;
            },
        };

        let key = rel.to_lowercase();
        let mut state = self.state.lock();
        Self::detach(&mut state.maps, &key);
        for reference in &refs {
            state
                .maps
                .reverse
                .entry(reference.clone())
                .or_default()
                .insert(key.clone());
        }
        state.maps.forward.insert(key.clone(), refs);
        state.maps.container_case.insert(key, rel);
    }

    /// Remove a deleted container from both maps.
    pub fn drop_container(&self, abs: &Path) {
        let Some(rel) = crate::to_rel_path(&self.root, abs) else {
            return;
        };
        let key = rel.to_lowercase();
        let mut state = self.state.lock();
        Self::detach(&mut state.maps, &key);
        state.maps.container_case.remove(&key);
    }

    fn detach(maps: &mut IndexMaps, key: &str) {
        if let Some(old_refs) = maps.forward.remove(key) {
            for reference in &old_refs {
                if let Some(containers) = maps.reverse.get_mut(reference) {
                    containers.remove(key);
                    if containers.is_empty() {
                        maps.reverse.remove(reference);
                    }
                }
            }
        }
    }

    // ---- renames ----

    /// React to a tracked asset rename: patch every container referencing the
    /// old path (or one of its variants) and move the map entries over.
    pub fn rename_asset(&self, old_abs: &Path, new_abs: &Path) {
        let (Some(old_rel), Some(new_rel)) = (
            crate::to_rel_path(&self.root, old_abs),
            crate::to_rel_path(&self.root, new_abs),
        ) else {
            return;
        };

        let pairs = self.variant_pairs(&old_rel, &new_rel);
        let replacements = Replacements::exact(pairs.clone());

        let mut state = self.state.lock();
        let affected: HashSet<String> = pairs
            .iter()
            .filter_map(|(old_key, _)| state.maps.reverse.get(old_key))
            .flatten()
            .cloned()
            .collect();
        if affected.is_empty() {
            return;
        }

        info!(
            "rename detected: '{old_rel}' -> '{new_rel}', patching {} container(s)",
            affected.len()
        );
        self.signals.info(format!(
            "Rename detected: '{old_rel}' -> '{new_rel}'. Patching {} file(s)...",
            affected.len()
        ));

        let mut failed: HashSet<String> = HashSet::new();
        for container_key in &affected {
            let original = Self::original_case(&state.maps, container_key);
            let abs = self.root.join(&original);
            if self.config.dry_run {
                self.signals.info(format!("Dry run: would patch '{original}'"));
                info!("dry run: would patch {}", abs.display());
                continue;
            }
            match self.handlers.rewrite_file(&abs, &replacements, &self.writer) {
                Ok(true) => {
                    self.signals.info(format!("Patched '{original}'"));
                    state
                        .cooldowns
                        .insert(abs, Instant::now() + WRITE_COOLDOWN);
                },
                Ok(false) => {},
                Err(err) => {
                    warn!("failed to rewrite {}: {err}", abs.display());
                    self.signals
                        .error(format!("Failed to rewrite '{original}': {err}"));
                    failed.insert(container_key.clone());
                },
            }
        }

        if self.config.dry_run {
            return;
        }

        // Move map entries variant-by-variant so each container's forward set
        // keeps matching what is now on disk. Containers whose rewrite failed
        // stay where they were.
        for (old_key, new_value) in &pairs {
            let new_key = new_value.to_lowercase();
            let Some(containers) = state.maps.reverse.get_mut(old_key) else {
                continue;
            };
            let moved: HashSet<String> = containers
                .iter()
                .filter(|c| !failed.contains(*c))
                .cloned()
                .collect();
            if moved.is_empty() {
                continue;
            }
            containers.retain(|c| failed.contains(c));
            if containers.is_empty() {
                state.maps.reverse.remove(old_key);
            }
            for container in &moved {
                if let Some(forward) = state.maps.forward.get_mut(container) {
                    forward.remove(old_key);
                    forward.insert(new_key.clone());
                }
            }
            state
                .maps
                .reverse
                .entry(new_key)
                .or_default()
                .extend(moved);
        }
    }

    /// React to a directory rename: prefix-patch every affected container,
    /// then rebuild (directory renames are rare; incremental key surgery is
    /// not worth the risk).
    pub fn rename_directory(&self, old_dir_abs: &Path, new_dir_abs: &Path) {
        if !self.config.allow_dir_change {
            return;
        }
        let (Some(old_rel), Some(new_rel)) = (
            crate::to_rel_path(&self.root, old_dir_abs),
            crate::to_rel_path(&self.root, new_dir_abs),
        ) else {
            return;
        };

        let prefix = format!("{}/", old_rel.to_lowercase());
        let replacements = Replacements::dir_move(old_rel.clone(), new_rel.clone());

        let affected: Vec<(String, String)> = {
            let state = self.state.lock();
            state
                .maps
                .forward
                .iter()
                .filter(|(_, refs)| refs.iter().any(|r| r.starts_with(&prefix)))
                .map(|(key, _)| (key.clone(), Self::original_case(&state.maps, key)))
                .collect()
        };
        if affected.is_empty() {
            return;
        }

        info!(
            "directory rename: '{old_rel}' -> '{new_rel}', patching {} container(s)",
            affected.len()
        );
        self.signals.info(format!(
            "Directory rename: '{old_rel}' -> '{new_rel}'. Patching {} files...",
            affected.len()
        ));

        if self.config.dry_run {
            for (_, original) in &affected {
                self.signals.info(format!("Dry run: would patch '{original}'"));
            }
            return;
        }

        {
            let mut state = self.state.lock();
            for (key, original) in &affected {
                // Containers under the renamed directory have moved with it.
                let on_disk = key
                    .strip_prefix(&prefix)
                    .map_or_else(|| original.clone(), |_| {
                        format!("{new_rel}{}", &original[old_rel.len()..])
                    });
                let abs = self.root.join(&on_disk);
                match self.handlers.rewrite_file(&abs, &replacements, &self.writer) {
                    Ok(true) => {
                        self.signals.info(format!("Patched '{on_disk}'"));
                        state
                            .cooldowns
                            .insert(abs, Instant::now() + WRITE_COOLDOWN);
                    },
                    Ok(false) => {},
                    Err(err) => {
                        warn!("failed to rewrite {}: {err}", abs.display());
                        self.signals
                            .error(format!("Failed to rewrite '{on_disk}': {err}"));
                    },
                }
            }
        }

        self.signals.emit(Signal::IndexingStarted);
        self.rebuild();
        self.signals.emit(Signal::IndexingFinished);
    }

    /// The lowercased `old → new` reference variants a rename may touch.
    ///
    /// Texture renames expand to every texture alias of both stems so a
    /// rename of `foo.tif` also patches references written as `foo.dds`;
    /// materials contribute their extensionless spelling.
    fn variant_pairs(&self, old_rel: &str, new_rel: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let old_ext = ext_of_rel(old_rel);
        let is_texture = old_ext
            .as_deref()
            .is_some_and(|ext| self.config.is_texture_ext(ext));

        if is_texture && self.config.match_any_texture_extension && self.config.allow_ext_change {
            let old_stem = strip_ext(old_rel);
            let new_stem = strip_ext(new_rel);
            let mut exts: Vec<&String> = self.config.textures.iter().collect();
            exts.sort();
            for ext in exts {
                pairs.push((
                    format!("{old_stem}{ext}").to_lowercase(),
                    format!("{new_stem}{ext}"),
                ));
            }
        } else {
            pairs.push((old_rel.to_lowercase(), new_rel.to_string()));
        }

        if old_ext.as_deref() == Some(".mtl") {
            pairs.push((
                strip_ext(old_rel).to_lowercase(),
                strip_ext(new_rel).to_string(),
            ));
        }
        pairs
    }

    fn original_case(maps: &IndexMaps, key: &str) -> String {
        maps.container_case
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    // ---- read access ----

    pub fn references_of(&self, container: &str) -> Option<HashSet<String>> {
        self.state
            .lock()
            .maps
            .forward
            .get(&container.to_lowercase())
            .cloned()
    }

    pub fn containers_of(&self, reference: &str) -> Option<HashSet<String>> {
        self.state
            .lock()
            .maps
            .reverse
            .get(&reference.to_lowercase())
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().maps.forward.len()
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().maps.reverse.len()
    }

    pub fn snapshot(&self) -> IndexMaps {
        self.state.lock().maps.clone()
    }

    /// Both maps agree and no reverse entry is empty.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let maps = &state.maps;
        for (reference, containers) in &maps.reverse {
            if containers.is_empty() {
                return false;
            }
            for container in containers {
                if !maps
                    .forward
                    .get(container)
                    .is_some_and(|refs| refs.contains(reference))
                {
                    return false;
                }
            }
        }
        for (container, refs) in &maps.forward {
            for reference in refs {
                if !maps
                    .reverse
                    .get(reference)
                    .is_some_and(|cs| cs.contains(container))
                {
                    return false;
                }
            }
        }
        true
    }
}

fn ext_of_rel(rel: &str) -> Option<String> {
    let name_start = rel.rfind('/').map_or(0, |i| i + 1);
    rel[name_start..]
        .rfind('.')
        .map(|dot| rel[name_start + dot..].to_lowercase())
}

fn strip_ext(rel: &str) -> &str {
    let name_start = rel.rfind('/').map_or(0, |i| i + 1);
    match rel[name_start..].rfind('.') {
        Some(dot) => &rel[..name_start + dot],
        None => rel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::NoCheckout;
    use std::fs;
    use tempfile::TempDir;

    fn make_index(dir: &TempDir, config: WatchConfig) -> ReferenceIndex {
        let config = Arc::new(config);
        let writer = AtomicWriter::new(Arc::new(NoCheckout), config.dry_run);
        ReferenceIndex::new(
            dir.path().to_path_buf(),
            config,
            SignalHub::disconnected(),
            writer,
        )
        .unwrap()
    }

    #[test]
    fn test_strip_ext_and_ext_of_rel() {
        assert_eq!(strip_ext("mats/door.mtl"), "mats/door");
        assert_eq!(strip_ext("mats/door"), "mats/door");
        assert_eq!(strip_ext("mats.v2/door"), "mats.v2/door");
        assert_eq!(ext_of_rel("t/A.DDS"), Some(".dds".to_string()));
        assert_eq!(ext_of_rel("t/noext"), None);
    }

    #[test]
    fn test_upsert_and_drop_keep_maps_symmetric() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds" File="m/b.cgf"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.upsert_container(&mat);

        assert!(index.is_consistent());
        assert_eq!(
            index.references_of("mat.mtl").unwrap(),
            ["tex/a.dds", "m/b.cgf"]
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        );
        assert!(index.containers_of("tex/a.dds").unwrap().contains("mat.mtl"));

        // References that disappear on re-parse lose their reverse entries.
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        index.upsert_container(&mat);
        assert!(index.is_consistent());
        assert!(index.containers_of("m/b.cgf").is_none());

        index.drop_container(&mat);
        assert!(index.is_consistent());
        assert_eq!(index.container_count(), 0);
        assert_eq!(index.reference_count(), 0);
    }

    #[test]
    fn test_upsert_skipped_while_on_cooldown() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.set_cooldown(&mat);
        index.upsert_container(&mat);
        assert_eq!(index.container_count(), 0);

        // The cooldown entry expires, not accumulates.
        index.prune_cooldowns();
        assert!(index.is_on_cooldown(&mat));
    }

    #[test]
    fn test_unreadable_container_leaves_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.upsert_container(&mat);
        fs::remove_file(&mat).unwrap();
        index.upsert_container(&mat);

        assert!(index.containers_of("tex/a.dds").unwrap().contains("mat.mtl"));
    }

    #[test]
    fn test_rename_asset_rewrites_and_remaps() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("textures")).unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="textures/wall.dds"/>"#).unwrap();
        fs::write(dir.path().join("textures/wall.dds"), b"dds").unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.rebuild();
        index.rename_asset(
            &dir.path().join("textures/wall.dds"),
            &dir.path().join("textures/stone.dds"),
        );

        assert_eq!(
            fs::read(&mat).unwrap(),
            br#"<M Texture="textures/stone.dds"/>"#.to_vec()
        );
        assert!(index.is_consistent());
        assert!(index.containers_of("textures/wall.dds").is_none());
        assert!(index
            .containers_of("textures/stone.dds")
            .unwrap()
            .contains("mat.mtl"));
        // The rewritten container is on cooldown.
        assert!(index.is_on_cooldown(&mat));
    }

    #[test]
    fn test_rename_asset_without_listeners_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let index = make_index(&dir, WatchConfig::default());
        index.rebuild();
        index.rename_asset(
            &dir.path().join("a.dds"),
            &dir.path().join("b.dds"),
        );
        assert!(index.is_consistent());
    }

    #[test]
    fn test_rename_texture_patches_alias_extensions() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="t/a.dds"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.rebuild();
        // On disk the file is a .tif; the reference says .dds.
        index.rename_asset(&dir.path().join("t/a.tif"), &dir.path().join("t/b.tif"));

        assert_eq!(fs::read(&mat).unwrap(), br#"<M Texture="t/b.dds"/>"#.to_vec());
        assert!(index.is_consistent());
        assert!(index.containers_of("t/b.dds").unwrap().contains("mat.mtl"));
        // Only the variant that was actually referenced moved.
        assert!(index.containers_of("t/b.tif").is_none());
    }

    #[test]
    fn test_rename_texture_alias_disabled_by_allow_ext_change() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="t/a.dds"/>"#).unwrap();

        let config = WatchConfig {
            allow_ext_change: false,
            ..WatchConfig::default()
        };
        let index = make_index(&dir, config);
        index.rebuild();
        index.rename_asset(&dir.path().join("t/a.tif"), &dir.path().join("t/b.tif"));

        // Exact-extension matching only: the .dds reference is not an alias hit.
        assert_eq!(fs::read(&mat).unwrap(), br#"<M Texture="t/a.dds"/>"#.to_vec());
    }

    #[test]
    fn test_rename_material_patches_extensionless_references() {
        let dir = TempDir::new().unwrap();
        let lyr = dir.path().join("level.lyr");
        fs::write(&lyr, br#"<Obj Material="mats/door"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.rebuild();
        index.rename_asset(
            &dir.path().join("mats/door.mtl"),
            &dir.path().join("mats/gate.mtl"),
        );

        assert_eq!(
            fs::read(&lyr).unwrap(),
            br#"<Obj Material="mats/gate"/>"#.to_vec()
        );
        assert!(index.is_consistent());
        assert!(index.containers_of("mats/gate").unwrap().contains("level.lyr"));
    }

    #[test]
    fn test_rename_asset_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        let before = br#"<M Texture="textures/wall.dds"/>"#;
        fs::write(&mat, before).unwrap();

        let config = WatchConfig {
            dry_run: true,
            ..WatchConfig::default()
        };
        let index = make_index(&dir, config);
        index.rebuild();
        index.rename_asset(
            &dir.path().join("textures/wall.dds"),
            &dir.path().join("textures/stone.dds"),
        );

        assert_eq!(fs::read(&mat).unwrap(), before.to_vec());
        assert!(index.containers_of("textures/wall.dds").unwrap().contains("mat.mtl"));
        assert!(index.containers_of("textures/stone.dds").is_none());
        assert!(!index.is_on_cooldown(&mat));
    }

    #[test]
    fn test_rename_directory_patches_and_rebuilds() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tex/new")).unwrap();
        let m1 = dir.path().join("m1.mtl");
        let m2 = dir.path().join("m2.mtl");
        fs::write(&m1, br#"<M Texture="tex/old/A.dds"/>"#).unwrap();
        fs::write(&m2, br#"<M Texture="tex/old/b.dds" File="other/c.cgf"/>"#).unwrap();

        let index = make_index(&dir, WatchConfig::default());
        index.rebuild();
        index.rename_directory(&dir.path().join("tex/old"), &dir.path().join("tex/new"));

        assert_eq!(
            fs::read(&m1).unwrap(),
            br#"<M Texture="tex/new/A.dds"/>"#.to_vec()
        );
        assert_eq!(
            fs::read(&m2).unwrap(),
            br#"<M Texture="tex/new/b.dds" File="other/c.cgf"/>"#.to_vec()
        );
        assert!(index.is_consistent());
        assert!(index.containers_of("tex/old/a.dds").is_none());
        assert!(index.containers_of("tex/new/a.dds").unwrap().contains("m1.mtl"));
    }

    #[test]
    fn test_rename_directory_disabled_by_config() {
        let dir = TempDir::new().unwrap();
        let m1 = dir.path().join("m1.mtl");
        fs::write(&m1, br#"<M Texture="tex/old/a.dds"/>"#).unwrap();

        let config = WatchConfig {
            allow_dir_change: false,
            ..WatchConfig::default()
        };
        let index = make_index(&dir, config);
        index.rebuild();
        index.rename_directory(&dir.path().join("tex/old"), &dir.path().join("tex/new"));

        assert_eq!(
            fs::read(&m1).unwrap(),
            br#"<M Texture="tex/old/a.dds"/>"#.to_vec()
        );
    }
}
