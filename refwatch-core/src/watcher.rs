use crate::atomic::{clean_orphan_temps, AtomicWriter};
use crate::config::{WatchBackend, WatchConfig};
use crate::error::{Error, Result};
use crate::handlers;
use crate::index::ReferenceIndex;
use crate::signals::{Signal, SignalHub};
use crate::vcs::{CheckoutHook, PerforceCheckout};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Window within which a delete followed by a create of the same basename is
/// treated as one rename.
pub const MOVE_RECON_WINDOW: Duration = Duration::from_secs(1);

/// Idle tick used to expire pending deletions and prune cooldowns.
const TICK: Duration = Duration::from_millis(250);

/// Poll interval for the portable backend.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Classifies raw filesystem events and drives the [`ReferenceIndex`].
///
/// Host filesystems deliver a rename as a `moved` pair, as unpaired rename
/// halves, or as delete+create; editors add their own temp-file dances on
/// top. Deletions are therefore deferred one [`MOVE_RECON_WINDOW`]: if the
/// matching create never shows up the container is really gone, otherwise
/// the pair collapses into a single move and no reference ever leaves the
/// index in between.
pub struct EventDispatcher {
    index: Arc<ReferenceIndex>,
    config: Arc<WatchConfig>,
    pending: HashMap<OsString, (PathBuf, Instant)>,
}

impl EventDispatcher {
    pub fn new(index: Arc<ReferenceIndex>, config: Arc<WatchConfig>) -> Self {
        Self {
            index,
            config,
            pending: HashMap::new(),
        }
    }

    pub fn index(&self) -> &Arc<ReferenceIndex> {
        &self.index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dispatch(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.on_created(path);
                }
            },
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.on_rename_event(*mode, &event.paths);
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.on_modified(path);
                }
            },
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_deleted(path);
                }
            },
            _ => {},
        }
    }

    fn on_rename_event(&mut self, mode: RenameMode, paths: &[PathBuf]) {
        match (mode, paths) {
            (RenameMode::Both | RenameMode::Any | RenameMode::Other, [src, dst]) => {
                self.on_moved(src, dst);
            },
            (RenameMode::From, _) => {
                for path in paths {
                    self.on_deleted(path);
                }
            },
            (RenameMode::To, _) => {
                for path in paths {
                    self.on_created(path);
                }
            },
            // Unpaired half with unknown direction: existence decides.
            _ => {
                for path in paths {
                    if path.exists() {
                        self.on_created(path);
                    } else {
                        self.on_deleted(path);
                    }
                }
            },
        }
    }

    pub fn on_created(&mut self, path: &Path) {
        if let Some(base) = path.file_name() {
            if let Some((old_path, seen)) = self.pending.remove(base) {
                if seen.elapsed() < MOVE_RECON_WINDOW {
                    self.reconcile_move(&old_path, path);
                    return;
                }
                // Too old to be the other half of a move.
                self.apply_deferred_drop(&old_path);
            }
        }
        if path.is_dir() {
            return;
        }
        if handlers::is_container_path(path) {
            self.index.upsert_container(path);
        }
    }

    pub fn on_modified(&mut self, path: &Path) {
        if path.is_dir() {
            return;
        }
        if handlers::is_container_path(path) {
            self.index.upsert_container(path);
        }
    }

    pub fn on_deleted(&mut self, path: &Path) {
        let tracked = self.config.is_tracked_path(path);
        if !tracked && !handlers::is_container_path(path) {
            return;
        }
        let Some(base) = path.file_name() else {
            return;
        };
        self.pending
            .insert(base.to_os_string(), (path.to_path_buf(), Instant::now()));
    }

    pub fn on_moved(&mut self, src: &Path, dst: &Path) {
        if dst.is_dir() {
            self.index.rename_directory(src, dst);
            return;
        }
        if self.config.is_tracked_path(src) {
            self.index.rename_asset(src, dst);
        }
        if handlers::is_container_path(src) && !self.index.is_on_cooldown(dst) {
            if src != dst {
                self.index.drop_container(src);
            }
            self.index.upsert_container(dst);
        }
    }

    fn reconcile_move(&mut self, old_path: &Path, new_path: &Path) {
        debug!(
            "reconstructed move: {} -> {}",
            old_path.display(),
            new_path.display()
        );
        if old_path == new_path {
            // Editor atomic save: the same path deleted and recreated is one
            // container update, not a delete-then-reindex gap.
            if handlers::is_container_path(new_path) && !self.index.is_on_cooldown(new_path) {
                self.index.upsert_container(new_path);
            }
            return;
        }
        self.on_moved(old_path, new_path);
    }

    fn apply_deferred_drop(&mut self, path: &Path) {
        if handlers::is_container_path(path) && !self.index.is_on_cooldown(path) {
            self.index.drop_container(path);
        }
    }

    /// Settle pending deletions whose reconnaissance window has passed and
    /// prune stale cooldowns.
    pub fn flush_expired(&mut self) {
        let expired: Vec<OsString> = self
            .pending
            .iter()
            .filter(|(_, (_, seen))| seen.elapsed() >= MOVE_RECON_WINDOW)
            .map(|(base, _)| base.clone())
            .collect();
        for base in expired {
            if let Some((path, _)) = self.pending.remove(&base) {
                self.apply_deferred_drop(&path);
            }
        }
        self.index.prune_cooldowns();
    }

    /// Settle every pending deletion immediately; used on shutdown.
    pub fn flush_all(&mut self) {
        let paths: Vec<PathBuf> = self.pending.drain().map(|(_, (path, _))| path).collect();
        for path in paths {
            self.apply_deferred_drop(&path);
        }
    }
}

/// Owns the watching session: initial index build, event loop, shutdown.
pub struct WatcherService {
    root: PathBuf,
    config: Arc<WatchConfig>,
    signals: SignalHub,
    hook: Arc<dyn CheckoutHook>,
}

impl WatcherService {
    pub fn new(root: PathBuf, config: Arc<WatchConfig>, signals: SignalHub) -> Self {
        Self {
            root,
            config,
            signals,
            hook: Arc::new(PerforceCheckout),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CheckoutHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Start the watcher thread. Fails fast when the project root is gone.
    pub fn spawn(self) -> Result<WatcherHandle> {
        if !self.root.is_dir() {
            return Err(Error::MissingRoot(self.root));
        }
        let (stop_tx, stop_rx) = unbounded();
        let thread = thread::Builder::new()
            .name("refwatch-watcher".to_string())
            .spawn(move || self.run(&stop_rx))
            .map_err(Error::Io)?;
        Ok(WatcherHandle {
            stop_tx,
            thread: Some(thread),
        })
    }

    fn run(self, stop_rx: &Receiver<()>) {
        let removed = clean_orphan_temps(&self.root);
        if removed > 0 {
            info!("cleaned {removed} orphan temp file(s)");
        }

        let writer = AtomicWriter::new(self.hook.clone(), self.config.dry_run);
        let index = match ReferenceIndex::new(
            self.root.clone(),
            self.config.clone(),
            self.signals.clone(),
            writer,
        ) {
            Ok(index) => Arc::new(index),
            Err(err) => {
                self.signals
                    .critical_error("Watcher Error", err.to_string());
                self.signals.emit(Signal::WatcherStopped);
                return;
            },
        };

        self.signals.emit(Signal::IndexingStarted);
        index.rebuild();
        self.signals.emit(Signal::IndexingFinished);
        if stop_rx.try_recv().is_ok() {
            self.signals.emit(Signal::WatcherStopped);
            return;
        }

        let (event_tx, event_rx) = unbounded();
        let mut backend = match make_watcher(self.config.backend, event_tx) {
            Ok(backend) => backend,
            Err(err) => {
                self.signals
                    .critical_error("Watcher Error", format!("Backend failed to start: {err}"));
                self.signals.emit(Signal::WatcherStopped);
                return;
            },
        };
        if let Err(err) = backend.watch(&self.root, RecursiveMode::Recursive) {
            self.signals.critical_error(
                "Watcher Error",
                format!("Could not watch '{}': {err}", self.root.display()),
            );
            self.signals.emit(Signal::WatcherStopped);
            return;
        }

        info!("watching {} for file changes", self.root.display());
        self.signals
            .info(format!("Watching '{}' for file changes...", self.root.display()));

        let mut dispatcher = EventDispatcher::new(index, self.config.clone());
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(event_rx) -> msg => match msg {
                    Ok(Ok(event)) => dispatcher.dispatch(&event),
                    Ok(Err(err)) => {
                        warn!("watch backend error: {err}");
                        self.signals.warning(format!("Watch error: {err}"));
                    },
                    Err(_) => break,
                },
                default(TICK) => {
                    if !self.root.exists() {
                        self.signals.critical_error(
                            "Watcher Error",
                            format!("Project root vanished: {}", self.root.display()),
                        );
                        break;
                    }
                    dispatcher.flush_expired();
                },
            }
        }

        // Drain in-flight events, then settle deferred deletions.
        let _ = backend.unwatch(&self.root);
        drop(backend);
        while let Ok(msg) = event_rx.try_recv() {
            if let Ok(event) = msg {
                dispatcher.dispatch(&event);
            }
        }
        dispatcher.flush_all();
        info!("watcher stopped");
        self.signals.emit(Signal::WatcherStopped);
    }
}

fn make_watcher(
    backend: WatchBackend,
    tx: Sender<notify::Result<Event>>,
) -> notify::Result<Box<dyn Watcher>> {
    match backend {
        WatchBackend::Recommended => {
            let watcher = RecommendedWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                notify::Config::default(),
            )?;
            Ok(Box::new(watcher))
        },
        WatchBackend::Poll => {
            let watcher = PollWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                notify::Config::default().with_poll_interval(POLL_INTERVAL),
            )?;
            Ok(Box::new(watcher))
        },
    }
}

/// Stops and joins the watcher thread; dropping the handle does the same.
pub struct WatcherHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::NoCheckout;
    use std::fs;
    use tempfile::TempDir;

    fn dispatcher_over(dir: &TempDir) -> EventDispatcher {
        let config = Arc::new(WatchConfig::default());
        let writer = AtomicWriter::new(Arc::new(NoCheckout), false);
        let index = Arc::new(
            ReferenceIndex::new(
                dir.path().to_path_buf(),
                config.clone(),
                SignalHub::disconnected(),
                writer,
            )
            .unwrap(),
        );
        index.rebuild();
        EventDispatcher::new(index, config)
    }

    #[test]
    fn test_created_container_is_indexed() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        dispatcher.on_created(&mat);

        assert!(dispatcher
            .index()
            .containers_of("tex/a.dds")
            .unwrap()
            .contains("mat.mtl"));
    }

    #[test]
    fn test_editor_atomic_save_keeps_references_visible() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        // Save cycle: delete+create of the same path.
        dispatcher.on_deleted(&mat);
        // The drop is deferred, so the reference never leaves the index.
        assert!(dispatcher.index().containers_of("tex/a.dds").is_some());

        fs::write(&mat, br#"<M Texture="tex/a.dds" File="m/new.cgf"/>"#).unwrap();
        dispatcher.on_created(&mat);

        assert_eq!(dispatcher.pending_len(), 0);
        assert!(dispatcher
            .index()
            .containers_of("m/new.cgf")
            .unwrap()
            .contains("mat.mtl"));
        assert!(dispatcher.index().is_consistent());
    }

    #[test]
    fn test_move_reconstructed_from_delete_and_create() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="a/wall.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        // wall.dds moved a/ -> b/, emitted as delete then create.
        fs::write(dir.path().join("b/wall.dds"), b"dds").unwrap();
        dispatcher.on_deleted(&dir.path().join("a/wall.dds"));
        dispatcher.on_created(&dir.path().join("b/wall.dds"));

        assert_eq!(
            fs::read(&mat).unwrap(),
            br#"<M Texture="b/wall.dds"/>"#.to_vec()
        );
        assert!(dispatcher
            .index()
            .containers_of("b/wall.dds")
            .unwrap()
            .contains("mat.mtl"));
        assert!(dispatcher.index().is_consistent());
    }

    #[test]
    fn test_container_move_updates_both_sides() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.mtl");
        fs::write(&old, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        let new = dir.path().join("new.mtl");
        fs::rename(&old, &new).unwrap();
        dispatcher.on_moved(&old, &new);

        assert!(dispatcher.index().references_of("old.mtl").is_none());
        let holders = dispatcher.index().containers_of("tex/a.dds").unwrap();
        assert!(holders.contains("new.mtl"));
        assert!(!holders.contains("old.mtl"));
    }

    #[test]
    fn test_expired_pending_deletion_drops_container() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        dispatcher.on_deleted(&mat);
        assert_eq!(dispatcher.pending_len(), 1);
        // Still indexed while the window is open.
        assert!(dispatcher.index().containers_of("tex/a.dds").is_some());

        std::thread::sleep(MOVE_RECON_WINDOW + Duration::from_millis(100));
        dispatcher.flush_expired();

        assert_eq!(dispatcher.pending_len(), 0);
        assert!(dispatcher.index().containers_of("tex/a.dds").is_none());
    }

    #[test]
    fn test_flush_all_settles_immediately() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        dispatcher.on_deleted(&mat);
        dispatcher.flush_all();
        assert!(dispatcher.index().containers_of("tex/a.dds").is_none());
    }

    #[test]
    fn test_modified_on_cooldown_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mat = dir.path().join("mat.mtl");
        fs::write(&mat, br#"<M Texture="tex/a.dds"/>"#).unwrap();
        let mut dispatcher = dispatcher_over(&dir);

        dispatcher.index().set_cooldown(&mat);
        fs::write(&mat, br#"<M Texture="tex/other.dds"/>"#).unwrap();
        dispatcher.on_modified(&mat);

        // The index still reflects the pre-cooldown state.
        assert!(dispatcher.index().containers_of("tex/a.dds").is_some());
        assert!(dispatcher.index().containers_of("tex/other.dds").is_none());
    }

    #[test]
    fn test_untracked_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher_over(&dir);
        let note = dir.path().join("readme.txt");
        fs::write(&note, b"hi").unwrap();

        dispatcher.on_created(&note);
        dispatcher.on_deleted(&note);
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(dispatcher.index().container_count(), 0);
    }
}
