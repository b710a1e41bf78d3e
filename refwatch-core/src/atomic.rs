use crate::vcs::CheckoutHook;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Writes container files so external readers observe either the old or the
/// new complete content, never a partial file.
///
/// A payload is written to `<name>.<pid>.tmp` next to the target and renamed
/// over it. The pid suffix lets concurrent tool instances share a tree.
#[derive(Clone)]
pub struct AtomicWriter {
    hook: Arc<dyn CheckoutHook>,
    dry_run: bool,
}

impl AtomicWriter {
    pub fn new(hook: Arc<dyn CheckoutHook>, dry_run: bool) -> Self {
        Self { hook, dry_run }
    }

    /// Replace `path` with `payload`. Returns whether a write happened.
    ///
    /// In dry-run mode the intended rewrite is logged and the disk is left
    /// untouched. Payload bytes are written exactly as given; no newline or
    /// encoding translation.
    pub fn write(&self, path: &Path, payload: &[u8]) -> io::Result<bool> {
        if self.dry_run {
            info!("dry-run: would rewrite {}", path.display());
            return Ok(false);
        }

        let tmp = temp_path_for(path);
        let result = self.write_via_temp(path, &tmp, payload);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map(|()| true)
    }

    fn write_via_temp(&self, path: &Path, tmp: &Path, payload: &[u8]) -> io::Result<()> {
        {
            let mut file = File::create(tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }

        if let Ok(metadata) = fs::metadata(path) {
            let perms = metadata.permissions();
            if perms.readonly() {
                ensure_writable(path, self.hook.as_ref());
            }
            // The replacement keeps the target's permissions, minus read-only.
            let mut tmp_perms = perms;
            tmp_perms.set_readonly(false);
            let _ = fs::set_permissions(tmp, tmp_perms);
        }

        match fs::rename(tmp, path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                ensure_writable(path, self.hook.as_ref());
                fs::rename(tmp, path)
            },
            Err(err) => Err(err),
        }
    }
}

/// Make `path` writable: ask the VCS hook first, then clear the read-only
/// attribute ourselves.
pub fn ensure_writable(path: &Path, hook: &dyn CheckoutHook) {
    let Ok(metadata) = fs::metadata(path) else {
        return;
    };
    if !metadata.permissions().readonly() {
        return;
    }

    if hook.checkout(path) {
        if let Ok(after) = fs::metadata(path) {
            if !after.permissions().readonly() {
                return;
            }
        }
    }

    let mut perms = metadata.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    match fs::set_permissions(path, perms) {
        Ok(()) => info!("cleared read-only attribute: {}", path.display()),
        Err(err) => warn!("failed to clear read-only on {}: {err}", path.display()),
    }
}

/// `<name>.<pid>.tmp` beside the target.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, ToOwned::to_owned);
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Remove temp files left behind by a crashed instance. Returns the count.
pub fn clean_orphan_temps(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_orphan_temp(&name) && fs::remove_file(entry.path()).is_ok() {
            debug!("removed orphan temp: {}", entry.path().display());
            removed += 1;
        }
    }
    removed
}

fn is_orphan_temp(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".tmp") else {
        return false;
    };
    let Some((rest, pid)) = stem.rsplit_once('.') else {
        return false;
    };
    !rest.is_empty() && !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::NoCheckout;
    use tempfile::TempDir;

    fn writer(dry_run: bool) -> AtomicWriter {
        AtomicWriter::new(Arc::new(NoCheckout), dry_run)
    }

    #[test]
    fn test_temp_path_keeps_full_name() {
        let tmp = temp_path_for(Path::new("/proj/mats/door.mtl"));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("door.mtl."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_is_orphan_temp() {
        assert!(is_orphan_temp("door.mtl.4242.tmp"));
        assert!(!is_orphan_temp("door.mtl"));
        assert!(!is_orphan_temp("door.tmp"));
        assert!(!is_orphan_temp("door.mtl.notapid.tmp"));
    }

    #[test]
    fn test_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mat.mtl");
        fs::write(&target, b"old").unwrap();

        assert!(writer(false).write(&target, b"new").unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"new");
        // No temp left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_creates_missing_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("fresh.lua");
        assert!(writer(false).write(&target, b"print()").unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"print()");
    }

    #[test]
    fn test_write_clears_read_only_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("locked.mtl");
        fs::write(&target, b"old").unwrap();
        let mut perms = fs::metadata(&target).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&target, perms).unwrap();

        assert!(writer(false).write(&target, b"new").unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!fs::metadata(&target).unwrap().permissions().readonly());
    }

    #[test]
    fn test_dry_run_leaves_disk_untouched() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mat.mtl");
        fs::write(&target, b"old").unwrap();

        assert!(!writer(true).write(&target, b"new").unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_clean_orphan_temps() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mtl.999.tmp"), b"junk").unwrap();
        fs::write(dir.path().join("keep.mtl"), b"real").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.lua.1.tmp"), b"junk").unwrap();

        assert_eq!(clean_orphan_temps(dir.path()), 2);
        assert!(dir.path().join("keep.mtl").exists());
        assert!(!dir.path().join("a.mtl.999.tmp").exists());
        assert!(!dir.path().join("sub/b.lua.1.tmp").exists());
    }
}
