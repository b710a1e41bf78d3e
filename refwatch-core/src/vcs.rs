use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum time a checkout subprocess may run before being killed.
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Version-control hook invoked before overwriting a read-only file.
///
/// Game projects typically live in Perforce, where every file is read-only
/// until checked out. The core never hard-depends on a specific VCS; it asks
/// the hook and falls back to clearing the read-only attribute itself.
pub trait CheckoutHook: Send + Sync {
    /// Attempt to make `path` writable through the VCS.
    ///
    /// Returns `true` when the checkout succeeded and the file should now be
    /// writable. A missing VCS client is not an error, just `false`.
    fn checkout(&self, path: &Path) -> bool;
}

/// Hook that never checks anything out.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckout;

impl CheckoutHook for NoCheckout {
    fn checkout(&self, _path: &Path) -> bool {
        false
    }
}

/// Perforce checkout via `p4 edit <path>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerforceCheckout;

impl CheckoutHook for PerforceCheckout {
    fn checkout(&self, path: &Path) -> bool {
        let child = Command::new("p4")
            .arg("edit")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                // p4 not installed or not in PATH.
                debug!("p4 unavailable: {err}");
                return false;
            },
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        info!("checked out via p4: {}", path.display());
                        return true;
                    }
                    return false;
                },
                Ok(None) => {
                    if started.elapsed() >= CHECKOUT_TIMEOUT {
                        warn!("p4 edit timed out for {}", path.display());
                        let _ = child.kill();
                        let _ = child.wait();
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                },
                Err(err) => {
                    warn!("p4 edit failed for {}: {err}", path.display());
                    return false;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_checkout_always_declines() {
        assert!(!NoCheckout.checkout(Path::new("/tmp/anything.mtl")));
    }
}
