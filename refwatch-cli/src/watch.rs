use crate::cli::WatchArgs;
use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use refwatch_core::{
    CheckoutHook, NoCheckout, PerforceCheckout, Severity, Signal, SignalHub, WatchBackend,
    WatchConfig, WatcherService,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn handle_watch(root: &Path, args: &WatchArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => WatchConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatchConfig::default(),
    };
    if args.dry_run {
        config.dry_run = true;
    }
    if args.poll {
        config.backend = WatchBackend::Poll;
    }
    if args.no_texture_aliases {
        config.match_any_texture_extension = false;
    }
    if args.no_dir_renames {
        config.allow_dir_change = false;
    }
    if args.exact_extension {
        config.allow_ext_change = false;
    }

    let root = root
        .canonicalize()
        .with_context(|| format!("Project root not accessible: {}", root.display()))?;

    let hook: Arc<dyn CheckoutHook> = if args.no_vcs {
        Arc::new(NoCheckout)
    } else {
        Arc::new(PerforceCheckout)
    };

    let (hub, signals) = SignalHub::new();
    let handle = WatcherService::new(root, Arc::new(config), hub)
        .with_hook(hook)
        .spawn()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            eprintln!("\nReceived SIGINT. Shutting down...");
            flag.store(true, Ordering::SeqCst);
        })
        .context("Error setting SIGINT handler")?;
    }

    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            handle.stop();
        }
        match signals.recv_timeout(Duration::from_millis(200)) {
            Ok(signal) => {
                if !render_signal(&signal) {
                    break;
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    handle.join();
    Ok(())
}

/// Print a signal for the terminal; returns `false` once the watcher is done.
fn render_signal(signal: &Signal) -> bool {
    match signal {
        Signal::IndexingStarted => println!("Indexing project..."),
        Signal::IndexingFinished => println!("Index ready."),
        Signal::ProgressUpdated { current, total } => println!("  indexed {current}/{total}"),
        Signal::Log { severity, message } => match severity {
            Severity::Info => println!("{message}"),
            Severity::Warning => eprintln!("warning: {message}"),
            Severity::Error => eprintln!("error: {message}"),
        },
        Signal::CriticalError { title, message } => eprintln!("fatal: {title}: {message}"),
        Signal::WatcherStopped => {
            println!("Watcher stopped.");
            return false;
        },
    }
    true
}
