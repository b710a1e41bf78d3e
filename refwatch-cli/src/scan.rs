use anyhow::{Context, Result};
use refwatch_core::builder;
use refwatch_core::{HandlerSet, Signal, SignalHub, WatchConfig};
use serde::Serialize;
use std::path::Path;
use std::thread;

#[derive(Serialize)]
struct ScanSummary {
    root: String,
    containers: usize,
    references: usize,
}

pub fn handle_scan(root: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => WatchConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatchConfig::default(),
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("Project root not accessible: {}", root.display()))?;

    let handlers = HandlerSet::new(&config.tracked).context("Invalid tracked extension set")?;

    let (hub, rx) = SignalHub::new();
    let printer = (!json).then(|| {
        thread::spawn(move || {
            for signal in rx {
                match signal {
                    Signal::ProgressUpdated { current, total } => {
                        eprintln!("  indexed {current}/{total}");
                    },
                    Signal::Log { message, .. } => eprintln!("{message}"),
                    _ => {},
                }
            }
        })
    });

    let maps = builder::build_maps(&root, &handlers, &hub);
    drop(hub);
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    let summary = ScanSummary {
        root: root.display().to_string(),
        containers: maps.forward.len(),
        references: maps.reverse.len(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}: {} container file(s), {} distinct reference(s)",
            summary.root, summary.containers, summary.references
        );
    }
    Ok(())
}
