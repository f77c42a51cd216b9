use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

use vidgrid::cli::Args;
use vidgrid::config::{CONFIG_FILE, EngineConfig};
use vidgrid::core::{Engine, FolderEvent, FolderLoader, FolderSnapshot, ItemState, Phase};
use vidgrid::entities::{Outcome, Unavailable, default_extractor};
use vidgrid::paths::{self, PathConfig};
use vidgrid::utils::{format_duration, format_size};

/// Give up when nothing at all happened for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let config_path = paths::config_file(CONFIG_FILE, &path_config);
    let mut config = EngineConfig::load(&config_path)?;
    args.apply(&mut config);
    let config = config.normalized();
    debug!("Effective config: {:?}", config);

    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)
            .with_context(|| format!("Failed to create output folder: {}", out.display()))?;
    }

    let engine = Engine::new(&config, default_extractor());
    let loader = FolderLoader::new(engine.clone(), &config.folder);

    let started = Instant::now();
    let events = loader.load_folder(&args.dir);
    let result = drive(&loader, &events, args.page.max(1), args.out.as_deref());

    let snapshot = loader.snapshot();
    print_table(&snapshot);
    let stats = engine.stats();
    info!(
        "Done in {:?} ({}): {} extracted, {} cache hits, {} failed",
        started.elapsed(),
        engine.backend(),
        stats.thumbnails.produced,
        stats.thumbnails.cache_hits,
        stats.thumbnails.failed
    );
    engine.shutdown();
    result
}

/// Initialize logger: 0 = warn, -v = info, -vv = debug, -vvv+ = trace
fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::data_file("vidgrid.log", path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Act as a scrolling grid: one page visible at a time, next page once
/// every visible item settled.
fn drive(
    loader: &FolderLoader,
    events: &Receiver<FolderEvent>,
    page: usize,
    out: Option<&Path>,
) -> Result<()> {
    loop {
        let event = match events.recv_timeout(IDLE_TIMEOUT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                warn!("No progress for {:?}, giving up", IDLE_TIMEOUT);
                return Ok(());
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };

        let mut refused = false;
        match event {
            FolderEvent::Listed {
                files,
                truncated_from,
                ..
            } => {
                match truncated_from {
                    Some(total) => info!("Listing {} of {} files", files.len(), total),
                    None => info!("Listing {} files", files.len()),
                }
                loader.set_visible(0..page);
            }
            FolderEvent::Failed { error, .. } => bail!(error),
            FolderEvent::Metadata { outcome, .. } => {
                refused = is_refusal(&outcome);
            }
            FolderEvent::Thumbnail { index, outcome, .. } => {
                refused = is_refusal(&outcome);
                if let (Some(out), Outcome::Available(thumb)) = (out, &outcome) {
                    let snapshot = loader.snapshot();
                    if let Some(item) = snapshot.items.get(index) {
                        let path = out.join(format!("{}.png", item.entry.name));
                        if let Err(e) = thumb.save_png(&path) {
                            warn!("Failed to write {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }

        let snapshot = loader.snapshot();
        if snapshot.phase != Phase::Populated {
            continue;
        }
        if snapshot.pending_visible() == 0 {
            let end = snapshot.visible.end;
            if end >= snapshot.items.len() {
                return Ok(());
            }
            debug!("Page done, showing {}..{}", end, end + page);
            loader.set_visible(end..end + page);
        } else if !refused && has_refused(&snapshot) {
            // Something finished, so there is room again: re-ask for refused items
            loader.set_visible(snapshot.visible.clone());
        }
    }
}

fn is_refusal<T>(outcome: &Outcome<T>) -> bool {
    matches!(outcome.reason(), Some(Unavailable::Busy | Unavailable::Expired))
}

fn has_refused(snapshot: &FolderSnapshot) -> bool {
    let refused = |state: Option<Unavailable>| matches!(state, Some(Unavailable::Busy | Unavailable::Expired));
    snapshot.items.iter().any(|item| {
        refused(state_reason(&item.metadata)) || refused(state_reason(&item.thumbnail))
    })
}

fn state_reason<T>(state: &ItemState<T>) -> Option<Unavailable> {
    match state {
        ItemState::Unavailable(reason) => Some(*reason),
        _ => None,
    }
}

fn print_table(snapshot: &FolderSnapshot) {
    if let Some(folder) = &snapshot.folder {
        println!("{}", folder.display());
    }
    println!(
        "{:<40} {:>10} {:>9} {:>11} {:>7}  {}",
        "NAME", "SIZE", "DURATION", "RESOLUTION", "FPS", "THUMBNAIL"
    );

    for item in &snapshot.items {
        let (duration, resolution, fps) = match &item.metadata {
            ItemState::Available(meta) if meta.width > 0 => (
                format_duration(meta.duration()),
                format!("{}x{}", meta.width, meta.height),
                format!("{:.2}", meta.fps),
            ),
            ItemState::Available(meta) => (format_duration(meta.duration()), "-".into(), "-".into()),
            _ => (format_duration(None), "-".into(), "-".into()),
        };
        let thumbnail = match &item.thumbnail {
            ItemState::Available(thumb) => format!(
                "{}x{} @ {:.1}s",
                thumb.width(),
                thumb.height(),
                thumb.offset_secs()
            ),
            ItemState::Unavailable(reason) => reason.to_string(),
            ItemState::Loading => "loading".into(),
            ItemState::NotRequested => "-".into(),
        };
        println!(
            "{:<40} {:>10} {:>9} {:>11} {:>7}  {}",
            item.entry.name,
            format_size(item.entry.size_bytes),
            duration,
            resolution,
            fps,
            thumbnail
        );
    }

    if let Some(total) = snapshot.truncated_from {
        println!("({} of {} files shown)", snapshot.items.len(), total);
    }
}
