use clap::Parser;
use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::utils::scan::{SortKey, SortOrder};

// Extractor backend info (compile-time)
#[cfg(feature = "ffmpeg")]
const EXTRACTOR_BACKEND: &str = "playa-ffmpeg 8.0 (static, in-process)";
#[cfg(not(feature = "ffmpeg"))]
const EXTRACTOR_BACKEND: &str = "ffmpeg/ffprobe command-line tools";

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Video:  ", EXTRACTOR_BACKEND, "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Thumbnail and metadata browser for folders of video files
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Folder to load
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Write each thumbnail as PNG into this folder
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Sort key (default from config: name)
    #[arg(short = 's', long = "sort", value_enum)]
    pub sort: Option<SortKey>,

    /// Sort descending
    #[arg(short = 'd', long = "desc")]
    pub descending: bool,

    /// Only list files whose name contains this text (case-insensitive)
    #[arg(long = "filter", value_name = "TEXT")]
    pub filter: Option<String>,

    /// List at most N files (applied after sorting)
    #[arg(short = 'n', long = "max-files", value_name = "N")]
    pub max_files: Option<usize>,

    /// Concurrent thumbnail extractions (default: half the CPUs, 1..4)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Primary extraction deadline in milliseconds
    #[arg(short = 't', long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Items marked visible at a time, like one screen of a grid
    #[arg(long = "page", value_name = "N", default_value_t = 32)]
    pub page: usize,

    /// Enable debug logging to file (default: vidgrid.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    /// Overlay command-line values on the loaded config
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(sort) = self.sort {
            config.folder.sort = sort;
        }
        if self.descending {
            config.folder.order = SortOrder::Descending;
        }
        if let Some(filter) = &self.filter {
            config.folder.filter = Some(filter.clone());
        }
        if let Some(max) = self.max_files {
            config.folder.max_files = Some(max);
        }
        if let Some(workers) = self.workers {
            config.thumbnails.max_concurrent = workers;
        }
        if let Some(ms) = self.timeout_ms {
            config.thumbnails.primary_timeout_ms = ms;
            // Retry keeps its ratio to the primary deadline
            config.thumbnails.retry_timeout_ms = (ms / 2).max(1);
        }
    }
}
