//! Directory enumeration for the folder pipeline
//!
//! Non-recursive. Keeps regular files (symlinks followed) whose extension is
//! in the allowed list, case-insensitively, then filters, sorts and caps.
//! The cap is applied after sorting, so the same folder always yields the
//! same first N files.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::entities::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Modified,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// One listed video file
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: FileId,
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
    /// Not every filesystem records creation time
    pub created: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Lowercase, without the dot
    pub extensions: Vec<String>,
    pub filter: Option<String>,
    pub sort: SortKey,
    pub order: SortOrder,
    pub max_files: Option<usize>,
}

impl ScanOptions {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| {
                let ext = s.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    fn matches_filter(&self, name: &str) -> bool {
        match &self.filter {
            Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Scan result: files in display order
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub files: Vec<FileEntry>,
    /// Matching count before the cap, when the cap cut the list
    pub truncated_from: Option<usize>,
}

/// Directory enumeration errors
#[derive(Debug)]
pub enum ScanError {
    NotFound(PathBuf),
    NotADirectory(PathBuf),
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::NotFound(p) => write!(f, "Folder not found: {}", p.display()),
            ScanError::NotADirectory(p) => write!(f, "Not a folder: {}", p.display()),
            ScanError::Io { path, source } => {
                write!(f, "Cannot read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// List video files in `dir` according to `opts`.
pub fn scan_dir(dir: &Path, opts: &ScanOptions) -> Result<Listing, ScanError> {
    let meta = fs::metadata(dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ScanError::NotFound(dir.to_path_buf()),
        _ => ScanError::Io {
            path: dir.to_path_buf(),
            source: e,
        },
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|e| ScanError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if !opts.accepts(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !opts.matches_filter(&name) {
            continue;
        }
        // fs::metadata follows symlinks; entry.metadata() would not
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        files.push(FileEntry {
            id: FileId::new(&path),
            name,
            size_bytes: meta.len(),
            modified: meta.modified().ok(),
            created: meta.created().ok(),
        });
    }

    sort_entries(&mut files, opts.sort, opts.order);

    let total = files.len();
    let truncated_from = match opts.max_files {
        Some(max) if total > max => {
            files.truncate(max);
            Some(total)
        }
        _ => None,
    };

    trace!(
        "Scanned {}: {} files{}",
        dir.display(),
        files.len(),
        truncated_from
            .map(|t| format!(" (of {})", t))
            .unwrap_or_default()
    );
    Ok(Listing {
        files,
        truncated_from,
    })
}

/// Sort by `key`, ties broken by name then path so the order is total.
pub fn sort_entries(files: &mut [FileEntry], key: SortKey, order: SortOrder) {
    files.sort_by(|a, b| {
        let primary = match key {
            SortKey::Name => Ordering::Equal,
            SortKey::Size => a.size_bytes.cmp(&b.size_bytes),
            SortKey::Modified => a.modified.cmp(&b.modified),
            SortKey::Created => a.created.cmp(&b.created),
        };
        let ord = primary
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id));
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts() -> ScanOptions {
        ScanOptions {
            extensions: vec!["mp4".into(), "mkv".into()],
            ..ScanOptions::default()
        }
    }

    fn names(listing: &Listing) -> Vec<&str> {
        listing.files.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_filters_by_extension_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mp4", "A.MKV", "notes.txt", "noext"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.mp4")).unwrap();

        let listing = scan_dir(dir.path(), &opts()).unwrap();
        assert_eq!(names(&listing), vec!["A.MKV", "b.mp4"]);
        assert_eq!(listing.truncated_from, None);
    }

    #[test]
    fn test_sort_by_size_descending_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        for (name, size) in [("small.mp4", 1), ("big.mp4", 300), ("mid.mp4", 20), ("tiny.mp4", 0)] {
            fs::write(dir.path().join(name), vec![0u8; size]).unwrap();
        }

        let listing = scan_dir(
            dir.path(),
            &ScanOptions {
                sort: SortKey::Size,
                order: SortOrder::Descending,
                max_files: Some(2),
                ..opts()
            },
        )
        .unwrap();
        assert_eq!(names(&listing), vec!["big.mp4", "mid.mp4"]);
        assert_eq!(listing.truncated_from, Some(4));
    }

    #[test]
    fn test_cap_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            fs::write(dir.path().join(format!("clip{:02}.mp4", i)), b"x").unwrap();
        }
        let capped = ScanOptions {
            max_files: Some(5),
            ..opts()
        };

        let first = scan_dir(dir.path(), &capped).unwrap();
        let second = scan_dir(dir.path(), &capped).unwrap();
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first)[0], "clip00.mp4");
    }

    #[test]
    fn test_name_filter() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Holiday.mp4", "work.mp4", "holiday2.mkv"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let listing = scan_dir(
            dir.path(),
            &ScanOptions {
                filter: Some("HOLI".into()),
                ..opts()
            },
        )
        .unwrap();
        assert_eq!(names(&listing), vec!["Holiday.mp4", "holiday2.mkv"]);
    }

    #[test]
    fn test_sort_by_modified_ties_by_name() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let entry = |name: &str, secs: u64| FileEntry {
            id: FileId::from_raw(format!("/v/{}", name)),
            name: name.to_string(),
            size_bytes: 0,
            modified: Some(t0 + Duration::from_secs(secs)),
            created: None,
        };
        let mut files = vec![entry("c.mp4", 5), entry("b.mp4", 1), entry("a.mp4", 5)];

        sort_entries(&mut files, SortKey::Modified, SortOrder::Ascending);
        let order: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, vec!["b.mp4", "a.mp4", "c.mp4"]);
    }

    #[test]
    fn test_scan_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(scan_dir(&missing, &opts()), Err(ScanError::NotFound(_))));

        let file = dir.path().join("file.mp4");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(scan_dir(&file, &opts()), Err(ScanError::NotADirectory(_))));
    }
}
