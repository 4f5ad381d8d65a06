//! Append-only audit logs for read and sent messages.
//!
//! One file per minute bucket, `{prefix}-{yyyyMMdd-HH-mm}.log`, one flattened
//! record per line. Old buckets are removed by [`sweep`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::debug;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::core::Result;

const BUCKET_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]-[hour]-[minute]");
const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    prefix: &'static str,
}

impl AuditLog {
    pub fn open(dir: impl Into<PathBuf>, prefix: &'static str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, prefix })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bucket_path(&self, at: OffsetDateTime) -> PathBuf {
        let bucket = at.format(BUCKET_FORMAT).unwrap_or_default();
        self.dir
            .join(format!("{}-{bucket}.{LOG_EXTENSION}", self.prefix))
    }

    /// Appends one line to the bucket for `at`. Line breaks inside `line` are
    /// the caller's responsibility.
    pub fn append(&self, line: &str, at: OffsetDateTime) -> Result<()> {
        let path = self.bucket_path(at);
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }
}

/// Deletes `*.log` files in `dir` last modified more than `retention` before
/// `now`. Returns the removed paths.
pub fn sweep(dir: &Path, retention: Duration, now: SystemTime) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > retention {
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    removed.sort();
    debug!("swept {} audit logs from {}", removed.len(), dir.display());
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn appends_into_minute_buckets() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("read"), "read").unwrap();
        let at = datetime!(2024-03-24 14:21:05 UTC);
        log.append("one", at).unwrap();
        log.append("two", at + time::Duration::seconds(20)).unwrap();
        log.append("three", at + time::Duration::minutes(1)).unwrap();

        let first = dir.path().join("read").join("read-20240324-14-21.log");
        assert_eq!(fs::read_to_string(&first).unwrap(), "one\ntwo\n");
        let second = dir.path().join("read").join("read-20240324-14-22.log");
        assert_eq!(fs::read_to_string(&second).unwrap(), "three\n");
    }

    #[test]
    fn sweep_removes_only_expired_logs() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let old = dir.path().join("read-20240101-00-00.log");
        let fresh = dir.path().join("read-20240103-00-00.log");
        let other = dir.path().join("notes.txt");
        for path in [&old, &fresh, &other] {
            fs::write(path, "x\n").unwrap();
        }
        let aged = now - Duration::from_secs(72 * 3600);
        File::options().write(true).open(&old).unwrap().set_modified(aged).unwrap();
        File::options().write(true).open(&other).unwrap().set_modified(aged).unwrap();

        let removed = sweep(dir.path(), Duration::from_secs(48 * 3600), now).unwrap();
        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }
}
