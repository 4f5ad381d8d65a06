//! Directory-backed ordered store.
//!
//! One file per item, named so that lexicographic order is queue order. The
//! in-memory index mirrors the directory and is rebuilt from it on open, which
//! is what makes unacknowledged work survive a crash.
//!
//! ```text
//! {dir}/
//! ├── 20240324142105412-0000-010-042-024-155-08746.imq
//! ├── 20240324142105412-0001-orders.imq
//! ├── 20240324142105413-0002-orders.imq.tmp   ← torn write, removed on open
//! └── corrupt/                                ← undecodable records, moved aside
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::core::record::Record;
use crate::core::{Error, Result};

const TEMP_SUFFIX: &str = ".tmp";
pub const CORRUPT_DIR: &str = "corrupt";

pub struct Store<T: Record> {
    dir: PathBuf,
    extension: &'static str,
    index: Mutex<BTreeMap<String, T>>,
    corrupt: AtomicU64,
}

impl<T: Record> Store<T> {
    /// Opens the store at `dir`, creating it if needed, and loads every
    /// `*.{extension}` file into the index.
    ///
    /// Files that cannot be read or decoded are counted, logged and moved to
    /// `{dir}/corrupt/`; they never abort the scan. Failing to list the
    /// directory does.
    pub fn open(dir: impl AsRef<Path>, extension: &'static str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            extension,
            index: Mutex::new(BTreeMap::new()),
            corrupt: AtomicU64::new(0),
        };
        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> Result<()> {
        let mut loaded = BTreeMap::new();
        let mut orphans = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.ends_with(TEMP_SUFFIX) {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("store {}: cannot remove torn write {name}: {err}", self.dir.display());
                }
                orphans += 1;
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension) {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| T::decode(&text))
            {
                Ok(mut item) => {
                    item.set_backing_file(Some(path));
                    loaded.insert(name, item);
                }
                Err(err) => self.quarantine(&path, &name, err),
            }
        }

        let count = loaded.len();
        *self.lock()? = loaded;
        info!(
            "store {}: recovered {count} entries ({} corrupt, {orphans} torn)",
            self.dir.display(),
            self.corrupt_count()
        );
        Ok(())
    }

    fn quarantine(&self, path: &Path, name: &str, err: Error) {
        self.corrupt.fetch_add(1, Ordering::AcqRel);
        warn!("store {}: skipping corrupt record {name}: {err}", self.dir.display());
        let corrupt_dir = self.dir.join(CORRUPT_DIR);
        let moved = fs::create_dir_all(&corrupt_dir)
            .and_then(|_| fs::rename(path, corrupt_dir.join(name)));
        if let Err(err) = moved {
            warn!("store {}: cannot quarantine {name}: {err}", self.dir.display());
        }
    }

    /// Writes `item` to `{dir}/{key}` and makes it available to `dequeue`.
    ///
    /// Returns only once the bytes and the directory entry are on stable
    /// storage. A key that already exists on disk is rejected with
    /// `Error::DuplicateKey` and the existing file is left untouched.
    pub fn enqueue(&self, key: &str, mut item: T) -> Result<()> {
        Self::check_key(key)?;
        let path = self.dir.join(key);
        write_durable(&path, item.encode().as_bytes())?;
        item.set_backing_file(Some(path));
        self.restore(key, item)
    }

    fn check_key(key: &str) -> Result<()> {
        if key.contains(['/', '\\']) || key.ends_with(TEMP_SUFFIX) {
            return Err(Error::Unsupported("store key must be a plain file name"));
        }
        Ok(())
    }

    /// Removes and returns the lowest-keyed item, or `None` when empty.
    ///
    /// The pop happens under the index lock, so concurrent callers never get
    /// the same item. The backing file stays on disk.
    pub fn dequeue(&self) -> Result<Option<T>> {
        Ok(self.lock()?.pop_first().map(|(_, item)| item))
    }

    /// Puts a previously dequeued item back at the tail under `key`.
    ///
    /// The item is rewritten to the new key before its old file is removed, so
    /// it stays durable throughout. If removing the old file fails the item is
    /// already queued; the stale copy would reappear after a restart.
    pub fn reenqueue(&self, key: &str, item: T) -> Result<()> {
        let item = self.rewrite(key, item)?;
        self.restore(key, item)
    }

    /// Moves a dequeued item's file to `key` without making it available.
    ///
    /// The new file is durable before the old one is deleted. The returned
    /// item points at the new file; hand it to [`restore`](Self::restore) to
    /// queue it again. Until then it is only on disk and comes back on the
    /// next open.
    pub fn rewrite(&self, key: &str, mut item: T) -> Result<T> {
        Self::check_key(key)?;
        let path = self.dir.join(key);
        let old = item.backing_file().map(Path::to_path_buf);
        write_durable(&path, item.encode().as_bytes())?;
        item.set_backing_file(Some(path.clone()));
        match old {
            Some(old) if old != path => remove_file(&old)?,
            _ => {}
        }
        Ok(item)
    }

    /// Makes an item whose file already sits at `{dir}/{key}` available to
    /// `dequeue` again.
    pub fn restore(&self, key: &str, item: T) -> Result<()> {
        let mut index = self.lock()?;
        if index.contains_key(key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }
        index.insert(key.to_string(), item);
        Ok(())
    }

    /// Deletes an item's backing file, retiring it permanently.
    pub fn remove(&self, item: &T) -> Result<()> {
        match item.backing_file() {
            Some(path) => remove_file(path),
            None => Ok(()),
        }
    }

    pub fn count(&self) -> usize {
        self.index.lock().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Keys currently queued, in dequeue order.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Number of records skipped as corrupt since open.
    pub fn corrupt_count(&self) -> u64 {
        self.corrupt.load(Ordering::Acquire)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, T>>> {
        self.index
            .lock()
            .map_err(|_| Error::Corrupt("store index lock poisoned"))
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, and renames it into place
/// without replacing an existing file.
pub(crate) fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(Error::Unsupported("store path has no file name"))?;
    let temp = path.with_file_name(format!("{name}{TEMP_SUFFIX}"));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = publish(&temp, path, name) {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    debug!("wrote {}", path.display());
    Ok(())
}

fn publish(temp: &Path, final_path: &Path, key: &str) -> Result<()> {
    let duplicate = || Error::DuplicateKey(key.to_string());
    #[cfg(target_os = "linux")]
    {
        match rename_noreplace(temp, final_path)? {
            Ok(()) => return Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => return Err(duplicate()),
            Err(err) if matches!(err.raw_os_error(), Some(libc::ENOSYS | libc::EINVAL)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    // No RENAME_NOREPLACE here: single owner per root, so check then rename.
    if final_path.exists() {
        return Err(duplicate());
    }
    fs::rename(temp, final_path)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn rename_noreplace(from: &Path, to: &Path) -> Result<std::io::Result<()>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c_path = |path: &Path| {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("store path contains null byte"))
    };
    let (from, to) = (c_path(from)?, c_path(to)?);
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    Ok(if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

pub(crate) fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
