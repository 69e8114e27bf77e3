//! The Files Archive Adaptor (spec §4.1): a versioned, append-only
//! filesystem rooted at a VM's data directory, exposed to the guest
//! through a restricted, path-sandboxed surface.
//!
//! The core treats the archive as an external collaborator behind the
//! [`VersionedArchive`] trait (spec §9); [`LocalArchive`] is the concrete,
//! on-disk implementation this crate ships. A production deployment that
//! replicates the archive over a content distribution network would swap
//! in a different implementation without touching the VM or ledger.

mod path;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// How the guest wants file bytes encoded on the way in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Binary,
    Json,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Utf8
    }
}

/// Durable, version-stamped summary of an archive, as returned by
/// `getInfo()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub url: String,
    pub title: String,
    pub version: u64,
}

/// The result of `stat(path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub is_directory: bool,
    pub is_file: bool,
    pub size: u64,
}

/// One entry in a `readdir(path)` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// One entry in the archive's mutation `history(opts)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub op: String,
    pub path: String,
}

/// The abstract contract a files archive implementation must satisfy.
/// The core depends only on this trait so that a networked,
/// content-addressed archive can be substituted for [`LocalArchive`]
/// without changing the VM or replay driver.
pub trait VersionedArchive: Send + Sync {
    fn url(&self) -> String;
    fn version(&self) -> u64;
    fn get_info(&self) -> CoreResult<ArchiveInfo>;
    fn stat(&self, guest_path: &str) -> CoreResult<Stat>;
    fn read_file(&self, guest_path: &str, encoding: Encoding) -> CoreResult<serde_json::Value>;
    fn readdir(&self, guest_path: &str) -> CoreResult<Vec<DirEntry>>;
    fn history(&self) -> CoreResult<Vec<HistoryEntry>>;
    fn write_file(
        &self,
        guest_path: &str,
        data: serde_json::Value,
        encoding: Encoding,
    ) -> CoreResult<u64>;
    fn mkdir(&self, guest_path: &str) -> CoreResult<u64>;
    fn unlink(&self, guest_path: &str) -> CoreResult<u64>;
    fn rmdir(&self, guest_path: &str, recursive: bool) -> CoreResult<u64>;
}

struct LocalArchiveInner {
    version: u64,
    history: Vec<HistoryEntry>,
}

/// An on-disk [`VersionedArchive`] rooted at a VM's data directory.
///
/// `version` starts at 1 once the archive is created (spec §3) and is
/// incremented by exactly one on every successful mutating call; read
/// operations never advance it. The durable `url` is derived once, at
/// creation time, from a BLAKE3 hash of the root path plus the title —
/// stable for the archive's lifetime and embedded in the ledger's `init`
/// record.
pub struct LocalArchive {
    root: PathBuf,
    title: String,
    url: String,
    inner: Mutex<LocalArchiveInner>,
}

impl LocalArchive {
    /// Creates a fresh archive rooted at `root`, which must not already
    /// contain one.
    pub fn create(root: &Path, title: &str) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        let url = format!(
            "archive://{}",
            crate::util::blake3_hex(format!("{}:{title}", root.display()).as_bytes())
        );
        Ok(LocalArchive {
            root: root.to_path_buf(),
            title: title.to_string(),
            url,
            inner: Mutex::new(LocalArchiveInner {
                version: 1,
                history: Vec::new(),
            }),
        })
    }

    /// Reopens an archive previously created at `root` under the given
    /// durable identity. The on-disk contents are the source of truth for
    /// file data; `version`/`history` are not persisted by this
    /// lightweight implementation, so the caller (`Vm::open`, which can
    /// recompute it from the call log's last recorded `filesVersion`)
    /// supplies the version to resume counting from — a real
    /// content-addressed backend would persist this in its own log
    /// instead.
    pub fn open(root: &Path, title: &str, url: String, baseline_version: u64) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        Ok(LocalArchive {
            root: root.to_path_buf(),
            title: title.to_string(),
            url,
            inner: Mutex::new(LocalArchiveInner {
                version: baseline_version,
                history: Vec::new(),
            }),
        })
    }

    fn bump(&self, op: &str, guest_path: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;
        inner.history.push(HistoryEntry {
            version,
            op: op.to_string(),
            path: guest_path.to_string(),
        });
        version
    }

    fn encode_bytes(data: &serde_json::Value, encoding: Encoding) -> CoreResult<Vec<u8>> {
        match encoding {
            Encoding::Utf8 => Ok(data
                .as_str()
                .ok_or_else(|| CoreError::Config("utf-8 writeFile expects a string".into()))?
                .as_bytes()
                .to_vec()),
            Encoding::Binary => {
                let array = data
                    .as_array()
                    .ok_or_else(|| CoreError::Config("binary writeFile expects a byte array".into()))?;
                array
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .filter(|b| *b <= 255)
                            .map(|b| b as u8)
                            .ok_or_else(|| CoreError::Config("binary payload must be bytes".into()))
                    })
                    .collect()
            }
            Encoding::Json => Ok(serde_json::to_vec(data)?),
        }
    }

    fn decode_bytes(bytes: Vec<u8>, encoding: Encoding) -> CoreResult<serde_json::Value> {
        match encoding {
            Encoding::Utf8 => Ok(serde_json::Value::String(
                String::from_utf8(bytes)
                    .map_err(|e| CoreError::Config(format!("not valid utf-8: {e}")))?,
            )),
            Encoding::Binary => Ok(serde_json::Value::Array(
                bytes.into_iter().map(|b| serde_json::json!(b)).collect(),
            )),
            Encoding::Json => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

impl VersionedArchive for LocalArchive {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn version(&self) -> u64 {
        self.inner.lock().version
    }

    fn get_info(&self) -> CoreResult<ArchiveInfo> {
        Ok(ArchiveInfo {
            url: self.url.clone(),
            title: self.title.clone(),
            version: self.version(),
        })
    }

    fn stat(&self, guest_path: &str) -> CoreResult<Stat> {
        let real = path::resolve(&self.root, guest_path)?;
        let metadata = fs::metadata(&real)?;
        Ok(Stat {
            is_directory: metadata.is_dir(),
            is_file: metadata.is_file(),
            size: metadata.len(),
        })
    }

    fn read_file(&self, guest_path: &str, encoding: Encoding) -> CoreResult<serde_json::Value> {
        let real = path::resolve(&self.root, guest_path)?;
        let bytes = fs::read(&real)?;
        Self::decode_bytes(bytes, encoding)
    }

    fn readdir(&self, guest_path: &str) -> CoreResult<Vec<DirEntry>> {
        let real = path::resolve(&self.root, guest_path)?;
        let mut entries: Vec<DirEntry> = fs::read_dir(&real)?
            .filter_map(|entry| entry.ok())
            .map(|entry| DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: entry.path().is_dir(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn history(&self) -> CoreResult<Vec<HistoryEntry>> {
        Ok(self.inner.lock().history.clone())
    }

    fn write_file(
        &self,
        guest_path: &str,
        data: serde_json::Value,
        encoding: Encoding,
    ) -> CoreResult<u64> {
        let real = path::resolve(&self.root, guest_path)?;
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = Self::encode_bytes(&data, encoding)?;
        fs::write(&real, bytes)?;
        Ok(self.bump("writeFile", guest_path))
    }

    fn mkdir(&self, guest_path: &str) -> CoreResult<u64> {
        let real = path::resolve(&self.root, guest_path)?;
        fs::create_dir_all(&real)?;
        Ok(self.bump("mkdir", guest_path))
    }

    fn unlink(&self, guest_path: &str) -> CoreResult<u64> {
        let real = path::resolve(&self.root, guest_path)?;
        fs::remove_file(&real)?;
        Ok(self.bump("unlink", guest_path))
    }

    fn rmdir(&self, guest_path: &str, recursive: bool) -> CoreResult<u64> {
        let real = path::resolve(&self.root, guest_path)?;
        if recursive {
            fs::remove_dir_all(&real)?;
        } else {
            fs::remove_dir(&real)?;
        }
        Ok(self.bump("rmdir", guest_path))
    }
}

/// Byte-for-byte comparison of every path present in either archive
/// (spec §4.7 `compareArchives`). Used by the [`crate::verify`] module.
pub fn snapshot(root: &Path) -> CoreResult<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    collect(root, root, &mut files)?;
    Ok(files)
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) -> CoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            collect(root, &entry_path, out)?;
        } else {
            let relative = entry_path
                .strip_prefix(root)
                .unwrap_or(&entry_path)
                .to_string_lossy()
                .replace('\\', "/");
            out.insert(relative, fs::read(&entry_path)?);
        }
    }
    Ok(())
}
