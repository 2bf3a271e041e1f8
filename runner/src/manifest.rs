//! Content addressed record of the files a run depends on.
//!
//! A manifest maps a path relative to the work directory (the local key) to the file it
//! was staged from and two hashes: a cheap `binhash` used to detect change and an `md5`
//! that is only recomputed when the `binhash` moved. The on-disk form is a two document
//! YAML file, a `format`/`version` header followed by the record mapping.

pub mod hash;
pub mod manager;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

pub const MANIFEST_FORMAT: &str = "yamanifest";
pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("File not found: {0}")]
    MissingFile(PathBuf),
    #[error("Run cannot reproduce: {kind} manifest entry {key} does not match {path}")]
    ReproduceMismatch {
        kind: ManifestKind,
        key: String,
        path: PathBuf,
    },
    #[error("{0} manifest must exist and be populated when reproduce is enabled")]
    ManifestRequired(ManifestKind),
    #[error("Manifest key '{0}' must be a relative path inside the work directory")]
    InvalidKey(String),
    #[error("Ignore globs were invalid")]
    InvalidIgnore(#[from] globset::Error),
    #[error("Failed to start hashing thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl ManifestError {
    /// wrap an io error, missing files get their own variant
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::MissingFile(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Exe,
    Input,
    Restart,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 3] = [Self::Exe, Self::Input, Self::Restart];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exe => "exe",
            Self::Input => "input",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub binhash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// a single tracked file, the local key is the key of the owning map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub fullpath: PathBuf,
    pub hashes: Hashes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Unchanged,
}

/// Result of checking a file against its record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Match,
    /// content matches but the binhash moved, carries the new binhash
    ContentMatch(String),
    Mismatch,
}

#[derive(Debug, Deserialize)]
struct Header {
    format: Option<String>,
    version: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    kind: ManifestKind,
    format: String,
    version: String,
    records: BTreeMap<String, ManifestRecord>,
}

impl Manifest {
    pub fn new(kind: ManifestKind) -> Self {
        Self {
            kind,
            format: String::from(MANIFEST_FORMAT),
            version: String::from(MANIFEST_VERSION),
            records: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ManifestKind {
        self.kind
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ManifestRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ManifestRecord> {
        self.records.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ManifestRecord)> {
        self.records.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    /// Load a manifest from disk. A missing file is the first run of this category and
    /// yields an empty manifest, anything without a readable header is corrupt.
    pub fn load(kind: ManifestKind, path: &Path) -> Result<Self, ManifestError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = ?path, "No {kind} manifest yet, starting empty");
                return Ok(Self::new(kind));
            }
            Err(source) => {
                return Err(ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let corrupt = |reason: String| ManifestError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let mut documents = serde_yaml::Deserializer::from_str(&contents);

        let header = documents
            .next()
            .ok_or_else(|| corrupt(String::from("empty file")))?;
        let header = Header::deserialize(header).map_err(|error| corrupt(error.to_string()))?;

        let format = header
            .format
            .filter(|format| !format.is_empty())
            .ok_or_else(|| corrupt(String::from("missing format header")))?;
        let version = header
            .version
            .as_ref()
            .and_then(version_string)
            .ok_or_else(|| corrupt(String::from("missing or malformed version header")))?;

        let records = match documents.next() {
            Some(body) => Option::<BTreeMap<String, ManifestRecord>>::deserialize(body)
                .map_err(|error| corrupt(error.to_string()))?
                .unwrap_or_default(),
            None => BTreeMap::new(),
        };

        for key in records.keys() {
            validate_key(key).map_err(|error| corrupt(error.to_string()))?;
        }

        debug!(path = ?path, records = records.len(), "Loaded {kind} manifest");

        Ok(Self {
            kind,
            format,
            version,
            records,
        })
    }

    /// Persist the manifest, the previous file stays intact until the new one is complete.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let body = serde_yaml::to_string(&self.records)?;
        let contents = format!(
            "format: {}\nversion: {}\n---\n{}",
            self.format, self.version, body
        );

        crate::fsops::atomic_write(path, contents.as_bytes()).map_err(|source| {
            ManifestError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        debug!(path = ?path, records = self.records.len(), "Saved {} manifest", self.kind);

        Ok(())
    }

    /// Track `full_path` under `key`, hashing as little as possible.
    pub fn refresh(&mut self, key: &str, full_path: &Path) -> Result<ChangeKind, ManifestError> {
        let entry = [(key.to_owned(), full_path.to_path_buf())];

        Ok(self.refresh_all(&entry)?[0])
    }

    /// Batch version of `refresh`. All binhashes are computed in parallel first, then the
    /// md5 of every entry that needs one, then the records are updated in order.
    pub fn refresh_all(
        &mut self,
        entries: &[(String, PathBuf)],
    ) -> Result<Vec<ChangeKind>, ManifestError> {
        for (key, _) in entries {
            validate_key(key)?;
        }

        let binhashes = entries
            .par_iter()
            .map(|(_, path)| hash::binhash(path))
            .collect::<Result<Vec<_>, _>>()?;

        let md5s = entries
            .par_iter()
            .zip(binhashes.par_iter())
            .map(|((key, path), binhash)| {
                if self.needs_md5(key, path, binhash) {
                    hash::md5(path).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let changes = entries
            .iter()
            .zip(binhashes)
            .zip(md5s)
            .map(|(((key, path), binhash), md5)| self.apply(key, path, binhash, md5))
            .collect();

        Ok(changes)
    }

    /// Check whether the file at `full_path` still matches the record for `key` without
    /// touching the manifest. The md5 is only computed if the binhash moved.
    pub fn verify(&self, key: &str, full_path: &Path) -> Result<bool, ManifestError> {
        Ok(self.check(key, full_path)? != Verification::Mismatch)
    }

    /// Like `verify`, but reports the new binhash of a file whose content still matches.
    pub fn check(&self, key: &str, full_path: &Path) -> Result<Verification, ManifestError> {
        let Some(record) = self.records.get(key) else {
            return Ok(Verification::Mismatch);
        };

        let binhash = hash::binhash(full_path)?;
        if binhash == record.hashes.binhash {
            return Ok(Verification::Match);
        }

        match &record.hashes.md5 {
            Some(expected) => {
                trace!(key = key, "Binhash differs, falling back to md5");
                if &hash::md5(full_path)? == expected {
                    Ok(Verification::ContentMatch(binhash))
                } else {
                    Ok(Verification::Mismatch)
                }
            }
            None => Ok(Verification::Mismatch),
        }
    }

    /// replace the fast hash of `key`, the md5 is left as is
    pub fn update_binhash(&mut self, key: &str, binhash: String) {
        if let Some(record) = self.records.get_mut(key) {
            record.hashes.binhash = binhash;
        }
    }

    fn needs_md5(&self, key: &str, full_path: &Path, binhash: &str) -> bool {
        match self.records.get(key) {
            Some(record) => {
                record.hashes.binhash != binhash
                    || record.hashes.md5.is_none()
                    || record.fullpath != full_path
            }
            None => true,
        }
    }

    fn apply(
        &mut self,
        key: &str,
        full_path: &Path,
        binhash: String,
        md5: Option<String>,
    ) -> ChangeKind {
        match self.records.get_mut(key) {
            Some(record) => match md5 {
                Some(md5) => {
                    record.fullpath = full_path.to_path_buf();
                    record.hashes = Hashes {
                        binhash,
                        md5: Some(md5),
                    };

                    ChangeKind::Changed
                }
                None => ChangeKind::Unchanged,
            },
            None => {
                self.records.insert(
                    key.to_owned(),
                    ManifestRecord {
                        fullpath: full_path.to_path_buf(),
                        hashes: Hashes { binhash, md5 },
                    },
                );

                ChangeKind::Added
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&mut self, key: &str, record: ManifestRecord) {
        self.records.insert(key.to_owned(), record);
    }
}

/// a key must be a non-empty relative path that never leaves the work directory
pub fn validate_key(key: &str) -> Result<(), ManifestError> {
    let path = Path::new(key);
    let escapes = path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if key.is_empty() || path.is_absolute() || escapes {
        Err(ManifestError::InvalidKey(key.to_owned()))
    } else {
        Ok(())
    }
}

/// normalise the header version to `major.minor`
fn version_string(value: &serde_yaml::Value) -> Option<String> {
    let raw = match value {
        serde_yaml::Value::String(version) => version.clone(),
        serde_yaml::Value::Number(version) => version.to_string(),
        _ => return None,
    };

    let mut parts = raw.splitn(2, '.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };

    Some(format!("{major}.{minor}"))
}
