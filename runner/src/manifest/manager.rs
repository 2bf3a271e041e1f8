use super::{ChangeKind, Manifest, ManifestError, ManifestKind, Verification};
use crate::{config::ReproduceConfig, layout::DirectoryLayout};
use globset::GlobSet;
use ignore::WalkBuilder;
use itertools::Itertools;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Effective reproduce flag per category
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Reproduce {
    pub exe: bool,
    pub input: bool,
    pub restart: bool,
}

impl Reproduce {
    pub fn resolve(global: bool, overrides: &ReproduceConfig) -> Self {
        Self {
            exe: effective_reproduce(global, overrides.get(ManifestKind::Exe)),
            input: effective_reproduce(global, overrides.get(ManifestKind::Input)),
            restart: effective_reproduce(global, overrides.get(ManifestKind::Restart)),
        }
    }

    pub fn get(&self, kind: ManifestKind) -> bool {
        match kind {
            ManifestKind::Exe => self.exe,
            ManifestKind::Input => self.input,
            ManifestKind::Restart => self.restart,
        }
    }
}

/// a per category override always wins over the global flag
pub fn effective_reproduce(global: bool, category: Option<bool>) -> bool {
    category.unwrap_or(global)
}

/// A file that is linked into the work directory under `key`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedFile {
    pub key: String,
    pub full_path: PathBuf,
}

impl StagedFile {
    pub fn new(key: impl Into<String>, full_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            full_path: full_path.into(),
        }
    }
}

/// executables are linked into the root of the work directory by file name
pub fn collect_executables(
    layout: &DirectoryLayout,
    exes: &[PathBuf],
) -> Result<Vec<StagedFile>, ManifestError> {
    exes.iter()
        .map(|exe| {
            let full_path = layout.resolve_exe(exe);

            if !full_path.is_file() {
                return Err(ManifestError::MissingFile(full_path));
            }

            let key = full_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| ManifestError::InvalidKey(full_path.display().to_string()))?;

            Ok(StagedFile::new(key, full_path))
        })
        .collect()
}

/// Walk every configured input directory and map its files below `input_subdir`.
/// Single files are staged by name. When two directories provide the same key the one
/// listed first wins.
pub fn collect_inputs(
    layout: &DirectoryLayout,
    inputs: &[PathBuf],
    input_subdir: &Path,
    ignore: &GlobSet,
) -> Result<Vec<StagedFile>, ManifestError> {
    let mut seen = BTreeSet::new();
    let mut staged = Vec::new();

    for input in inputs {
        let source = layout.resolve_input(input);

        if !source.exists() {
            return Err(ManifestError::MissingFile(source));
        }

        for file in walk_files(&source, input_subdir, ignore) {
            if seen.insert(file.key.clone()) {
                staged.push(file);
            } else {
                debug!(
                    key = file.key,
                    path = ?file.full_path,
                    "Skipping input already provided by an earlier directory"
                );
            }
        }
    }

    Ok(staged)
}

/// files of an archived restart directory keyed below `restart_in_subdir`
/// an absent (pruned) directory yields nothing
pub fn collect_restarts(
    restart_path: &Path,
    restart_in_subdir: &Path,
    ignore: &GlobSet,
) -> Vec<StagedFile> {
    if !restart_path.is_dir() {
        debug!(path = ?restart_path, "No restart directory to collect from");
        return Vec::new();
    }

    walk_files(restart_path, restart_in_subdir, ignore)
}

fn walk_files(root: &Path, subdir: &Path, ignore: &GlobSet) -> Vec<StagedFile> {
    if root.is_file() {
        return root
            .file_name()
            .map(|name| StagedFile::new(key_for(subdir, Path::new(name)), root))
            .into_iter()
            .collect();
    }

    let ignore = ignore.clone();
    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .follow_links(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        // never filter the root itself, only what lives inside it
        .filter_entry(move |entry| entry.depth() == 0 || !ignore.is_match(entry.file_name()));

    builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("Failed to walk {}: {error}", root.display());
                None
            }
        })
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(root).ok()?.to_path_buf();
            Some(StagedFile::new(key_for(subdir, &relative), entry.into_path()))
        })
        .collect_vec()
}

fn key_for(subdir: &Path, relative: &Path) -> String {
    subdir.join(relative).to_string_lossy().into_owned()
}

/// Owns the exe, input and restart manifests of the current run
#[derive(Debug)]
pub struct ManifestManager {
    paths: BTreeMap<ManifestKind, PathBuf>,
    manifests: BTreeMap<ManifestKind, Manifest>,
    reproduce: Reproduce,
    pool: Option<ThreadPool>,
}

impl ManifestManager {
    /// load all three manifests of the experiment, a missing one starts empty
    pub fn load(
        layout: &DirectoryLayout,
        reproduce: Reproduce,
        hash_threads: Option<usize>,
    ) -> Result<Self, ManifestError> {
        let mut paths = BTreeMap::new();
        let mut manifests = BTreeMap::new();

        for kind in ManifestKind::ALL {
            let path = layout.manifest_path(kind);
            manifests.insert(kind, Manifest::load(kind, &path)?);
            paths.insert(kind, path);
        }

        let pool = match hash_threads {
            Some(threads) => {
                debug!("Starting hash thread pool with {threads} threads");
                Some(ThreadPoolBuilder::new().num_threads(threads).build()?)
            }
            None => None,
        };

        Ok(Self {
            paths,
            manifests,
            reproduce,
            pool,
        })
    }

    pub fn reproduce(&self) -> Reproduce {
        self.reproduce
    }

    pub fn manifest(&self, kind: ManifestKind) -> &Manifest {
        &self.manifests[&kind]
    }

    /// Files to stage for `kind`. An enforced category stages exactly what its manifest
    /// recorded, otherwise the freshly collected candidates are used.
    pub fn plan(&self, kind: ManifestKind, candidates: Vec<StagedFile>) -> Vec<StagedFile> {
        if !self.reproduce.get(kind) {
            return candidates;
        }

        self.manifest(kind)
            .iter()
            .map(|(key, record)| StagedFile::new(key.clone(), record.fullpath.clone()))
            .collect()
    }

    /// Verify every record of `kind` if reproduction is enforced for it. The first
    /// mismatch in key order is reported. Records whose content matched through the md5
    /// get their new binhash so the next check stays fast.
    pub fn enforce_reproduce(&mut self, kind: ManifestKind) -> Result<(), ManifestError> {
        if !self.reproduce.get(kind) {
            return Ok(());
        }

        let manifest = self.manifest(kind);

        if manifest.is_empty() {
            return Err(ManifestError::ManifestRequired(kind));
        }

        let records = manifest.iter().collect_vec();
        let results = in_pool(self.pool.as_ref(), || {
            records
                .par_iter()
                .map(|(key, record)| manifest.check(key, &record.fullpath))
                .collect::<Vec<_>>()
        });

        let mut moved = Vec::new();
        for ((key, record), result) in records.iter().zip(results) {
            match result? {
                Verification::Match => {}
                Verification::ContentMatch(binhash) => moved.push((key.to_string(), binhash)),
                Verification::Mismatch => {
                    return Err(ManifestError::ReproduceMismatch {
                        kind,
                        key: key.to_string(),
                        path: record.fullpath.clone(),
                    })
                }
            }
        }

        info!(
            records = manifest.len(),
            refreshed = moved.len(),
            "Verified {kind} manifest"
        );

        if let Some(manifest) = self.manifests.get_mut(&kind) {
            for (key, binhash) in moved {
                manifest.update_binhash(&key, binhash);
            }
        }

        Ok(())
    }

    /// rebuild the exe manifest from scratch unless it is pinned
    pub fn scan_executables(&mut self, files: &[StagedFile]) -> Result<(), ManifestError> {
        if self.reproduce.exe {
            debug!("Executable reproduction enforced, keeping exe manifest");
            return Ok(());
        }

        self.rebuild(ManifestKind::Exe, files)
    }

    /// Refresh the input manifest and drop records for files that are gone. Returns the
    /// removed keys.
    pub fn scan_inputs(&mut self, files: &[StagedFile]) -> Result<Vec<String>, ManifestError> {
        if self.reproduce.input {
            debug!("Input reproduction enforced, keeping input manifest");
            return Ok(Vec::new());
        }

        let entries = entries(files);
        let Self {
            manifests, pool, ..
        } = self;
        let Some(manifest) = manifests.get_mut(&ManifestKind::Input) else {
            return Ok(Vec::new());
        };

        let changes = in_pool(pool.as_ref(), || manifest.refresh_all(&entries))?;
        log_changes(ManifestKind::Input, &changes);

        let present: BTreeSet<&str> = files.iter().map(|file| file.key.as_str()).collect();
        let removed = manifest
            .keys()
            .filter(|key| !present.contains(key.as_str()))
            .cloned()
            .collect_vec();

        for key in removed.iter() {
            warn!(key = key, "Input file no longer present, removing from manifest");
            manifest.remove(key);
        }

        Ok(removed)
    }

    /// the restart manifest always describes exactly the given files
    pub fn scan_restarts(&mut self, files: &[StagedFile]) -> Result<(), ManifestError> {
        self.rebuild(ManifestKind::Restart, files)
    }

    pub fn save(&self) -> Result<(), ManifestError> {
        for (kind, manifest) in self.manifests.iter() {
            manifest.save(&self.paths[kind])?;
        }

        Ok(())
    }

    /// write a copy of every manifest into `dir`
    pub fn snapshot(&self, dir: &Path) -> Result<(), ManifestError> {
        for (kind, manifest) in self.manifests.iter() {
            manifest.save(&dir.join(format!("{kind}.yaml")))?;
        }

        debug!(path = ?dir, "Snapshotted manifests");

        Ok(())
    }

    fn rebuild(&mut self, kind: ManifestKind, files: &[StagedFile]) -> Result<(), ManifestError> {
        let entries = entries(files);

        // every file is hashed again, nothing is carried over from the previous run
        let mut manifest = Manifest::new(kind);
        let changes = in_pool(self.pool.as_ref(), || manifest.refresh_all(&entries))?;
        log_changes(kind, &changes);

        self.manifests.insert(kind, manifest);

        Ok(())
    }
}

fn entries(files: &[StagedFile]) -> Vec<(String, PathBuf)> {
    files
        .iter()
        .map(|file| (file.key.clone(), file.full_path.clone()))
        .collect()
}

fn log_changes(kind: ManifestKind, changes: &[ChangeKind]) {
    let counts = changes.iter().counts();

    info!(
        added = counts.get(&ChangeKind::Added).copied().unwrap_or(0),
        changed = counts.get(&ChangeKind::Changed).copied().unwrap_or(0),
        unchanged = counts.get(&ChangeKind::Unchanged).copied().unwrap_or(0),
        "Scanned {kind} files"
    );
}

fn in_pool<R: Send>(pool: Option<&ThreadPool>, op: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}
