//! Canonical paths of an experiment.
//!
//! Everything here is pure path arithmetic, nothing touches the filesystem.

use crate::manifest::ManifestKind;
use std::path::{Path, PathBuf};

pub const OUTPUT_PREFIX: &str = "output";
pub const RESTART_PREFIX: &str = "restart";
/// minimum number of digits of the run index in archive directory names
pub const INDEX_WIDTH: usize = 3;
/// largest run index that still fits the zero padded width
pub const MAX_PADDED_INDEX: u32 = 999;

pub const STOP_FILE: &str = "stop_run";
pub const MANIFEST_DIR: &str = "manifests";
pub const ERROR_LOG_DIR: &str = "error_logs";

/// identity of an experiment, bound once a control directory is paired with a laboratory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    pub control_path: PathBuf,
    pub laboratory_path: PathBuf,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryLayout {
    experiment: Experiment,
}

impl DirectoryLayout {
    pub fn new(experiment: Experiment) -> Self {
        Self { experiment }
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn control_path(&self) -> &Path {
        &self.experiment.control_path
    }

    pub fn laboratory_path(&self) -> &Path {
        &self.experiment.laboratory_path
    }

    pub fn bin_path(&self) -> PathBuf {
        self.laboratory_path().join("bin")
    }

    pub fn input_path(&self) -> PathBuf {
        self.laboratory_path().join("input")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.laboratory_path()
            .join("archive")
            .join(&self.experiment.name)
    }

    pub fn work_path(&self) -> PathBuf {
        self.laboratory_path().join("work").join(&self.experiment.name)
    }

    pub fn output_path(&self, index: u32) -> PathBuf {
        self.archive_path()
            .join(archive_dir_name(OUTPUT_PREFIX, index))
    }

    pub fn restart_path(&self, index: u32) -> PathBuf {
        self.archive_path()
            .join(archive_dir_name(RESTART_PREFIX, index))
    }

    /// restart directory a run with `index` resumes from
    pub fn prior_restart_path(&self, index: u32) -> Option<PathBuf> {
        index
            .checked_sub(1)
            .map(|prior| self.restart_path(prior))
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.archive_path().join(ERROR_LOG_DIR)
    }

    /// symbolic link in the control directory pointing at the work directory
    pub fn work_symlink(&self) -> PathBuf {
        self.control_path().join("work")
    }

    /// symbolic link in the control directory pointing at the archive
    pub fn archive_symlink(&self) -> PathBuf {
        self.control_path().join("archive")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.control_path().join(MANIFEST_DIR)
    }

    pub fn manifest_path(&self, kind: ManifestKind) -> PathBuf {
        self.manifest_dir().join(format!("{kind}.yaml"))
    }

    pub fn stop_file(&self) -> PathBuf {
        self.control_path().join(STOP_FILE)
    }

    /// executables are looked up in the laboratory bin directory unless absolute
    pub fn resolve_exe(&self, path: &Path) -> PathBuf {
        resolve_against(&self.bin_path(), path)
    }

    /// inputs are looked up in the laboratory input directory unless absolute
    pub fn resolve_input(&self, path: &Path) -> PathBuf {
        resolve_against(&self.input_path(), path)
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// `output007`, `restart123`; indices past the padded range simply get wider
pub fn archive_dir_name(prefix: &str, index: u32) -> String {
    format!("{prefix}{index:0width$}", width = INDEX_WIDTH)
}

/// inverse of `archive_dir_name`, rejects names with fewer than `INDEX_WIDTH` digits
pub fn parse_archive_index(prefix: &str, name: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;

    if digits.len() < INDEX_WIDTH || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

pub fn exceeds_padded_range(index: u32) -> bool {
    index > MAX_PADDED_INDEX
}
