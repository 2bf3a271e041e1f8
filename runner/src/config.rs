use crate::{layout::Experiment, manifest::ManifestKind, retention::RestartFreq};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FNAME: &str = "config.yaml";

/// map of keys that were present in the config but are not recognised
pub type UnknownKeys = BTreeMap<String, serde_yaml::Value>;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Ignore globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("No laboratory path configured, set `laboratory` or pass --laboratory")]
    NoLaboratory,
    #[error("Unable to derive an experiment name from {0}")]
    NoExperimentName(PathBuf),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ExperimentConfig {
    // laboratory root, relative paths are resolved against the control directory
    pub laboratory: Option<PathBuf>,
    // experiment name, falls back to the name of the control directory
    pub experiment: Option<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub restart_freq: RestartFreq,
    pub restart_history: Option<u32>,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub collate: CollateConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub userscripts: UserScripts,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    // executables, relative paths are looked up in <lab>/bin
    #[serde(default)]
    pub exe: Vec<PathBuf>,
    // input directories (or single files), relative paths are looked up in <lab>/input
    #[serde(default)]
    pub input: Vec<PathBuf>,
    #[serde(default = "default_input_subdir")]
    pub input_subdir: PathBuf,
    #[serde(default = "default_input_subdir")]
    pub restart_in_subdir: PathBuf,
    #[serde(default = "default_restart_out_subdir")]
    pub restart_out_subdir: PathBuf,
    // file inside a restart directory holding the simulation date of that checkpoint
    pub restart_date_file: Option<PathBuf>,
    pub ncpus: Option<u32>,
    // wall clock limit for the model process in seconds
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mpi: MpiConfig,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct MpiConfig {
    // launcher, the executable is started directly if unset
    pub runcmd: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ManifestConfig {
    #[serde(default)]
    pub reproduce: ReproduceConfig,
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    pub hash_threads: Option<usize>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

/// per category overrides of the global reproduce flag
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ReproduceConfig {
    pub exe: Option<bool>,
    pub input: Option<bool>,
    pub restart: Option<bool>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

/// Settings consumed by the job submission layer, carried here so they are validated with
/// the rest of the experiment configuration
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler")]
    pub name: String,
    pub queue: Option<String>,
    pub project: Option<String>,
    pub ncpus: Option<u32>,
    pub walltime: Option<String>,
    pub jobname: Option<String>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CollateConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    // collation command, the output directory is appended as the last argument
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub enable: bool,
    // sync permanently archived restarts as well as outputs
    #[serde(default)]
    pub restarts: bool,
    // transfer command, source paths and then `url` are appended
    #[serde(default)]
    pub command: Vec<String>,
    pub url: Option<String>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct UserScripts {
    pub setup: Option<String>,
    pub run: Option<String>,
    pub archive: Option<String>,
    pub error: Option<String>,

    #[serde(flatten)]
    pub unknown: UnknownKeys,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            exe: Vec::new(),
            input: Vec::new(),
            input_subdir: default_input_subdir(),
            restart_in_subdir: default_input_subdir(),
            restart_out_subdir: default_restart_out_subdir(),
            restart_date_file: None,
            ncpus: None,
            timeout: None,
            env: BTreeMap::new(),
            mpi: MpiConfig::default(),
            unknown: UnknownKeys::new(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            reproduce: ReproduceConfig::default(),
            ignore: default_ignore(),
            hash_threads: None,
            unknown: UnknownKeys::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler(),
            queue: None,
            project: None,
            ncpus: None,
            walltime: None,
            jobname: None,
            unknown: UnknownKeys::new(),
        }
    }
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            enable: true,
            command: Vec::new(),
            unknown: UnknownKeys::new(),
        }
    }
}

impl ReproduceConfig {
    pub fn get(&self, kind: ManifestKind) -> Option<bool> {
        match kind {
            ManifestKind::Exe => self.exe,
            ManifestKind::Input => self.input,
            ManifestKind::Restart => self.restart,
        }
    }
}

impl ManifestConfig {
    /// compile the ignore patterns into a single matcher
    pub fn ignore_set(&self) -> Result<GlobSet, globset::Error> {
        let mut builder = GlobSetBuilder::new();

        for pattern in self.ignore.iter() {
            builder.add(Glob::new(pattern)?);
        }

        builder.build()
    }
}

impl ExperimentConfig {
    /// load `config.yaml` from the control directory, a missing file yields the defaults
    pub fn load(control_path: &Path) -> Result<Self, ConfigErrors> {
        let path = control_path.join(DEFAULT_CONFIG_FNAME);

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(path = ?path, "Configuration file not found, using defaults");
                String::new()
            }
            Err(source) => return Err(ConfigErrors::Read { path, source }),
        };

        let config = Self::parse(&contents)?;
        config.warn_unknown_keys();

        Ok(config)
    }

    /// parse and validate a configuration document
    pub fn parse(contents: &str) -> Result<Self, ConfigErrors> {
        // NOTE: an empty YAML document is a unit value, not an empty mapping
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(contents)?
        };

        config.manifest.ignore_set()?;

        Ok(config)
    }

    /// dotted names of every key that was not recognised
    pub fn unknown_keys(&self) -> Vec<String> {
        let sections: [(&str, &UnknownKeys); 9] = [
            ("", &self.unknown),
            ("model.", &self.model.unknown),
            ("model.mpi.", &self.model.mpi.unknown),
            ("manifest.", &self.manifest.unknown),
            ("manifest.reproduce.", &self.manifest.reproduce.unknown),
            ("scheduler.", &self.scheduler.unknown),
            ("collate.", &self.collate.unknown),
            ("sync.", &self.sync.unknown),
            ("userscripts.", &self.userscripts.unknown),
        ];

        sections
            .iter()
            .flat_map(|(prefix, keys)| keys.keys().map(move |key| format!("{prefix}{key}")))
            .collect()
    }

    pub fn warn_unknown_keys(&self) -> Vec<String> {
        let keys = self.unknown_keys();

        for key in keys.iter() {
            warn!("Unrecognised configuration key '{key}' is ignored");
        }

        keys
    }

    /// bind the configuration to a control directory to get the experiment identity
    pub fn experiment(
        &self,
        control_path: &Path,
        laboratory: Option<&Path>,
    ) -> Result<Experiment, ConfigErrors> {
        let laboratory = laboratory
            .map(Path::to_path_buf)
            .or_else(|| self.laboratory.clone())
            .ok_or(ConfigErrors::NoLaboratory)?;
        let laboratory_path = if laboratory.is_absolute() {
            laboratory
        } else {
            control_path.join(laboratory)
        };

        let name = match &self.experiment {
            Some(name) => name.clone(),
            None => control_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| ConfigErrors::NoExperimentName(control_path.to_path_buf()))?,
        };

        debug!(laboratory = ?laboratory_path, name = name, "Resolved experiment");

        Ok(Experiment {
            control_path: control_path.to_path_buf(),
            laboratory_path,
            name,
        })
    }
}

fn default_model_name() -> String {
    String::from("model")
}

fn default_input_subdir() -> PathBuf {
    PathBuf::from("INPUT")
}

fn default_restart_out_subdir() -> PathBuf {
    PathBuf::from("RESTART")
}

fn default_ignore() -> Vec<String> {
    vec![String::from(".*")]
}

fn default_scheduler() -> String {
    String::from("pbs")
}

fn default_true() -> bool {
    true
}
