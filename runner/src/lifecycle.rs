//! The run state machine.
//!
//! A run moves through `Init -> Setup -> Executing -> Archiving -> Collating -> Syncing ->
//! Done`. Setup, execution and archiving may end in `Error`, which leaves the filesystem
//! as the failing stage found it. Collation and sync failures only produce warnings.

mod staging;

use crate::{
    collate::{Collator, CommandCollator},
    config::{ConfigErrors, ExperimentConfig},
    executors::{run_userscript, Executor, ExecutorError, LocalExecutor},
    fsops,
    layout::{exceeds_padded_range, DirectoryLayout, OUTPUT_PREFIX, RESTART_PREFIX},
    manifest::{manager::Reproduce, manager::ManifestManager, ManifestError},
    retention::{
        restart_date::{TimestampFileReader, DEFAULT_DATE_FILE},
        DateReader, RestartDirectory, RetentionDecision, RetentionError, RetentionPolicy,
    },
    sync::{CommandSync, RemoteSync, SyncRequest},
};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Init,
    Setup,
    Executing,
    Archiving,
    Collating,
    Syncing,
    Done,
    Error,
}

impl RunStatus {
    pub fn can_transition(self, next: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, next),
            (Init | Done | Error, Init)
                | (Init, Setup)
                | (Setup, Executing)
                | (Executing, Archiving)
                | (Archiving, Collating)
                | (Collating, Syncing)
                | (Syncing, Done)
                | (Setup | Executing | Archiving, Error)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Retention(#[from] RetentionError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Work directory {0} already exists, sweep it or run with --force")]
    WorkDirectoryExists(PathBuf),
    #[error("Archive directory {0} already exists")]
    ArchiveExists(PathBuf),
    #[error("Model run {index} failed with exit code {code}")]
    ModelFailed { index: u32, code: i32 },
    #[error("No work directory at {0}")]
    NoWorkDirectory(PathBuf),
    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("Failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl RunError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Conditions that are logged and reported but never stop a run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    #[error("Restarts {restarts:?} were kept by an earlier policy, pass --force-prune-restarts to delete them")]
    RetentionAmbiguity { restarts: Vec<u32> },
    #[error("Unrecognised configuration key '{0}'")]
    UnknownConfigKey(String),
    #[error("Input {0} is no longer present and was removed from the manifest")]
    InputRemoved(String),
    #[error("Prior restart directory {0} does not exist, starting without restarts")]
    MissingPriorRestart(PathBuf),
    #[error("Model wrote no restart directory {0}")]
    NoRestartOutput(PathBuf),
    #[error("Run index {0} exceeds the zero padded range of archive directory names")]
    IndexBeyondPadding(u32),
    #[error("User script '{stage}' failed: {reason}")]
    UserScriptFailed { stage: String, reason: String },
    #[error("Collation failed: {0}")]
    CollateFailed(String),
    #[error("Sync failed: {0}")]
    SyncFailed(String),
}

/// Options given on the command line for a single invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub n_runs: u32,
    pub run_index: Option<u32>,
    pub force: bool,
    pub reproduce: bool,
    pub force_prune_restarts: bool,
    pub sync_latest: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            n_runs: 1,
            run_index: None,
            force: false,
            reproduce: false,
            force_prune_restarts: false,
            sync_latest: false,
        }
    }
}

/// Everything a stage needs to know about the experiment
#[derive(Clone, Debug)]
pub struct RunContext {
    pub layout: DirectoryLayout,
    pub config: ExperimentConfig,
    pub options: RunOptions,
}

impl RunContext {
    pub fn new(layout: DirectoryLayout, config: ExperimentConfig, options: RunOptions) -> Self {
        Self {
            layout,
            config,
            options,
        }
    }

    /// read `config.yaml` from the control directory and bind it to a laboratory
    pub fn load(
        control_path: &Path,
        laboratory: Option<&Path>,
        options: RunOptions,
    ) -> Result<Self, RunError> {
        let config = ExperimentConfig::load(control_path)?;
        let experiment = config.experiment(control_path, laboratory)?;

        Ok(Self::new(DirectoryLayout::new(experiment), config, options))
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.config.restart_freq, self.config.restart_history)
    }
}

/// External capabilities the lifecycle delegates to
pub struct Collaborators {
    pub executor: Box<dyn Executor>,
    pub dates: Box<dyn DateReader>,
    pub collator: Option<Box<dyn Collator>>,
    pub sync: Option<Box<dyn RemoteSync>>,
}

impl Collaborators {
    /// subprocess based collaborators as configured
    pub fn from_context(context: &RunContext) -> Self {
        let config = &context.config;
        let control_path = context.layout.control_path();
        let date_file = config
            .model
            .restart_date_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATE_FILE));

        Self {
            executor: Box::new(LocalExecutor::from_config(&config.model)),
            dates: Box::new(TimestampFileReader::new(date_file)),
            collator: CommandCollator::from_config(&config.collate, control_path)
                .map(|collator| Box::new(collator) as Box<dyn Collator>),
            sync: CommandSync::from_config(&config.sync, control_path)
                .map(|sync| Box::new(sync) as Box<dyn RemoteSync>),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    pub run_index: u32,
    pub work_path: PathBuf,
    pub status: RunStatus,
    pub forced: bool,
    pub reproduce: Reproduce,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: Vec<u32>,
    pub warnings: Vec<Warning>,
    /// a stop request ended the run sequence early
    pub stopped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneOutcome {
    pub decision: RetentionDecision,
    pub deleted: Vec<u32>,
}

pub struct RunLifecycle {
    context: RunContext,
    collaborators: Collaborators,
    state: RunState,
    manifests: Option<ManifestManager>,
    warnings: Vec<Warning>,
}

impl RunLifecycle {
    pub fn new(context: RunContext, collaborators: Collaborators) -> Self {
        let state = RunState {
            run_index: 0,
            work_path: context.layout.work_path(),
            status: RunStatus::Init,
            forced: context.options.force,
            reproduce: Reproduce::resolve(
                context.options.reproduce,
                &context.config.manifest.reproduce,
            ),
        };
        // already logged while loading the configuration
        let warnings = context
            .config
            .unknown_keys()
            .into_iter()
            .map(Warning::UnknownConfigKey)
            .collect();

        Self {
            context,
            collaborators,
            state,
            manifests: None,
            warnings,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// explicit index if given, otherwise one past the highest archived output
    pub fn resolve_run_index(&self) -> Result<u32, RunError> {
        if let Some(index) = self.context.options.run_index {
            return Ok(index);
        }

        let archive = self.context.layout.archive_path();
        let outputs =
            fsops::list_archive_indices(&archive, OUTPUT_PREFIX).map_err(RunError::io(&archive))?;

        Ok(outputs.last().map_or(0, |last| last + 1))
    }

    /// Run `n_runs` successive jobs, honouring a stop request before each one.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        let mut report = RunReport::default();
        let mut next_index = None;

        for _ in 0..self.context.options.n_runs {
            if self.stop_requested()? {
                report.stopped = true;
                break;
            }

            let index = match next_index {
                Some(index) => index,
                None => self.resolve_run_index()?,
            };

            self.run_once(index)?;
            report.completed.push(index);
            next_index = Some(index + 1);
        }

        report.warnings = std::mem::take(&mut self.warnings);

        Ok(report)
    }

    /// run a single job through every stage
    #[instrument(skip(self), level = "info")]
    pub fn run_once(&mut self, index: u32) -> Result<(), RunError> {
        self.init(index)?;
        self.setup()?;
        self.execute()?;
        self.archive()?;
        self.collate()?;
        self.sync()?;

        info!("Run {index} complete");

        Ok(())
    }

    pub fn init(&mut self, index: u32) -> Result<(), RunError> {
        self.transition(RunStatus::Init)?;

        self.state = RunState {
            run_index: index,
            work_path: self.context.layout.work_path(),
            status: RunStatus::Init,
            forced: self.context.options.force,
            reproduce: Reproduce::resolve(
                self.context.options.reproduce,
                &self.context.config.manifest.reproduce,
            ),
        };
        self.manifests = None;

        if exceeds_padded_range(index) {
            self.warn(Warning::IndexBeyondPadding(index));
        }

        Ok(())
    }

    /// Stage the work directory. Nothing is touched unless every check passes.
    pub fn setup(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Setup)?;
        self.guarded(Self::stage_work_directory)?;
        self.userscript("setup");

        Ok(())
    }

    pub fn execute(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Executing)?;

        let index = self.state.run_index;
        let work_path = self.state.work_path.clone();

        if !work_path.is_dir() {
            self.state.status = RunStatus::Error;
            return Err(RunError::NoWorkDirectory(work_path));
        }

        let error = match self.collaborators.executor.execute(&work_path) {
            Ok(0) => {
                self.userscript("run");
                return Ok(());
            }
            Ok(code) => RunError::ModelFailed { index, code },
            Err(error) => RunError::Executor(error),
        };

        error!("Run {index} failed: {error}");
        self.state.status = RunStatus::Error;
        self.save_error_logs();
        self.userscript("error");

        Err(error)
    }

    /// Move the finished work directory into the archive and prune old restarts.
    pub fn archive(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Archiving)?;
        self.guarded(Self::archive_work_directory)?;
        self.guarded(|lifecycle| {
            let force = lifecycle.context.options.force_prune_restarts;
            lifecycle.prune_restarts(force)
        })?;
        self.userscript("archive");

        Ok(())
    }

    pub fn collate(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Collating)?;

        let output_path = self.context.layout.output_path(self.state.run_index);
        self.collate_output(&output_path);

        Ok(())
    }

    /// collate an arbitrary output directory, failures only warn
    pub fn collate_output(&mut self, output_path: &Path) {
        let result = match self.collaborators.collator.as_mut() {
            Some(collator) => collator.collate(output_path),
            None => {
                debug!("No collation configured");
                return;
            }
        };

        if let Err(error) = result {
            self.warn(Warning::CollateFailed(error.to_string()));
        }
    }

    pub fn sync(&mut self) -> Result<(), RunError> {
        self.transition(RunStatus::Syncing)?;

        if self.collaborators.sync.is_none() {
            debug!("No remote sync configured");
            return self.transition(RunStatus::Done);
        }

        let request = self.sync_request()?;
        let result = match self.collaborators.sync.as_mut() {
            Some(sync) => sync.sync(&request),
            None => Ok(()),
        };

        if let Err(error) = result {
            self.warn(Warning::SyncFailed(error.to_string()));
        }

        self.transition(RunStatus::Done)
    }

    /// Every archived output, plus restarts that are permanent when restart sync is
    /// enabled, plus the latest restart when explicitly requested.
    pub fn sync_request(&self) -> Result<SyncRequest, RunError> {
        let layout = &self.context.layout;
        let archive = layout.archive_path();

        let outputs = fsops::list_archive_indices(&archive, OUTPUT_PREFIX)
            .map_err(RunError::io(&archive))?
            .into_iter()
            .map(|index| layout.output_path(index))
            .collect();

        let restarts = self.restart_listing()?;
        let mut indices = Vec::new();

        if self.context.config.sync.restarts {
            let decision = self.context.retention_policy().decide(&restarts)?;
            indices.extend(decision.permanent.iter().copied());
        }
        if self.context.options.sync_latest {
            indices.extend(restarts.last().map(|restart| restart.index));
        }

        indices.sort_unstable();
        indices.dedup();

        Ok(SyncRequest {
            outputs,
            restarts: indices
                .into_iter()
                .map(|index| layout.restart_path(index))
                .collect(),
        })
    }

    /// Apply the retention policy to the archive. Only real directories are deleted,
    /// linked restarts are left alone.
    pub fn prune_restarts(&mut self, force: bool) -> Result<PruneOutcome, RunError> {
        let restarts = self.restart_listing()?;
        let decision = self.context.retention_policy().decide(&restarts)?;

        if decision.ambiguous && !force && !decision.prunable.is_empty() {
            self.warn(Warning::RetentionAmbiguity {
                restarts: decision.prunable.iter().copied().collect(),
            });
        }

        let mut deleted = Vec::new();

        for index in decision.deletable(force) {
            let path = self.context.layout.restart_path(index);

            match fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => {
                    info!(path = ?path, "Pruning restart {index}");
                    fs::remove_dir_all(&path).map_err(RunError::io(&path))?;
                    deleted.push(index);
                }
                Ok(_) => debug!(path = ?path, "Not pruning restart that is not a directory"),
                Err(error) => debug!(path = ?path, "Skipping restart: {error}"),
            }
        }

        Ok(PruneOutcome { decision, deleted })
    }

    /// archived restarts with their dates, dates are only read when the policy needs them
    fn restart_listing(&self) -> Result<Vec<RestartDirectory>, RunError> {
        let layout = &self.context.layout;
        let archive = layout.archive_path();
        let needs_dates = self.context.retention_policy().needs_dates();

        let restarts = fsops::list_archive_indices(&archive, RESTART_PREFIX)
            .map_err(RunError::io(&archive))?
            .into_iter()
            .map(|index| RestartDirectory {
                index,
                date: needs_dates
                    .then(|| self.collaborators.dates.read_date(&layout.restart_path(index)))
                    .flatten(),
            })
            .collect();

        Ok(restarts)
    }

    /// consume the stop sentinel if present
    fn stop_requested(&self) -> Result<bool, RunError> {
        let stop_file = self.context.layout.stop_file();

        if !fsops::exists(&stop_file) {
            return Ok(false);
        }

        info!(path = ?stop_file, "Stop file found, not starting further runs");
        fsops::remove_path(&stop_file).map_err(RunError::io(&stop_file))?;

        Ok(true)
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), RunError> {
        let current = self.state.status;

        if !current.can_transition(next) {
            return Err(RunError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        debug!(run = self.state.run_index, "{current} -> {next}");
        self.state.status = next;

        Ok(())
    }

    /// mark the run as failed if `stage` fails
    fn guarded<T>(
        &mut self,
        stage: impl FnOnce(&mut Self) -> Result<T, RunError>,
    ) -> Result<T, RunError> {
        let result = stage(self);

        if let Err(error) = &result {
            error!("Run {} failed: {error}", self.state.run_index);
            self.state.status = RunStatus::Error;
        }

        result
    }

    fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    fn userscript(&mut self, stage: &str) {
        let scripts = &self.context.config.userscripts;
        let script = match stage {
            "setup" => &scripts.setup,
            "run" => &scripts.run,
            "archive" => &scripts.archive,
            "error" => &scripts.error,
            _ => &None,
        };
        let Some(script) = script.clone() else {
            return;
        };

        let layout = &self.context.layout;
        let env = [
            ("CADENCE_RUN_INDEX", self.state.run_index.to_string()),
            (
                "CADENCE_WORK_PATH",
                layout.work_path().to_string_lossy().into_owned(),
            ),
            (
                "CADENCE_ARCHIVE_PATH",
                layout.archive_path().to_string_lossy().into_owned(),
            ),
        ];

        if let Err(error) = run_userscript(stage, &script, layout.control_path(), &env) {
            self.warn(Warning::UserScriptFailed {
                stage: stage.to_owned(),
                reason: error.to_string(),
            });
        }
    }

    /// keep the model logs of a failed run next to the archive
    fn save_error_logs(&self) {
        let layout = &self.context.layout;
        let error_logs = layout.error_log_path();
        let model = &self.context.config.model.name;
        let hostname = match nix::unistd::gethostname() {
            Ok(hostname) => hostname.to_string_lossy().into_owned(),
            Err(error) => {
                warn!(error = ?error, "Failed to retrieve hostname for error logs");
                String::from("unknown")
            }
        };

        if let Err(error) = fs::create_dir_all(&error_logs) {
            error!(path = ?error_logs, "Failed to create error log directory: {error}");
            return;
        }

        for extension in ["out", "err"] {
            let source = self.state.work_path.join(format!("{model}.{extension}"));
            let target = error_logs.join(format!(
                "{model}.{}.{hostname}.{extension}",
                self.state.run_index
            ));

            if !source.is_file() {
                continue;
            }

            match fs::copy(&source, &target) {
                Ok(_) => info!(path = ?target, "Saved model log"),
                Err(error) => error!(path = ?target, "Failed to save model log: {error}"),
            }
        }
    }
}

/// Remove the work directory and its link. A hard sweep also removes the archive.
pub fn sweep(layout: &DirectoryLayout, hard: bool) -> Result<(), RunError> {
    let mut paths = vec![layout.work_path(), layout.work_symlink()];

    if hard {
        paths.extend([layout.archive_path(), layout.archive_symlink()]);
    }

    for path in paths {
        if fsops::exists(&path) {
            info!(path = ?path, "Removing");
            fsops::remove_path(&path).map_err(RunError::io(&path))?;
        }
    }

    Ok(())
}
