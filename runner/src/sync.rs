use crate::{
    config::SyncConfig,
    executors::{run_command, ExecutorError},
};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::info;

/// Archive directories eligible for transfer to the remote archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub outputs: Vec<PathBuf>,
    pub restarts: Vec<PathBuf>,
}

impl SyncRequest {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.restarts.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.outputs.iter().chain(self.restarts.iter())
    }
}

/// Copies archived directories to a remote location
pub trait RemoteSync {
    fn sync(&mut self, request: &SyncRequest) -> Result<(), ExecutorError>;
}

/// Runs the configured transfer command with every source path followed by the destination
#[derive(Clone, Debug)]
pub struct CommandSync {
    command: Vec<String>,
    url: String,
    control_path: PathBuf,
}

impl CommandSync {
    /// `None` unless sync is enabled with a command and destination
    pub fn from_config(config: &SyncConfig, control_path: &Path) -> Option<Self> {
        if !config.enable || config.command.is_empty() {
            return None;
        }

        config.url.as_ref().map(|url| Self {
            command: config.command.clone(),
            url: url.clone(),
            control_path: control_path.to_path_buf(),
        })
    }
}

impl RemoteSync for CommandSync {
    fn sync(&mut self, request: &SyncRequest) -> Result<(), ExecutorError> {
        if request.is_empty() {
            return Ok(());
        }

        info!(
            outputs = request.outputs.len(),
            restarts = request.restarts.len(),
            "Syncing archive to {}",
            self.url
        );

        let args = request
            .paths()
            .map(|path| path.as_os_str().to_owned())
            .chain([self.url.as_str().into()])
            .collect_vec();

        run_command(&self.command, args, &self.control_path)
    }
}
