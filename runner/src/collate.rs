use crate::{
    config::CollateConfig,
    executors::{run_command, ExecutorError},
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Post processes the output of a finished run
pub trait Collator {
    fn collate(&mut self, output_path: &Path) -> Result<(), ExecutorError>;
}

/// Runs the configured collation command with the output directory as last argument
#[derive(Clone, Debug)]
pub struct CommandCollator {
    command: Vec<String>,
    control_path: PathBuf,
}

impl CommandCollator {
    /// `None` if collation is disabled or no command is configured
    pub fn from_config(config: &CollateConfig, control_path: &Path) -> Option<Self> {
        (config.enable && !config.command.is_empty()).then(|| Self {
            command: config.command.clone(),
            control_path: control_path.to_path_buf(),
        })
    }
}

impl Collator for CommandCollator {
    fn collate(&mut self, output_path: &Path) -> Result<(), ExecutorError> {
        info!(path = ?output_path, "Collating output");

        run_command(&self.command, [output_path], &self.control_path)
    }
}
