mod local;

pub use local::LocalExecutor;

use std::{
    ffi::OsStr,
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("No model executable configured")]
    NoExecutable,
    #[error("Failed to open log file {path}: {source}")]
    Log { path: PathBuf, source: io::Error },
    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Failed while waiting for {program}: {source}")]
    Wait { program: String, source: io::Error },
    #[error("{program} exceeded its timeout of {seconds} seconds")]
    Timeout { program: String, seconds: u64 },
    #[error("User script '{name}' exited with code {code}")]
    ScriptFailed { name: String, code: i32 },
    #[error("{program} exited with code {code}")]
    CommandFailed { program: String, code: i32 },
}

/// Runs the model inside a staged work directory
pub trait Executor {
    /// exit code of the model, anything but 0 is a failed run
    fn execute(&mut self, work_path: &Path) -> Result<i32, ExecutorError>;
}

/// exit code of a finished process, signals map to the usual `128 + signal`
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Run a configured user script through the shell from the control directory
pub fn run_userscript(
    name: &str,
    script: &str,
    control_path: &Path,
    env: &[(&str, String)],
) -> Result<(), ExecutorError> {
    info!("Running {name} user script");
    debug!(script = script, "User script command");

    let status = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(control_path)
        .envs(env.iter().map(|(key, value)| (*key, value.as_str())))
        .status()
        .map_err(|source| ExecutorError::Spawn {
            program: String::from("sh"),
            source,
        })?;

    match exit_code(status) {
        0 => Ok(()),
        code => Err(ExecutorError::ScriptFailed {
            name: name.to_owned(),
            code,
        }),
    }
}

/// Run `command` with `extra` appended, from `cwd`. Used by the collation and sync
/// collaborators, which are plain subprocess invocations.
pub(crate) fn run_command<I, S>(command: &[String], extra: I, cwd: &Path) -> Result<(), ExecutorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (program, args) = command.split_first().ok_or(ExecutorError::NoExecutable)?;

    let status = Command::new(program)
        .args(args)
        .args(extra)
        .current_dir(cwd)
        .status()
        .map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;

    match exit_code(status) {
        0 => Ok(()),
        code => Err(ExecutorError::CommandFailed {
            program: program.clone(),
            code,
        }),
    }
}
