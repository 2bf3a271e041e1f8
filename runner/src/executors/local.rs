use super::{exit_code, Executor, ExecutorError};
use crate::config::ModelConfig;
use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Executor that runs the model as a local subprocess, optionally through an MPI launcher
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    executables: Vec<String>,
    runcmd: Option<String>,
    flags: Vec<String>,
    ncpus: Option<u32>,
    env: BTreeMap<String, String>,
    log_stem: String,
    timeout: Option<Duration>,
}

impl LocalExecutor {
    /// executables are expected in the work directory under their file name
    pub fn from_config(model: &ModelConfig) -> Self {
        let executables = model
            .exe
            .iter()
            .filter_map(|exe| exe.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        Self {
            executables,
            runcmd: model.mpi.runcmd.clone(),
            flags: model.mpi.flags.clone(),
            ncpus: model.ncpus,
            env: model.env.clone(),
            log_stem: model.name.clone(),
            timeout: model.timeout.map(Duration::from_secs),
        }
    }

    pub fn stdout_path(&self, work_path: &Path) -> PathBuf {
        work_path.join(format!("{}.out", self.log_stem))
    }

    pub fn stderr_path(&self, work_path: &Path) -> PathBuf {
        work_path.join(format!("{}.err", self.log_stem))
    }

    /// Full command line. With a launcher every executable becomes its own MPI program
    /// separated by `:`, without one the first executable is started directly.
    pub fn command_line(&self, work_path: &Path) -> Result<Vec<String>, ExecutorError> {
        let exe_path = |name: &String| work_path.join(name).to_string_lossy().into_owned();

        let Some(runcmd) = &self.runcmd else {
            let first = self.executables.first().ok_or(ExecutorError::NoExecutable)?;

            if self.executables.len() > 1 {
                warn!("Several executables configured without an MPI launcher, only running {first}");
            }

            return Ok(vec![exe_path(first)]);
        };

        if self.executables.is_empty() {
            return Err(ExecutorError::NoExecutable);
        }

        let mut command = vec![runcmd.clone()];
        command.extend(self.flags.iter().cloned());

        for (position, exe) in self.executables.iter().enumerate() {
            if position > 0 {
                command.push(String::from(":"));
            }
            if let Some(ncpus) = self.ncpus {
                command.extend([String::from("-np"), ncpus.to_string()]);
            }
            command.push(exe_path(exe));
        }

        Ok(command)
    }
}

impl Executor for LocalExecutor {
    #[instrument(skip(self), level = "info")]
    fn execute(&mut self, work_path: &Path) -> Result<i32, ExecutorError> {
        let command = self.command_line(work_path)?;
        let (program, args) = command.split_first().ok_or(ExecutorError::NoExecutable)?;

        let open_log = |path: PathBuf| {
            File::create(&path).map_err(|source| ExecutorError::Log { path, source })
        };
        let stdout = open_log(self.stdout_path(work_path))?;
        let stderr = open_log(self.stderr_path(work_path))?;

        info!("Running {}", command.join(" "));
        let start = Instant::now();

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_path)
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let wait_error = |source| ExecutorError::Wait {
            program: program.clone(),
            source,
        };

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(wait_error)? {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    warn!("Model exceeded its timeout, killing it");
                    child.kill().map_err(wait_error)?;
                    child.wait().map_err(wait_error)?;

                    return Err(ExecutorError::Timeout {
                        program: program.clone(),
                        seconds: timeout.as_secs(),
                    });
                }
            },
            None => child.wait().map_err(wait_error)?,
        };

        let code = exit_code(status);
        debug!(
            "Finished in {} s | status: {code}",
            start.elapsed().as_secs()
        );

        Ok(code)
    }
}
