use cadence::{
    fsops,
    layout::OUTPUT_PREFIX,
    lifecycle::{sweep, Collaborators, RunContext, RunError, RunLifecycle, RunOptions},
};
use clap::{Args, Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Resumable simulation run manager")]
struct Cli {
    /// Control directory holding config.yaml
    #[arg(long, global = true, default_value = ".")]
    control: PathBuf,
    /// Laboratory root, overrides `laboratory` from the configuration
    #[arg(long, global = true)]
    laboratory: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StageArgs {
    /// Replace an existing work directory
    #[arg(short, long)]
    force: bool,
    /// Require the staged files to match the saved manifests
    #[arg(short, long)]
    reproduce: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more successive jobs
    Run {
        #[arg(short = 'n', long, default_value_t = 1)]
        n_runs: u32,
        /// Start at this run index instead of after the latest output
        #[arg(short = 'i', long)]
        index: Option<u32>,
        #[command(flatten)]
        stage: StageArgs,
        /// Delete restarts kept by an earlier retention policy
        #[arg(long)]
        force_prune_restarts: bool,
        /// Sync the latest restart as well
        #[arg(long)]
        sync_latest: bool,
    },
    /// Stage the work directory without running the model
    Setup {
        #[arg(short = 'i', long)]
        index: Option<u32>,
        #[command(flatten)]
        stage: StageArgs,
    },
    /// Remove the work directory, and the archive with --hard
    Sweep {
        #[arg(long)]
        hard: bool,
    },
    /// Collate an archived output directory
    Collate {
        #[arg(short = 'i', long, conflicts_with = "dir")]
        index: Option<u32>,
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,
    },
    /// Apply the restart retention policy to the archive
    Prune {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), RunError> {
    let control = if cli.control.is_absolute() {
        cli.control
    } else {
        std::env::current_dir()
            .map_err(|source| RunError::Io {
                path: cli.control.clone(),
                source,
            })?
            .join(&cli.control)
    };
    let laboratory = cli.laboratory.as_deref();

    match cli.command {
        Commands::Run {
            n_runs,
            index,
            stage,
            force_prune_restarts,
            sync_latest,
        } => {
            let options = RunOptions {
                n_runs,
                run_index: index,
                force: stage.force,
                reproduce: stage.reproduce,
                force_prune_restarts,
                sync_latest,
            };
            let mut lifecycle = lifecycle(&control, laboratory, options)?;
            let report = lifecycle.run()?;

            info!(
                runs = report.completed.len(),
                warnings = report.warnings.len(),
                stopped = report.stopped,
                "Finished"
            );
        }
        Commands::Setup { index, stage } => {
            let options = RunOptions {
                run_index: index,
                force: stage.force,
                reproduce: stage.reproduce,
                ..Default::default()
            };
            let mut lifecycle = lifecycle(&control, laboratory, options)?;
            let index = lifecycle.resolve_run_index()?;

            lifecycle.init(index)?;
            lifecycle.setup()?;
            info!(path = ?lifecycle.state().work_path, "Work directory ready for run {index}");
        }
        Commands::Sweep { hard } => {
            let context = RunContext::load(&control, laboratory, RunOptions::default())?;
            sweep(&context.layout, hard)?;
        }
        Commands::Collate { index, dir } => {
            let mut lifecycle = lifecycle(&control, laboratory, RunOptions::default())?;
            let layout = &lifecycle.context().layout;

            let output = match (dir, index) {
                (Some(dir), _) => dir,
                (None, Some(index)) => layout.output_path(index),
                (None, None) => {
                    let archive = layout.archive_path();
                    let latest = fsops::list_archive_indices(&archive, OUTPUT_PREFIX)
                        .map_err(|source| RunError::Io {
                            path: archive.clone(),
                            source,
                        })?
                        .last()
                        .copied();

                    match latest {
                        Some(index) => layout.output_path(index),
                        None => {
                            warn!(path = ?archive, "No archived outputs to collate");
                            return Ok(());
                        }
                    }
                }
            };

            lifecycle.collate_output(&output);
        }
        Commands::Prune { force } => {
            let mut lifecycle = lifecycle(&control, laboratory, RunOptions::default())?;
            let outcome = lifecycle.prune_restarts(force)?;

            info!(
                permanent = outcome.decision.permanent.len(),
                pending = outcome.decision.pending.len(),
                deleted = ?outcome.deleted,
                "Pruned restarts"
            );
        }
    }

    Ok(())
}

fn lifecycle(
    control: &Path,
    laboratory: Option<&Path>,
    options: RunOptions,
) -> Result<RunLifecycle, RunError> {
    let context = RunContext::load(control, laboratory, options)?;
    let collaborators = Collaborators::from_context(&context);

    Ok(RunLifecycle::new(context, collaborators))
}
