use super::{RunError, RunLifecycle, Warning};
use crate::{
    config::DEFAULT_CONFIG_FNAME,
    fsops,
    layout::MANIFEST_DIR,
    manifest::{
        manager::{
            collect_executables, collect_inputs, collect_restarts, ManifestManager, StagedFile,
        },
        ManifestError, ManifestKind,
    },
};
use std::{fs, path::Path};
use tracing::{debug, info};

impl RunLifecycle {
    /// Verify, then build the work directory. Every check that can fail runs before the
    /// first filesystem change.
    pub(super) fn stage_work_directory(&mut self) -> Result<(), RunError> {
        let layout = &self.context.layout;
        let config = &self.context.config;
        let index = self.state.run_index;
        let reproduce = self.state.reproduce;
        let work_path = layout.work_path();

        if fsops::exists(&work_path) && !self.state.forced {
            return Err(RunError::WorkDirectoryExists(work_path));
        }

        let output_path = layout.output_path(index);
        if fsops::exists(&output_path) {
            return Err(RunError::ArchiveExists(output_path));
        }

        let prior_restart = layout.prior_restart_path(index);
        let missing_prior = prior_restart
            .as_ref()
            .filter(|path| !path.is_dir())
            .cloned();

        let mut manifests =
            ManifestManager::load(layout, reproduce, config.manifest.hash_threads)?;
        let ignore = config
            .manifest
            .ignore_set()
            .map_err(ManifestError::from)?;

        let exes = if reproduce.exe {
            Vec::new()
        } else {
            collect_executables(layout, &config.model.exe)?
        };
        let exes = manifests.plan(ManifestKind::Exe, exes);

        let inputs = if reproduce.input {
            Vec::new()
        } else {
            collect_inputs(
                layout,
                &config.model.input,
                &config.model.input_subdir,
                &ignore,
            )?
        };
        let inputs = manifests.plan(ManifestKind::Input, inputs);

        let restarts = match &prior_restart {
            Some(_) if reproduce.restart => manifests.plan(ManifestKind::Restart, Vec::new()),
            Some(prior) => collect_restarts(prior, &config.model.restart_in_subdir, &ignore),
            None => Vec::new(),
        };

        manifests.enforce_reproduce(ManifestKind::Exe)?;
        manifests.enforce_reproduce(ManifestKind::Input)?;
        if index > 0 {
            manifests.enforce_reproduce(ManifestKind::Restart)?;
        }

        // all checks passed, from here on the filesystem changes
        if fsops::exists(&work_path) {
            info!(path = ?work_path, "Removing existing work directory");
            fsops::remove_path(&work_path).map_err(RunError::io(&work_path))?;
        }

        fs::create_dir_all(&work_path).map_err(RunError::io(&work_path))?;
        let work_symlink = layout.work_symlink();
        fsops::make_symlink(&work_path, &work_symlink).map_err(RunError::io(&work_symlink))?;

        let config_path = layout.control_path().join(DEFAULT_CONFIG_FNAME);
        if config_path.is_file() {
            fs::copy(&config_path, work_path.join(DEFAULT_CONFIG_FNAME))
                .map_err(RunError::io(&config_path))?;
        }

        for file in exes.iter().chain(inputs.iter()).chain(restarts.iter()) {
            link_into(&work_path, file)?;
        }

        info!(
            run = index,
            exe = exes.len(),
            input = inputs.len(),
            restart = restarts.len(),
            "Staged work directory"
        );

        manifests.scan_executables(&exes)?;
        let removed = manifests.scan_inputs(&inputs)?;
        manifests.scan_restarts(&restarts)?;
        manifests.save()?;

        self.manifests = Some(manifests);

        if let Some(prior) = missing_prior {
            self.warn(Warning::MissingPriorRestart(prior));
        }
        for key in removed {
            self.warn(Warning::InputRemoved(key));
        }

        Ok(())
    }

    /// Move restarts and outputs of the finished run into the archive and record the
    /// archived restarts in the restart manifest.
    pub(super) fn archive_work_directory(&mut self) -> Result<(), RunError> {
        let layout = &self.context.layout;
        let config = &self.context.config;
        let index = self.state.run_index;
        let work_path = layout.work_path();

        if !work_path.is_dir() {
            return Err(RunError::NoWorkDirectory(work_path));
        }

        let output_path = layout.output_path(index);
        let restart_path = layout.restart_path(index);

        for target in [&output_path, &restart_path] {
            if fsops::exists(target) {
                return Err(RunError::ArchiveExists(target.clone()));
            }
        }

        let archive_path = layout.archive_path();
        fs::create_dir_all(&archive_path).map_err(RunError::io(&archive_path))?;

        let restart_out = work_path.join(&config.model.restart_out_subdir);
        let restart_written = restart_out.is_dir();

        if restart_written {
            fs::rename(&restart_out, &restart_path).map_err(RunError::io(&restart_out))?;
            debug!(path = ?restart_path, "Archived restarts");
        }

        let work_symlink = layout.work_symlink();
        fsops::remove_path(&work_symlink).map_err(RunError::io(&work_symlink))?;
        fs::rename(&work_path, &output_path).map_err(RunError::io(&work_path))?;

        let archive_symlink = layout.archive_symlink();
        fsops::make_symlink(&archive_path, &archive_symlink)
            .map_err(RunError::io(&archive_symlink))?;

        info!(path = ?output_path, "Archived run {index}");

        let mut manifests = match self.manifests.take() {
            Some(manifests) => manifests,
            None => ManifestManager::load(
                layout,
                self.state.reproduce,
                config.manifest.hash_threads,
            )?,
        };
        let ignore = config
            .manifest
            .ignore_set()
            .map_err(ManifestError::from)?;

        let restarts = collect_restarts(&restart_path, &config.model.restart_in_subdir, &ignore);
        manifests.scan_restarts(&restarts)?;
        manifests.save()?;
        manifests.snapshot(&output_path.join(MANIFEST_DIR))?;

        self.manifests = Some(manifests);

        if !restart_written {
            self.warn(Warning::NoRestartOutput(restart_out));
        }

        Ok(())
    }
}

fn link_into(work_path: &Path, file: &StagedFile) -> Result<(), RunError> {
    let link = work_path.join(&file.key);

    fsops::make_symlink(&file.full_path, &link).map_err(RunError::io(&link))
}
