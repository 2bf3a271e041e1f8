use crate::{
    collate::Collator,
    executors::{Executor, ExecutorError},
    layout::DirectoryLayout,
    lifecycle::{
        sweep, Collaborators, RunContext, RunError, RunLifecycle, RunOptions, RunStatus, Warning,
    },
    manifest::{
        hash, manager::ManifestManager, manager::Reproduce, ManifestError, ManifestKind,
    },
    retention::DateReader,
    sync::{RemoteSync, SyncRequest},
};
use chrono::NaiveDateTime;
use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};
use tempfile::{tempdir, TempDir};

const CONFIG: &str = "\
model:
  name: ocean
  exe: [model.x]
  input: [grid]
restart_freq: 2
";

/// what the model saw in its work directory
#[derive(Clone, Debug, Default)]
struct Observed {
    prior_restart: Vec<bool>,
    inputs: Vec<bool>,
}

struct FakeModel {
    observed: Rc<RefCell<Observed>>,
    exit_code: i32,
    write_restart: bool,
}

impl Executor for FakeModel {
    fn execute(&mut self, work_path: &Path) -> Result<i32, ExecutorError> {
        let mut observed = self.observed.borrow_mut();
        observed
            .prior_restart
            .push(work_path.join("INPUT/ocean.res").is_file());
        observed
            .inputs
            .push(work_path.join("INPUT/grid.nc").is_file() && work_path.join("model.x").is_file());

        fs::write(work_path.join("ocean.out"), "stepping\n").unwrap();
        fs::write(work_path.join("ocean.err"), "").unwrap();

        if self.write_restart {
            let restart = work_path.join("RESTART");
            fs::create_dir_all(&restart).unwrap();
            fs::write(
                restart.join("ocean.res"),
                format!("state {}", observed.inputs.len()),
            )
            .unwrap();
        }

        Ok(self.exit_code)
    }
}

struct NoDates;

impl DateReader for NoDates {
    fn read_date(&self, _restart_path: &Path) -> Option<NaiveDateTime> {
        None
    }
}

struct FailingCollator;

impl Collator for FailingCollator {
    fn collate(&mut self, _output_path: &Path) -> Result<(), ExecutorError> {
        Err(ExecutorError::CommandFailed {
            program: String::from("collate"),
            code: 1,
        })
    }
}

struct RecordingSync(Rc<RefCell<Vec<SyncRequest>>>);

impl RemoteSync for RecordingSync {
    fn sync(&mut self, request: &SyncRequest) -> Result<(), ExecutorError> {
        self.0.borrow_mut().push(request.clone());
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    observed: Rc<RefCell<Observed>>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(CONFIG)
    }

    fn with_config(config: &str) -> Self {
        let dir = tempdir().unwrap();
        let fixture = Self {
            dir,
            observed: Rc::default(),
        };

        fs::create_dir_all(fixture.control()).unwrap();
        fs::write(fixture.control().join("config.yaml"), config).unwrap();
        fixture.write_lab("bin/model.x", "#!/bin/sh\n");
        fixture.write_lab("input/grid/grid.nc", "grid data");

        fixture
    }

    fn control(&self) -> PathBuf {
        self.dir.path().join("ocean_control")
    }

    fn lab(&self) -> PathBuf {
        self.dir.path().join("lab")
    }

    fn write_lab(&self, relative: &str, contents: &str) {
        let path = self.lab().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn context(&self, options: RunOptions) -> RunContext {
        RunContext::load(&self.control(), Some(&self.lab()), options).unwrap()
    }

    fn layout(&self) -> DirectoryLayout {
        self.context(RunOptions::default()).layout
    }

    fn collaborators(&self, exit_code: i32) -> Collaborators {
        Collaborators {
            executor: Box::new(FakeModel {
                observed: self.observed.clone(),
                exit_code,
                write_restart: true,
            }),
            dates: Box::new(NoDates),
            collator: None,
            sync: None,
        }
    }

    fn lifecycle(&self, options: RunOptions) -> RunLifecycle {
        RunLifecycle::new(self.context(options), self.collaborators(0))
    }

    fn run(&self, options: RunOptions) -> Result<Vec<u32>, RunError> {
        self.lifecycle(options).run().map(|report| report.completed)
    }
}

fn runs(n_runs: u32) -> RunOptions {
    RunOptions {
        n_runs,
        ..Default::default()
    }
}

fn reproduce() -> RunOptions {
    RunOptions {
        reproduce: true,
        ..Default::default()
    }
}

#[test]
pub fn successive_runs_archive_outputs_and_restarts() {
    let fixture = Fixture::new();
    let layout = fixture.layout();

    assert_eq!(fixture.run(runs(3)).unwrap(), vec![0, 1, 2]);

    for index in 0..3 {
        assert!(layout.output_path(index).is_dir());
        assert!(layout
            .output_path(index)
            .join("manifests/input.yaml")
            .is_file());
    }
    assert!(layout.output_path(0).join("config.yaml").is_file());
    assert!(layout.output_path(0).join("ocean.out").is_file());
    assert!(!layout.work_path().exists());
    assert!(!layout.work_symlink().exists());
    assert_eq!(
        fs::read_link(layout.archive_symlink()).unwrap(),
        layout.archive_path()
    );

    let observed = fixture.observed.borrow();
    assert_eq!(observed.prior_restart, vec![false, true, true]);
    assert_eq!(observed.inputs, vec![true, true, true]);
}

#[test]
pub fn restart_manifest_describes_latest_archived_restart() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fixture.run(runs(2)).unwrap();

    let manifests = ManifestManager::load(&layout, Reproduce::default(), None).unwrap();
    let restart = manifests.manifest(ManifestKind::Restart);

    assert_eq!(restart.keys().collect::<Vec<_>>(), vec!["INPUT/ocean.res"]);
    assert_eq!(
        restart.get("INPUT/ocean.res").unwrap().fullpath,
        layout.restart_path(1).join("ocean.res")
    );
    assert!(manifests
        .manifest(ManifestKind::Input)
        .contains("INPUT/grid.nc"));
    assert!(manifests.manifest(ManifestKind::Exe).contains("model.x"));
}

#[test]
pub fn every_run_rehashes_executables() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fixture.run(runs(1)).unwrap();

    let exe_manifest = layout.manifest_path(ManifestKind::Exe);
    let recorded = ManifestManager::load(&layout, Reproduce::default(), None)
        .unwrap()
        .manifest(ManifestKind::Exe)
        .get("model.x")
        .unwrap()
        .hashes
        .clone();
    let Some(md5) = recorded.md5 else {
        panic!("exe record without md5");
    };
    let contents = fs::read_to_string(&exe_manifest).unwrap();
    fs::write(&exe_manifest, contents.replace(&md5, &"0".repeat(32))).unwrap();

    fixture.run(runs(1)).unwrap();

    let manifests = ManifestManager::load(&layout, Reproduce::default(), None).unwrap();
    let record = manifests.manifest(ManifestKind::Exe).get("model.x").unwrap();
    assert_eq!(
        record.hashes.md5,
        Some(hash::md5(&fixture.lab().join("bin/model.x")).unwrap())
    );
    assert_eq!(record.hashes.binhash, recorded.binhash);
}

#[test]
pub fn run_index_is_one_past_highest_output() {
    let fixture = Fixture::new();
    fixture.run(runs(2)).unwrap();

    assert_eq!(fixture.lifecycle(runs(1)).resolve_run_index().unwrap(), 2);

    // an explicit index reruns without moving the default
    let layout = fixture.layout();
    fs::rename(layout.output_path(1), fixture.dir.path().join("saved")).unwrap();
    fs::remove_dir_all(layout.restart_path(1)).unwrap();
    fs::create_dir(layout.output_path(5)).unwrap();

    let rerun = RunOptions {
        run_index: Some(1),
        ..Default::default()
    };
    assert_eq!(fixture.run(rerun).unwrap(), vec![1]);
    assert_eq!(fixture.lifecycle(runs(1)).resolve_run_index().unwrap(), 6);
}

#[test]
pub fn existing_work_directory_needs_force() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fs::create_dir_all(layout.work_path()).unwrap();
    fs::write(layout.work_path().join("leftover"), "old").unwrap();

    let mut lifecycle = fixture.lifecycle(runs(1));
    lifecycle.init(0).unwrap();

    assert!(matches!(
        lifecycle.setup(),
        Err(RunError::WorkDirectoryExists(_))
    ));
    assert_eq!(lifecycle.state().status, RunStatus::Error);
    assert!(layout.work_path().join("leftover").is_file());

    let forced = RunOptions {
        force: true,
        ..Default::default()
    };
    let mut lifecycle = fixture.lifecycle(forced);
    lifecycle.init(0).unwrap();
    lifecycle.setup().unwrap();

    assert!(!layout.work_path().join("leftover").exists());
    assert!(layout.work_path().join("INPUT/grid.nc").is_file());
    assert_eq!(
        fs::read_link(layout.work_symlink()).unwrap(),
        layout.work_path()
    );
}

#[test]
pub fn existing_archive_entry_is_not_overwritten() {
    let fixture = Fixture::new();
    fixture.run(runs(1)).unwrap();

    let again = RunOptions {
        run_index: Some(0),
        ..Default::default()
    };

    assert!(matches!(
        fixture.run(again),
        Err(RunError::ArchiveExists(path)) if path.ends_with("output000")
    ));
    assert!(!fixture.layout().work_path().exists());
}

#[test]
pub fn reproduce_passes_when_nothing_changed() {
    let fixture = Fixture::new();
    fixture.run(runs(1)).unwrap();

    assert_eq!(fixture.run(reproduce()).unwrap(), vec![1]);
    assert_eq!(
        fixture.observed.borrow().prior_restart,
        vec![false, true]
    );
}

#[test]
pub fn reproduce_rejects_modified_executable_before_staging() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fixture.run(runs(1)).unwrap();

    fixture.write_lab("bin/model.x", "#!/bin/sh\necho rebuilt\n");

    let mut lifecycle = fixture.lifecycle(reproduce());
    lifecycle.init(1).unwrap();

    match lifecycle.setup() {
        Err(RunError::Manifest(ManifestError::ReproduceMismatch { kind, key, .. })) => {
            assert_eq!(kind, ManifestKind::Exe);
            assert_eq!(key, "model.x");
        }
        other => panic!("unexpected result {other:?}"),
    }

    assert_eq!(lifecycle.state().status, RunStatus::Error);
    assert!(!layout.work_path().exists());
    assert_eq!(fixture.observed.borrow().inputs.len(), 1);
}

#[test]
pub fn reproduce_without_manifests_fails() {
    let fixture = Fixture::new();

    assert!(matches!(
        fixture.run(reproduce()),
        Err(RunError::Manifest(ManifestError::ManifestRequired(
            ManifestKind::Exe
        )))
    ));
    assert!(!fixture.layout().work_path().exists());
}

#[test]
pub fn removed_input_is_reported() {
    let fixture = Fixture::new();
    fixture.write_lab("input/grid/mask.nc", "mask");
    fixture.run(runs(1)).unwrap();

    fs::remove_file(fixture.lab().join("input/grid/mask.nc")).unwrap();
    let report = fixture.lifecycle(runs(1)).run().unwrap();

    assert!(report
        .warnings
        .contains(&Warning::InputRemoved(String::from("INPUT/mask.nc"))));
}

#[test]
pub fn failed_model_keeps_work_directory_and_logs() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    let mut lifecycle = RunLifecycle::new(
        fixture.context(runs(1)),
        fixture.collaborators(1),
    );

    assert!(matches!(
        lifecycle.run(),
        Err(RunError::ModelFailed { index: 0, code: 1 })
    ));
    assert_eq!(lifecycle.state().status, RunStatus::Error);
    assert!(layout.work_path().join("ocean.out").is_file());
    assert!(!layout.output_path(0).exists());

    let logs: Vec<String> = fs::read_dir(layout.error_log_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(logs
        .iter()
        .any(|name| name.starts_with("ocean.0.") && name.ends_with(".out")));
    assert!(logs.iter().any(|name| name.ends_with(".err")));
}

#[test]
pub fn stop_file_halts_resubmission() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fs::write(layout.stop_file(), "").unwrap();

    let report = fixture.lifecycle(runs(3)).run().unwrap();

    assert!(report.stopped);
    assert!(report.completed.is_empty());
    assert!(!layout.stop_file().exists());
    assert!(!layout.output_path(0).exists());
}

#[test]
pub fn restarts_between_permanent_ones_are_pruned() {
    let fixture = Fixture::new();
    let layout = fixture.layout();

    fixture.run(runs(5)).unwrap();

    let remaining: Vec<u32> = (0..5)
        .filter(|index| layout.restart_path(*index).is_dir())
        .collect();
    assert_eq!(remaining, vec![0, 2, 4]);
}

#[test]
pub fn linked_restarts_are_never_pruned() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fixture.run(runs(2)).unwrap();

    // replace restart001 with a link to data kept elsewhere
    let elsewhere = fixture.dir.path().join("elsewhere");
    fs::rename(layout.restart_path(1), &elsewhere).unwrap();
    std::os::unix::fs::symlink(&elsewhere, layout.restart_path(1)).unwrap();

    fixture.run(runs(1)).unwrap();

    assert!(layout.restart_path(1).exists());
    assert!(elsewhere.join("ocean.res").is_file());
}

#[test]
pub fn ambiguous_prune_waits_for_force() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    for index in 0..4 {
        let restart = layout.restart_path(index);
        fs::create_dir_all(&restart).unwrap();
        fs::write(restart.join("ocean.res"), "state").unwrap();
    }

    let mut lifecycle = fixture.lifecycle(runs(1));
    let outcome = lifecycle.prune_restarts(false).unwrap();

    assert!(outcome.decision.ambiguous);
    assert!(outcome.deleted.is_empty());
    assert!(matches!(
        lifecycle.warnings().last(),
        Some(Warning::RetentionAmbiguity { restarts }) if restarts == &vec![1]
    ));

    let outcome = lifecycle.prune_restarts(true).unwrap();
    assert_eq!(outcome.deleted, vec![1]);
    assert!(!layout.restart_path(1).exists());
}

/// archive with runs 0..4 done and restart001 kept although restart002 is permanent
fn ambiguous_archive(fixture: &Fixture) -> DirectoryLayout {
    let layout = fixture.layout();

    for index in 0..4 {
        fs::create_dir_all(layout.output_path(index)).unwrap();
        let restart = layout.restart_path(index);
        fs::create_dir_all(&restart).unwrap();
        fs::write(restart.join("ocean.res"), "state").unwrap();
    }

    layout
}

#[test]
pub fn run_keeps_ambiguous_restarts_without_force() {
    let fixture = Fixture::new();
    let layout = ambiguous_archive(&fixture);

    let report = fixture.lifecycle(runs(1)).run().unwrap();

    assert_eq!(report.completed, vec![4]);
    assert!(report.warnings.contains(&Warning::RetentionAmbiguity {
        restarts: vec![1, 3]
    }));
    for index in 0..5 {
        assert!(layout.restart_path(index).is_dir(), "restart {index}");
    }
}

#[test]
pub fn run_with_force_prunes_ambiguous_restarts() {
    let fixture = Fixture::new();
    let layout = ambiguous_archive(&fixture);

    let report = fixture
        .lifecycle(RunOptions {
            force_prune_restarts: true,
            ..Default::default()
        })
        .run()
        .unwrap();

    assert_eq!(report.completed, vec![4]);
    assert!(!report
        .warnings
        .iter()
        .any(|warning| matches!(warning, Warning::RetentionAmbiguity { .. })));

    let remaining: Vec<u32> = (0..5)
        .filter(|index| layout.restart_path(*index).is_dir())
        .collect();
    assert_eq!(remaining, vec![0, 2, 4]);
}

#[test]
pub fn missing_restart_output_is_a_warning() {
    let fixture = Fixture::new();
    let mut collaborators = fixture.collaborators(0);
    collaborators.executor = Box::new(FakeModel {
        observed: fixture.observed.clone(),
        exit_code: 0,
        write_restart: false,
    });

    let report = RunLifecycle::new(fixture.context(runs(1)), collaborators)
        .run()
        .unwrap();

    assert!(report
        .warnings
        .iter()
        .any(|warning| matches!(warning, Warning::NoRestartOutput(_))));
    assert!(fixture.layout().output_path(0).is_dir());
}

#[test]
pub fn collate_and_sync_failures_do_not_fail_the_run() {
    let fixture = Fixture::with_config(&format!("{CONFIG}sync:\n  restarts: true\n"));
    let layout = fixture.layout();
    let requests = Rc::new(RefCell::new(Vec::new()));

    let mut collaborators = fixture.collaborators(0);
    collaborators.collator = Some(Box::new(FailingCollator));
    collaborators.sync = Some(Box::new(RecordingSync(requests.clone())));

    let options = RunOptions {
        n_runs: 2,
        sync_latest: true,
        ..Default::default()
    };
    let mut lifecycle = RunLifecycle::new(fixture.context(options), collaborators);
    let report = lifecycle.run().unwrap();

    assert_eq!(report.completed, vec![0, 1]);
    assert_eq!(lifecycle.state().status, RunStatus::Done);
    assert_eq!(
        report
            .warnings
            .iter()
            .filter(|warning| matches!(warning, Warning::CollateFailed(_)))
            .count(),
        2
    );

    let requests = requests.borrow();
    let last = requests.last().unwrap();
    assert_eq!(
        last.outputs,
        vec![layout.output_path(0), layout.output_path(1)]
    );
    // restart000 is permanent, restart001 is only sent as the latest
    assert_eq!(
        last.restarts,
        vec![layout.restart_path(0), layout.restart_path(1)]
    );
}

#[test]
pub fn stages_must_run_in_order() {
    let fixture = Fixture::new();
    let mut lifecycle = fixture.lifecycle(runs(1));

    assert!(matches!(
        lifecycle.execute(),
        Err(RunError::InvalidTransition {
            from: RunStatus::Init,
            to: RunStatus::Executing
        })
    ));
}

#[test]
pub fn sweep_removes_work_and_optionally_archive() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fixture.run(runs(1)).unwrap();

    let mut lifecycle = fixture.lifecycle(runs(1));
    lifecycle.init(1).unwrap();
    lifecycle.setup().unwrap();

    sweep(&layout, false).unwrap();
    assert!(!layout.work_path().exists());
    assert!(!layout.work_symlink().exists());
    assert!(layout.output_path(0).is_dir());

    sweep(&layout, true).unwrap();
    assert!(!layout.archive_path().exists());
    assert!(!layout.archive_symlink().exists());
    assert!(fixture.control().join("config.yaml").is_file());
}
