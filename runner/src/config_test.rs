use crate::{
    config::{ConfigErrors, ExperimentConfig},
    manifest::ManifestKind,
    retention::{DateOffset, DateUnit, RestartFreq},
};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

#[test]
pub fn empty_config_uses_defaults() {
    let config = ExperimentConfig::parse("").unwrap();

    assert_eq!(config.restart_freq, RestartFreq::Interval(5));
    assert_eq!(config.restart_history, None);
    assert_eq!(config.model.name, "model");
    assert_eq!(config.model.input_subdir, PathBuf::from("INPUT"));
    assert_eq!(config.model.restart_out_subdir, PathBuf::from("RESTART"));
    assert_eq!(config.manifest.ignore, vec![String::from(".*")]);
    assert!(config.collate.enable);
    assert!(!config.sync.enable);
    assert!(config.unknown_keys().is_empty());
}

#[test]
pub fn full_config_parses() {
    let config = ExperimentConfig::parse(
        "
laboratory: /scratch/lab
experiment: spinup
model:
  name: mom
  exe: [mom.x]
  input: [grid, forcing]
  restart_date_file: date.txt
  ncpus: 4
  timeout: 3600
  env:
    OMP_NUM_THREADS: '1'
  mpi:
    runcmd: mpirun
    flags: [--bind-to, core]
restart_freq: 1YS
restart_history: 3
manifest:
  reproduce:
    exe: true
  ignore: ['.*', '*.tmp']
  hash_threads: 8
scheduler:
  queue: normal
  walltime: '10:00:00'
collate:
  enable: false
sync:
  enable: true
  restarts: true
  command: [rsync, -a]
  url: remote:/archive
userscripts:
  archive: ./archive.sh
",
    )
    .unwrap();

    assert_eq!(config.laboratory, Some(PathBuf::from("/scratch/lab")));
    assert_eq!(config.model.exe, vec![PathBuf::from("mom.x")]);
    assert_eq!(config.model.timeout, Some(3600));
    assert_eq!(config.model.env.get("OMP_NUM_THREADS").map(String::as_str), Some("1"));
    assert_eq!(config.model.mpi.runcmd.as_deref(), Some("mpirun"));
    assert_eq!(
        config.restart_freq,
        RestartFreq::Date(DateOffset {
            count: 1,
            unit: DateUnit::YearStart
        })
    );
    assert_eq!(config.restart_history, Some(3));
    assert_eq!(config.manifest.reproduce.get(ManifestKind::Exe), Some(true));
    assert_eq!(config.manifest.reproduce.get(ManifestKind::Input), None);
    assert_eq!(config.manifest.hash_threads, Some(8));
    assert_eq!(config.scheduler.name, "pbs");
    assert!(!config.collate.enable);
    assert_eq!(config.sync.url.as_deref(), Some("remote:/archive"));
    assert_eq!(config.userscripts.archive.as_deref(), Some("./archive.sh"));
    assert!(config.unknown_keys().is_empty());
}

#[test]
pub fn unknown_keys_are_collected_with_their_section() {
    let config = ExperimentConfig::parse(
        "
jobname: test
model:
  exe: [model.x]
  nodes: 2
manifest:
  reproduce:
    everything: true
",
    )
    .unwrap();

    assert_eq!(
        config.unknown_keys(),
        vec![
            String::from("jobname"),
            String::from("model.nodes"),
            String::from("manifest.reproduce.everything"),
        ]
    );
}

#[test]
pub fn invalid_restart_freq_is_rejected() {
    for value in ["0", "YS", "3Y", "-1"] {
        assert!(
            matches!(
                ExperimentConfig::parse(&format!("restart_freq: {value}\n")),
                Err(ConfigErrors::Parse(_))
            ),
            "restart_freq {value}"
        );
    }
}

#[test]
pub fn invalid_ignore_glob_is_rejected() {
    assert!(matches!(
        ExperimentConfig::parse("manifest:\n  ignore: ['[unclosed']\n"),
        Err(ConfigErrors::InvalidGlobs(_))
    ));
}

#[test]
pub fn missing_config_file_yields_defaults() {
    let dir = tempdir().unwrap();
    let config = ExperimentConfig::load(dir.path()).unwrap();

    assert_eq!(config.restart_freq, RestartFreq::default());
}

#[test]
pub fn experiment_binds_control_and_laboratory() {
    let config = ExperimentConfig::parse("laboratory: ../lab\n").unwrap();
    let control = Path::new("/home/user/ocean");

    let experiment = config.experiment(control, None).unwrap();
    assert_eq!(experiment.name, "ocean");
    assert_eq!(experiment.laboratory_path, PathBuf::from("/home/user/ocean/../lab"));

    // the command line wins over the configuration
    let experiment = config
        .experiment(control, Some(Path::new("/scratch/lab")))
        .unwrap();
    assert_eq!(experiment.laboratory_path, PathBuf::from("/scratch/lab"));

    assert!(matches!(
        ExperimentConfig::default().experiment(control, None),
        Err(ConfigErrors::NoLaboratory)
    ));
}
