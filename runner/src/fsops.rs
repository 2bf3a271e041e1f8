//! Small filesystem helpers shared by the manifest store and the run lifecycle.

use crate::layout::parse_archive_index;
use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    os::unix::fs::symlink,
    path::Path,
    process,
};
use tracing::{debug, warn};

/// write `bytes` to a sibling temporary file and rename it over `path`
/// a crash mid write leaves the previous content of `path` intact
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{name}.tmp.{}", process::id()));

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(error) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(error);
    }

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// true if anything (including a dangling symlink) exists at `path`
pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// create a symlink at `link` pointing to `target`
/// an existing symlink is replaced, any other existing file is left alone
pub fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }

    match symlink(target, link) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {
            let metadata = fs::symlink_metadata(link)?;

            if !metadata.file_type().is_symlink() {
                warn!(
                    target = ?target,
                    link = ?link,
                    "Cannot create symbolic link, a file with that name already exists"
                );

                return Ok(());
            }

            if fs::read_link(link)? != target {
                fs::remove_file(link)?;
                symlink(target, link)?;
            }

            Ok(())
        }
        Err(error) => Err(error),
    }
}

/// remove whatever is at `path`, symlinks are removed without following them
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// sorted indices of `<prefix><NNN>` directories in the archive
/// a missing archive is treated as empty
pub fn list_archive_indices(archive_path: &Path, prefix: &str) -> io::Result<Vec<u32>> {
    let entries = match fs::read_dir(archive_path) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };

    let mut indices = Vec::new();

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();

        let Some(index) = name.to_str().and_then(|name| parse_archive_index(prefix, name)) else {
            continue;
        };

        // follows symlinks, linked restart directories still count
        if entry.path().is_dir() {
            indices.push(index);
        } else {
            debug!(path = ?entry.path(), "Skipping archive entry that is not a directory");
        }
    }

    indices.sort_unstable();

    Ok(indices)
}
