use super::ManifestError;
use ::md5::{Digest, Md5};
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    time::UNIX_EPOCH,
};

/// number of leading bytes that contribute to the binhash
pub const BINHASH_NBYTES: u64 = 100 * 1024 * 1024;

/// Cheap change detection fingerprint: size, modification time and a bounded prefix of the
/// content. Cost is capped by `BINHASH_NBYTES` regardless of file size.
pub fn binhash(path: &Path) -> Result<String, ManifestError> {
    let file = open(path)?;
    let metadata = file
        .metadata()
        .map_err(|source| ManifestError::io(path, source))?;

    let mut hasher = Md5::new();
    hasher.update(metadata.len().to_le_bytes());

    // files stamped before the epoch contribute a zero mtime
    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    hasher.update(modified.as_secs().to_le_bytes());
    hasher.update(modified.subsec_nanos().to_le_bytes());

    io::copy(&mut file.take(BINHASH_NBYTES), &mut hasher)
        .map_err(|source| ManifestError::io(path, source))?;

    Ok(hex::encode(hasher.finalize()))
}

/// md5 of the full content
pub fn md5(path: &Path) -> Result<String, ManifestError> {
    let mut file = open(path)?;
    let mut hasher = Md5::new();

    io::copy(&mut file, &mut hasher).map_err(|source| ManifestError::io(path, source))?;

    Ok(hex::encode(hasher.finalize()))
}

fn open(path: &Path) -> Result<File, ManifestError> {
    File::open(path).map_err(|source| ManifestError::io(path, source))
}
