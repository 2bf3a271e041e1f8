use super::DateReader;
use chrono::{NaiveDate, NaiveDateTime};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const DEFAULT_DATE_FILE: &str = "restart_date.txt";

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Reads the simulation date from a small text file the model writes into each restart
/// directory. The first non-empty line holds the date.
#[derive(Clone, Debug)]
pub struct TimestampFileReader {
    file_name: PathBuf,
}

impl TimestampFileReader {
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl Default for TimestampFileReader {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_FILE)
    }
}

impl DateReader for TimestampFileReader {
    fn read_date(&self, restart_path: &Path) -> Option<NaiveDateTime> {
        let path = restart_path.join(&self.file_name);

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = ?path, "No restart date file");
                return None;
            }
            Err(error) => {
                warn!(path = ?path, "Failed to read restart date: {error}");
                return None;
            }
        };

        let line = contents.lines().map(str::trim).find(|line| !line.is_empty())?;
        let date = parse_date(line);

        if date.is_none() {
            warn!(path = ?path, "Unrecognised restart date '{line}'");
        }

        date
    }
}

/// ISO 8601 style date times, or a plain date meaning midnight
pub fn parse_date(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
