//! Decides which archived restart directories are permanent and which may be pruned.
//!
//! Nothing is persisted: every decision is recomputed from the archive listing, so a
//! changed `restart_freq` takes effect on the next call.

pub mod offset;
pub mod restart_date;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

pub use offset::{DateOffset, DateUnit};

const DEFAULT_RESTART_FREQ: u32 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetentionError {
    #[error("Invalid restart frequency '{0}'")]
    InvalidFrequency(String),
    #[error("No numerical value given for offset: {0}")]
    MissingMagnitude(String),
    #[error("Unsupported datetime offset: {0}. Supported offsets: YS, MS, W, D, H, T, S")]
    UnsupportedUnit(String),
    #[error("Restart date {date} cannot be advanced by {offset}")]
    DateOutOfRange {
        date: NaiveDateTime,
        offset: DateOffset,
    },
}

/// Spacing of permanent restarts, either every `n`th run or a simulated time interval
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRestartFreq", into = "RawRestartFreq")]
pub enum RestartFreq {
    Interval(u32),
    Date(DateOffset),
}

/// accepts `restart_freq: 5` as well as `restart_freq: 1YS`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawRestartFreq {
    Int(u64),
    Text(String),
}

impl Default for RestartFreq {
    fn default() -> Self {
        Self::Interval(DEFAULT_RESTART_FREQ)
    }
}

impl TryFrom<RawRestartFreq> for RestartFreq {
    type Error = RetentionError;

    fn try_from(raw: RawRestartFreq) -> Result<Self, Self::Error> {
        match raw {
            RawRestartFreq::Int(value) => u32::try_from(value)
                .ok()
                .filter(|value| *value > 0)
                .map(Self::Interval)
                .ok_or_else(|| RetentionError::InvalidFrequency(value.to_string())),
            RawRestartFreq::Text(value) => value.parse(),
        }
    }
}

impl From<RestartFreq> for RawRestartFreq {
    fn from(freq: RestartFreq) -> Self {
        match freq {
            RestartFreq::Interval(value) => Self::Int(u64::from(value)),
            RestartFreq::Date(offset) => Self::Text(offset.to_string()),
        }
    }
}

impl std::str::FromStr for RestartFreq {
    type Err = RetentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();

        if !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()) {
            return Self::try_from(RawRestartFreq::Int(
                value
                    .parse()
                    .map_err(|_| RetentionError::InvalidFrequency(value.to_owned()))?,
            ));
        }

        value.parse().map(Self::Date)
    }
}

impl fmt::Display for RestartFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(value) => write!(f, "{value}"),
            Self::Date(offset) => write!(f, "{offset}"),
        }
    }
}

/// Reads the simulation date a restart directory was written at
pub trait DateReader {
    fn read_date(&self, restart_path: &Path) -> Option<NaiveDateTime>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RestartDirectory {
    pub index: u32,
    pub date: Option<NaiveDateTime>,
}

impl RestartDirectory {
    pub fn new(index: u32) -> Self {
        Self { index, date: None }
    }

    pub fn dated(index: u32, date: NaiveDateTime) -> Self {
        Self {
            index,
            date: Some(date),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    /// restarts that mark a checkpoint boundary
    pub permanent: BTreeSet<u32>,
    /// restarts that may be deleted
    pub prunable: BTreeSet<u32>,
    /// intermediates waiting for the next permanent restart
    pub pending: BTreeSet<u32>,
    pub highest: Option<u32>,
    /// a previous decision on this archive would already have pruned restarts that still
    /// exist, deletion needs an explicit force
    pub ambiguous: bool,
}

impl RetentionDecision {
    pub fn is_permanent(&self, index: u32) -> bool {
        self.permanent.contains(&index)
    }

    /// restarts that may actually be deleted now
    pub fn deletable(&self, force: bool) -> Vec<u32> {
        if self.ambiguous && !force {
            return Vec::new();
        }

        self.prunable.iter().copied().collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    freq: RestartFreq,
    history: Option<u32>,
}

impl RetentionPolicy {
    pub fn new(freq: RestartFreq, history: Option<u32>) -> Self {
        Self { freq, history }
    }

    pub fn freq(&self) -> RestartFreq {
        self.freq
    }

    /// date based policies need a `DateReader`
    pub fn needs_dates(&self) -> bool {
        matches!(self.freq, RestartFreq::Date(_))
    }

    /// Decide over the current restart listing, in any order.
    pub fn decide(&self, restarts: &[RestartDirectory]) -> Result<RetentionDecision, RetentionError> {
        let mut restarts = restarts.to_vec();
        restarts.sort_by_key(|restart| restart.index);
        restarts.dedup_by_key(|restart| restart.index);

        let mut decision = self.classify(&restarts)?;

        if let Some((_, prior)) = restarts.split_last() {
            let previous = self.classify(prior)?;

            if !previous.prunable.is_empty() {
                warn!(
                    restarts = ?previous.prunable,
                    "Restarts kept by an earlier prune would now be deleted, use force to prune them"
                );
                decision.ambiguous = true;
            }
        }

        Ok(decision)
    }

    fn classify(&self, restarts: &[RestartDirectory]) -> Result<RetentionDecision, RetentionError> {
        let Some(highest) = restarts.last().map(|restart| restart.index) else {
            return Ok(RetentionDecision::default());
        };

        let mut decision = RetentionDecision {
            highest: Some(highest),
            ..Default::default()
        };
        let mut intermediates = Vec::new();

        match self.freq {
            RestartFreq::Interval(freq) => {
                for restart in restarts {
                    if restart.index % freq == 0 {
                        decision.permanent.insert(restart.index);
                        decision.prunable.extend(intermediates.drain(..));
                    } else {
                        intermediates.push(restart.index);
                    }
                }
            }
            RestartFreq::Date(offset) => {
                let mut checkpoint: Option<NaiveDateTime> = None;

                for restart in restarts {
                    let Some(date) = restart.date else {
                        debug!(index = restart.index, "Restart has no date, keeping it");
                        continue;
                    };

                    let permanent = match checkpoint {
                        Some(checkpoint) => date >= checkpoint,
                        None => true,
                    };

                    if permanent {
                        checkpoint = Some(
                            offset
                                .add_to(date)
                                .ok_or(RetentionError::DateOutOfRange { date, offset })?,
                        );
                        decision.permanent.insert(restart.index);
                        decision.prunable.extend(intermediates.drain(..));
                    } else {
                        intermediates.push(restart.index);
                    }
                }
            }
        }

        decision.pending.extend(intermediates);
        decision.prunable.remove(&highest);
        decision.pending.remove(&highest);

        if let Some(history) = self.history {
            let oldest_kept = i64::from(highest) - i64::from(history);
            decision
                .prunable
                .retain(|index| i64::from(*index) <= oldest_kept);
        }

        Ok(decision)
    }
}
