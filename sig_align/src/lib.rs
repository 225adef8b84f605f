//! Gap repair and time-base resampling for multi-channel physiological signals.
//!
//! Channels arrive as tokenized columns with a native sampling period. Each one
//! is repaired (missing samples filled from their neighbours) and then
//! re-expressed on a single shared sampling period so the whole run can be
//! stacked into one gap-free table.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod cell;
pub mod rate;
pub mod repair;
pub mod run;

pub use cell::Cell;
pub use rate::{
    decimate, normalize, sample_rate_hz, select_target_period, upsample, RateRegime,
};
pub use repair::{repair, repair_with_stats, GapStats};
pub use run::{
    process_channels, process_run, AlignedTable, ChannelDiagnostics, ChannelError,
    FailurePolicy, NormalizedChannel, RawChannel, RunOutput,
};

/// Grid used when no channel is sampled faster than it.
pub const DEFAULT_FIXED_PERIOD_MS: u32 = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaError {
    #[error("malformed cell at row {row}: {token:?}")]
    MalformedCell { row: usize, token: String },
    #[error("unsupported rate ratio: native {native_ms} ms vs target {target_ms} ms")]
    UnsupportedRateRatio { native_ms: u32, target_ms: u32 },
    #[error("invalid sampling period: {0} ms")]
    InvalidPeriod(u32),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    ChannelFailed(Box<ChannelError>),
    #[error("no channels supplied")]
    NoChannels,
}

/// How a run of consecutive missing samples is filled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Each filled sample becomes the new baseline, so a run of gaps ramps
    /// toward the next known value.
    Ramp,
    /// The baseline stays at the last real sample; every gap in a run gets the
    /// same midpoint.
    Hold,
}

impl Default for GapPolicy {
    fn default() -> Self {
        GapPolicy::Ramp
    }
}

/// How the shared target period of a run is chosen.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetPolicy {
    /// Finest native period when any channel is faster than the fixed grid,
    /// the fixed grid otherwise.
    Adaptive,
    /// Always the fixed grid; faster channels are decimated onto it.
    Fixed,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        TargetPolicy::Adaptive
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub gap_policy: GapPolicy,
    pub target_policy: TargetPolicy,
    pub fixed_period_ms: u32,
    /// Tokens treated as missing in addition to blank cells.
    pub missing_tokens: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::Ramp,
            target_policy: TargetPolicy::Adaptive,
            fixed_period_ms: DEFAULT_FIXED_PERIOD_MS,
            missing_tokens: Vec::new(),
        }
    }
}

impl Params {
    pub fn from_json_str(data: &str) -> Result<Self, SaError> {
        let params: Params =
            serde_json::from_str(data).map_err(|e| SaError::Config(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: &Path) -> Result<Self, SaError> {
        let data = fs::read_to_string(path)
            .map_err(|e| SaError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), SaError> {
        if self.fixed_period_ms == 0 {
            return Err(SaError::InvalidParameter(
                "fixed_period_ms must be positive".into(),
            ));
        }
        let finite = |t: &String| t.trim().parse::<f64>().map_or(false, f64::is_finite);
        if self.missing_tokens.iter().any(finite) {
            return Err(SaError::InvalidParameter(
                "missing_tokens must not be finite numbers".into(),
            ));
        }
        Ok(())
    }

    pub fn hash_sha256(&self) -> Result<String, SaError> {
        let bytes = serde_json::to_vec(self).map_err(|e| SaError::Config(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Identity of a channel; fixed for the channel's whole lifetime.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMeta {
    pub id: String,
    pub label: String,
    pub unit: String,
    pub period_ms: u32,
}

impl ChannelMeta {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        period_ms: u32,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            unit: unit.into(),
            period_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    pub meta: ChannelMeta,
    pub cells: Vec<Cell>,
}

impl Channel {
    pub fn new(meta: ChannelMeta, cells: Vec<Cell>) -> Result<Self, SaError> {
        if meta.period_ms == 0 {
            return Err(SaError::InvalidPeriod(0));
        }
        Ok(Self { meta, cells })
    }

    /// Convert a raw column, stopping at the first malformed token.
    pub fn from_tokens<S: AsRef<str>>(
        meta: ChannelMeta,
        tokens: &[S],
        params: &Params,
    ) -> Result<Self, SaError> {
        let cells = tokens
            .iter()
            .enumerate()
            .map(|(row, token)| {
                Cell::parse(token.as_ref(), &params.missing_tokens).ok_or_else(|| {
                    SaError::MalformedCell {
                        row,
                        token: token.as_ref().to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(meta, cells)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn missing_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_missing()).count()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
