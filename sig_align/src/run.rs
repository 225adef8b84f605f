//! Whole-run processing: one shared target period, channels repaired and
//! normalized independently, results stacked into an aligned table.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rate::{sample_rate_hz, select_target_period, RateRegime};
use crate::repair::{repair_with_stats, GapStats};
use crate::{Channel, ChannelMeta, Params, SaError};

/// A column as it leaves the tokenizer, before cell conversion.
#[derive(Clone, Debug)]
pub struct RawChannel {
    pub meta: ChannelMeta,
    pub tokens: Vec<String>,
}

impl RawChannel {
    pub fn new<S: Into<String>>(meta: ChannelMeta, tokens: impl IntoIterator<Item = S>) -> Self {
        Self {
            meta,
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("channel {channel}: {kind}")]
pub struct ChannelError {
    pub channel: String,
    #[source]
    pub kind: SaError,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelDiagnostics {
    pub input_len: usize,
    pub output_len: usize,
    pub gaps: GapStats,
    pub regime: RateRegime,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NormalizedChannel {
    pub meta: ChannelMeta,
    pub samples: Vec<f64>,
    pub diagnostics: ChannelDiagnostics,
}

/// What to do with failed channels when building the output table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailurePolicy {
    Abort,
    Skip,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Abort
    }
}

#[derive(Clone, Debug)]
pub struct RunOutput {
    pub target_period_ms: u32,
    pub sample_rate_hz: f64,
    pub params_hash: String,
    pub channels: Vec<Result<NormalizedChannel, ChannelError>>,
}

impl RunOutput {
    pub fn successes(&self) -> impl Iterator<Item = &NormalizedChannel> {
        self.channels.iter().filter_map(|c| c.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChannelError> {
        self.channels.iter().filter_map(|c| c.as_ref().err())
    }

    pub fn channel(&self, id: &str) -> Option<&Result<NormalizedChannel, ChannelError>> {
        self.channels.iter().find(|c| match c {
            Ok(ok) => ok.meta.id == id,
            Err(err) => err.channel == id,
        })
    }

    pub fn into_table(self, policy: FailurePolicy) -> Result<AlignedTable, SaError> {
        let mut kept = Vec::with_capacity(self.channels.len());
        for outcome in self.channels {
            match outcome {
                Ok(channel) => kept.push(channel),
                Err(err) => match policy {
                    FailurePolicy::Abort => return Err(SaError::ChannelFailed(Box::new(err))),
                    FailurePolicy::Skip => {
                        warn!("Skipping channel {}: {}", err.channel, err.kind);
                    }
                },
            }
        }
        AlignedTable::from_channels(kept, self.target_period_ms)
    }
}

/// Samples in rows, channels in columns, all on one sampling period.
#[derive(Clone, Debug)]
pub struct AlignedTable {
    pub columns: Vec<ChannelMeta>,
    pub data: Array2<f64>,
    pub target_period_ms: u32,
    pub sample_rate_hz: f64,
    /// Trailing samples dropped per channel to reach a common length.
    pub truncated: Vec<(String, usize)>,
}

impl AlignedTable {
    pub fn from_channels(
        channels: Vec<NormalizedChannel>,
        target_period_ms: u32,
    ) -> Result<Self, SaError> {
        if channels.is_empty() {
            return Err(SaError::NoChannels);
        }
        let rows = channels.iter().map(|c| c.samples.len()).min().unwrap_or(0);
        let cols = channels.len();

        let mut data = Array2::<f64>::zeros((rows, cols));
        let mut columns = Vec::with_capacity(cols);
        let mut truncated = Vec::new();
        for (col, channel) in channels.into_iter().enumerate() {
            let extra = channel.samples.len() - rows;
            if extra > 0 {
                warn!(
                    "Channel {} truncated by {} samples to align at {} rows",
                    channel.meta.id, extra, rows
                );
                truncated.push((channel.meta.id.clone(), extra));
            }
            for (row, value) in channel.samples.into_iter().take(rows).enumerate() {
                data[[row, col]] = value;
            }
            columns.push(channel.meta);
        }

        Ok(Self {
            columns,
            data,
            target_period_ms,
            sample_rate_hz: sample_rate_hz(target_period_ms),
            truncated,
        })
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn column(&self, id: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|m| m.id == id)?;
        Some(self.data.column(idx).to_vec())
    }
}

/// Tokenize, repair and normalize every raw column of a run.
pub fn process_run(inputs: Vec<RawChannel>, params: &Params) -> Result<RunOutput, SaError> {
    params.validate()?;
    let periods: Vec<u32> = inputs.iter().map(|r| r.meta.period_ms).collect();
    let target = select_target_period(&periods, params);

    let channels = inputs
        .into_par_iter()
        .map(|raw| {
            let id = raw.meta.id.clone();
            Channel::from_tokens(raw.meta, &raw.tokens, params)
                .and_then(|channel| normalize_channel(&channel, target, params))
                .map_err(|kind| ChannelError { channel: id, kind })
        })
        .collect::<Vec<_>>();

    finish_run(channels, target, params)
}

/// Repair and normalize channels whose cells are already classified.
pub fn process_channels(channels: Vec<Channel>, params: &Params) -> Result<RunOutput, SaError> {
    params.validate()?;
    let periods: Vec<u32> = channels.iter().map(|c| c.meta.period_ms).collect();
    let target = select_target_period(&periods, params);

    let outcomes = channels
        .par_iter()
        .map(|channel| {
            normalize_channel(channel, target, params).map_err(|kind| ChannelError {
                channel: channel.meta.id.clone(),
                kind,
            })
        })
        .collect::<Vec<_>>();

    finish_run(outcomes, target, params)
}

fn normalize_channel(
    channel: &Channel,
    target_ms: u32,
    params: &Params,
) -> Result<NormalizedChannel, SaError> {
    let regime = RateRegime::between(channel.meta.period_ms, target_ms)?;
    let (repaired, gaps) = repair_with_stats(&channel.cells, params.gap_policy);
    let samples = regime.apply(&repaired);
    debug!(
        "Channel {}: {:?}, {} gaps filled, {} -> {} samples",
        channel.meta.id,
        regime,
        gaps.gaps_filled,
        repaired.len(),
        samples.len()
    );
    Ok(NormalizedChannel {
        meta: channel.meta.clone(),
        diagnostics: ChannelDiagnostics {
            input_len: repaired.len(),
            output_len: samples.len(),
            gaps,
            regime,
        },
        samples,
    })
}

fn finish_run(
    channels: Vec<Result<NormalizedChannel, ChannelError>>,
    target_ms: u32,
    params: &Params,
) -> Result<RunOutput, SaError> {
    for err in channels.iter().filter_map(|c| c.as_ref().err()) {
        warn!("Channel {} failed: {}", err.channel, err.kind);
    }
    let output = RunOutput {
        target_period_ms: target_ms,
        sample_rate_hz: sample_rate_hz(target_ms),
        params_hash: params.hash_sha256()?,
        channels,
    };
    info!(
        "Normalized {} channel(s) to {} ms ({:.1} Hz), {} failed",
        output.successes().count(),
        output.target_period_ms,
        output.sample_rate_hz,
        output.failures().count()
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cell, GapPolicy, TargetPolicy};

    fn raw(id: &str, period_ms: u32, tokens: &[&str]) -> RawChannel {
        RawChannel::new(
            ChannelMeta::new(id, id, "mV", period_ms),
            tokens.iter().copied(),
        )
    }

    #[test]
    fn malformed_channel_does_not_affect_others() {
        let inputs = vec![
            raw("ID1", 8, &["1", "x", "3"]),
            raw("ID2", 8, &["2", " ", "6"]),
        ];
        let output = process_run(inputs, &Params::default()).unwrap();
        assert_eq!(output.failures().count(), 1);
        let bad = output.failures().next().unwrap();
        assert_eq!(bad.channel, "ID1");
        assert!(matches!(bad.kind, SaError::MalformedCell { row: 1, .. }));

        let good = output.successes().next().unwrap();
        assert_eq!(good.meta.id, "ID2");
        assert_eq!(good.samples, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn channel_order_is_preserved() {
        let inputs: Vec<RawChannel> = (0..16)
            .map(|i| raw(&format!("ID{}", i), 8, &["1", "2"]))
            .collect();
        let output = process_run(inputs, &Params::default()).unwrap();
        let ids: Vec<String> = output.successes().map(|c| c.meta.id.clone()).collect();
        let expected: Vec<String> = (0..16).map(|i| format!("ID{}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn adaptive_run_upsamples_slow_channels_to_finest_period() {
        let inputs = vec![
            raw("fast", 4, &["0", "1", "2", "3", "4"]),
            raw("slow", 8, &["0", "", "4"]),
        ];
        let output = process_run(inputs, &Params::default()).unwrap();
        assert_eq!(output.target_period_ms, 4);
        assert!((output.sample_rate_hz - 250.0).abs() < 1e-12);

        let slow = output.channel("slow").unwrap().as_ref().unwrap();
        assert_eq!(slow.diagnostics.regime, RateRegime::Upsample { factor: 2 });
        assert_eq!(slow.samples, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(slow.diagnostics.gaps.gaps_filled, 1);
    }

    #[test]
    fn fixed_run_decimates_fast_channels() {
        let params = Params {
            target_policy: TargetPolicy::Fixed,
            ..Params::default()
        };
        let tokens: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let inputs = vec![RawChannel::new(ChannelMeta::new("fast", "ECG", "mV", 2), tokens)];
        let output = process_run(inputs, &params).unwrap();
        assert_eq!(output.target_period_ms, 8);
        let fast = output.channel("fast").unwrap().as_ref().unwrap();
        assert_eq!(fast.samples, vec![3.0, 7.0]);
        assert_eq!(fast.diagnostics.input_len, 8);
        assert_eq!(fast.diagnostics.output_len, 2);
    }

    #[test]
    fn unsupported_ratio_is_local_to_channel() {
        let inputs = vec![raw("a", 4, &["1", "2"]), raw("b", 6, &["1", "2"])];
        let output = process_run(inputs, &Params::default()).unwrap();
        assert_eq!(output.target_period_ms, 4);
        let err = output.channel("b").unwrap().as_ref().unwrap_err();
        assert_eq!(
            err.kind,
            SaError::UnsupportedRateRatio {
                native_ms: 6,
                target_ms: 4
            }
        );
        assert!(output.channel("a").unwrap().is_ok());
    }

    #[test]
    fn zero_period_channel_fails_alone() {
        let inputs = vec![raw("zero", 0, &["1"]), raw("ok", 8, &["1"])];
        let output = process_run(inputs, &Params::default()).unwrap();
        assert_eq!(output.target_period_ms, 8);
        assert_eq!(
            output.channel("zero").unwrap().as_ref().unwrap_err().kind,
            SaError::InvalidPeriod(0)
        );
        assert!(output.channel("ok").unwrap().is_ok());
    }

    #[test]
    fn invalid_params_abort_run() {
        let params = Params {
            fixed_period_ms: 0,
            ..Params::default()
        };
        let err = process_run(vec![raw("a", 8, &["1"])], &params).unwrap_err();
        assert!(matches!(err, SaError::InvalidParameter(_)));
    }

    #[test]
    fn empty_channels_are_not_errors() {
        let output = process_run(vec![raw("empty", 16, &[])], &Params::default()).unwrap();
        let empty = output.channel("empty").unwrap().as_ref().unwrap();
        assert!(empty.samples.is_empty());
    }

    #[test]
    fn process_channels_uses_gap_policy() {
        let meta = ChannelMeta::new("ID1", "ECG", "mV", 8);
        let cells = vec![
            Cell::Value(0.0),
            Cell::Missing,
            Cell::Missing,
            Cell::Value(8.0),
        ];
        let channel = Channel::new(meta, cells).unwrap();

        let ramp = process_channels(vec![channel.clone()], &Params::default()).unwrap();
        let ramp = ramp.successes().next().unwrap().samples.clone();
        assert_eq!(ramp, vec![0.0, 4.0, 6.0, 8.0]);

        let hold_params = Params {
            gap_policy: GapPolicy::Hold,
            ..Params::default()
        };
        let hold = process_channels(vec![channel], &hold_params).unwrap();
        assert_eq!(
            hold.successes().next().unwrap().samples,
            vec![0.0, 4.0, 4.0, 8.0]
        );
        assert_ne!(hold.params_hash, Params::default().hash_sha256().unwrap());
    }

    #[test]
    fn table_truncates_to_shortest_column() {
        let inputs = vec![
            raw("a", 8, &["1", "2", "3", "4"]),
            raw("b", 8, &["5", "6", "7"]),
        ];
        let table = process_run(inputs, &Params::default())
            .unwrap()
            .into_table(FailurePolicy::Abort)
            .unwrap();
        assert_eq!(table.rows(), 3);
        assert_eq!(table.data.ncols(), 2);
        assert_eq!(table.column("a").unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(table.column("b").unwrap(), vec![5.0, 6.0, 7.0]);
        assert_eq!(table.truncated, vec![("a".to_string(), 1)]);
        assert!((table.sample_rate_hz - 125.0).abs() < 1e-12);
    }

    #[test]
    fn table_failure_policies() {
        let make = || {
            process_run(
                vec![raw("bad", 8, &["?"]), raw("good", 8, &["1", "2"])],
                &Params::default(),
            )
            .unwrap()
        };

        let err = make().into_table(FailurePolicy::Abort).unwrap_err();
        match err {
            SaError::ChannelFailed(inner) => assert_eq!(inner.channel, "bad"),
            other => panic!("unexpected error: {:?}", other),
        }

        let table = make().into_table(FailurePolicy::Skip).unwrap();
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].id, "good");
        assert_eq!(table.column("good").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn table_requires_a_channel() {
        let err = AlignedTable::from_channels(Vec::new(), 8).unwrap_err();
        assert_eq!(err, SaError::NoChannels);
    }
}
