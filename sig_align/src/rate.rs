//! Rate normalization onto a shared sampling period.
//!
//! Only integral period ratios are supported. A channel faster than the
//! target is decimated by keeping every `factor`-th sample (the first kept
//! sample is at 1-based position `factor`). A slower channel is up-sampled by
//! inserting `factor - 1` points between each pair of originals, each one
//! halfway between the previously emitted point and the next original sample.
//! For `factor > 2` that is a halving approach, not evenly spaced linear
//! interpolation.

use serde::{Deserialize, Serialize};

use crate::{Params, SaError, TargetPolicy};

/// Upper bound on the up-front allocation of an up-sampled channel.
const MAX_CAPACITY_HINT: usize = 1 << 24;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RateRegime {
    PassThrough,
    Decimate { factor: usize },
    Upsample { factor: usize },
}

impl RateRegime {
    pub fn between(native_ms: u32, target_ms: u32) -> Result<Self, SaError> {
        if native_ms == 0 {
            return Err(SaError::InvalidPeriod(native_ms));
        }
        if target_ms == 0 {
            return Err(SaError::InvalidPeriod(target_ms));
        }
        let unsupported = SaError::UnsupportedRateRatio {
            native_ms,
            target_ms,
        };
        if native_ms == target_ms {
            Ok(RateRegime::PassThrough)
        } else if native_ms < target_ms {
            if target_ms % native_ms != 0 {
                return Err(unsupported);
            }
            Ok(RateRegime::Decimate {
                factor: (target_ms / native_ms) as usize,
            })
        } else {
            if native_ms % target_ms != 0 {
                return Err(unsupported);
            }
            Ok(RateRegime::Upsample {
                factor: (native_ms / target_ms) as usize,
            })
        }
    }

    pub fn apply(&self, samples: &[f64]) -> Vec<f64> {
        match *self {
            RateRegime::PassThrough => samples.to_vec(),
            RateRegime::Decimate { factor } => decimate(samples, factor),
            RateRegime::Upsample { factor } => upsample(samples, factor),
        }
    }

    /// Number of samples `apply` produces for an input of `len` samples.
    pub fn output_len(&self, len: usize) -> usize {
        match *self {
            RateRegime::PassThrough => len,
            RateRegime::Decimate { factor } => len / factor.max(1),
            RateRegime::Upsample { factor } => {
                if len == 0 {
                    0
                } else {
                    (len - 1).saturating_mul(factor.max(1)).saturating_add(1)
                }
            }
        }
    }
}

/// Re-express `samples` recorded every `native_ms` on a `target_ms` grid.
pub fn normalize(samples: &[f64], native_ms: u32, target_ms: u32) -> Result<Vec<f64>, SaError> {
    Ok(RateRegime::between(native_ms, target_ms)?.apply(samples))
}

pub fn decimate(samples: &[f64], factor: usize) -> Vec<f64> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .skip(factor - 1)
        .step_by(factor)
        .copied()
        .collect()
}

pub fn upsample(samples: &[f64], factor: usize) -> Vec<f64> {
    let Some((&first, rest)) = samples.split_first() else {
        return Vec::new();
    };
    let factor = factor.max(1);
    let hint = rest
        .len()
        .checked_mul(factor)
        .map_or(MAX_CAPACITY_HINT, |n| n.min(MAX_CAPACITY_HINT));
    let mut out = Vec::with_capacity(hint + 1);
    out.push(first);
    let mut last = first;
    for &next in rest {
        for _ in 1..factor {
            last = (last + next) / 2.0;
            out.push(last);
        }
        out.push(next);
        last = next;
    }
    out
}

/// Pick the single period every channel of a run is normalized to.
pub fn select_target_period(periods: &[u32], params: &Params) -> u32 {
    let fixed = params.fixed_period_ms;
    match params.target_policy {
        TargetPolicy::Fixed => fixed,
        TargetPolicy::Adaptive => {
            let finest = periods.iter().copied().filter(|&p| p > 0).min();
            match finest {
                Some(p) if p < fixed => p,
                _ => fixed,
            }
        }
    }
}

pub fn sample_rate_hz(target_ms: u32) -> f64 {
    if target_ms == 0 {
        return 0.0;
    }
    1000.0 / target_ms as f64
}
