//! Gap repair: every missing sample is replaced by the midpoint between the
//! running baseline and the next known sample.
//!
//! The baseline starts at 0.0, so a leading gap resolves toward zero on its low
//! side. A trailing gap has no next sample and continues the baseline flat.

use serde::{Deserialize, Serialize};

use crate::{Cell, GapPolicy};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GapStats {
    pub gaps_filled: usize,
    pub longest_run: usize,
    pub leading: usize,
    pub trailing: usize,
}

/// Fill every missing cell. Output length always equals input length.
pub fn repair(cells: &[Cell], policy: GapPolicy) -> Vec<f64> {
    repair_with_stats(cells, policy).0
}

pub fn repair_with_stats(cells: &[Cell], policy: GapPolicy) -> (Vec<f64>, GapStats) {
    let upcoming = next_known_values(cells);
    let mut out = Vec::with_capacity(cells.len());
    let mut stats = GapStats::default();
    let mut run = 0usize;
    let mut seen_value = false;

    let mut current = 0.0_f64;
    for (cell, next) in cells.iter().zip(upcoming) {
        match *cell {
            Cell::Value(v) => {
                out.push(v);
                current = v;
                if !seen_value {
                    stats.leading = run;
                    seen_value = true;
                }
                run = 0;
            }
            Cell::Missing => {
                let filled = (current + next.unwrap_or(current)) / 2.0;
                out.push(filled);
                if policy == GapPolicy::Ramp {
                    current = filled;
                }
                stats.gaps_filled += 1;
                run += 1;
                stats.longest_run = stats.longest_run.max(run);
            }
        }
    }
    if seen_value {
        stats.trailing = run;
    } else {
        // All-missing channel: the whole run is both leading and trailing.
        stats.leading = run;
        stats.trailing = run;
    }

    (out, stats)
}

/// For each position, the first known value strictly after it.
fn next_known_values(cells: &[Cell]) -> Vec<Option<f64>> {
    let mut next = vec![None; cells.len()];
    let mut upcoming = None;
    for (i, cell) in cells.iter().enumerate().rev() {
        next[i] = upcoming;
        if let Cell::Value(v) = cell {
            upcoming = Some(*v);
        }
    }
    next
}
