//! Last-observation-carried-forward resampling onto a fixed grid.

use crate::DomainError;
use covtrace_types::{CoverageTotals, EventRecord, GridEnd};

/// Upper bound on grid points, so a tiny step cannot exhaust memory.
pub const MAX_GRID_POINTS: usize = 10_000_000;

/// Tolerance when comparing elapsed times against grid points.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ResampledSample {
    pub elapsed_sec: f64,
    pub totals: CoverageTotals,
}

/// Resample event records onto `0, step, 2*step, ...`.
///
/// * Grid time 0 always takes the first record in insertion order among the
///   earliest (the baseline), even when several records share elapsed 0.
/// * A grid time `T > 0` takes the latest record with `elapsed_sec <= T`.
///   Values are carried forward, never interpolated or looked ahead.
/// * With [`GridEnd::LastSample`] the grid stops at `floor(max / step) * step`
///   and one extra sample sits at the true last elapsed time when it is off-grid.
pub fn resample(
    records: &[EventRecord],
    step: f64,
    grid_end: GridEnd,
) -> Result<Vec<ResampledSample>, DomainError> {
    if !step.is_finite() || step <= 0.0 {
        return Err(DomainError::InvalidStep(step));
    }
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&EventRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.elapsed_sec.total_cmp(&b.elapsed_sec));

    let max_t = sorted
        .iter()
        .map(|r| r.elapsed_sec)
        .fold(f64::NEG_INFINITY, f64::max)
        .max(0.0);

    let steps = match grid_end {
        GridEnd::Ceil => (max_t / step).ceil(),
        GridEnd::LastSample => (max_t / step).floor(),
    };
    if steps + 1.0 > MAX_GRID_POINTS as f64 {
        return Err(DomainError::GridTooLarge {
            points: steps + 1.0,
            limit: MAX_GRID_POINTS,
        });
    }
    let steps = steps as usize;

    let mut out = Vec::with_capacity(steps + 2);
    let mut cursor = 0usize;

    for i in 0..=steps {
        let t = i as f64 * step;
        if i > 0 {
            cursor = advance(&sorted, cursor, t);
        }
        out.push(ResampledSample {
            elapsed_sec: t,
            totals: sorted[cursor].totals,
        });
    }

    let last_grid = steps as f64 * step;
    if grid_end == GridEnd::LastSample && max_t > last_grid + EPS {
        cursor = advance(&sorted, cursor, max_t);
        out.push(ResampledSample {
            elapsed_sec: max_t,
            totals: sorted[cursor].totals,
        });
    }

    Ok(out)
}

fn advance(sorted: &[&EventRecord], mut cursor: usize, t: f64) -> usize {
    while cursor + 1 < sorted.len() && sorted[cursor + 1].elapsed_sec <= t + EPS {
        cursor += 1;
    }
    cursor
}
