//! Timeline reconstruction: pick `t0`, order artifacts, bucket them into events.

use crate::DomainError;
use covtrace_types::{Event, TestArtifact};
use std::collections::BTreeMap;

/// Ordered events plus the reference time they are measured from.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub t0: f64,
    pub events: Vec<Event>,
}

impl Timeline {
    pub fn artifact_count(&self) -> usize {
        self.events.iter().map(|e| e.artifacts.len()).sum()
    }
}

/// `t0` is the earlier of the run-start marker (if any) and the earliest artifact.
pub fn select_t0(earliest_artifact: f64, run_start_marker: Option<f64>) -> f64 {
    match run_start_marker {
        Some(marker) => marker.min(earliest_artifact),
        None => earliest_artifact,
    }
}

/// Stable sort by modification time; ties keep enumeration order.
pub fn sort_by_mtime(artifacts: &mut [TestArtifact]) {
    artifacts.sort_by(|a, b| a.mtime.total_cmp(&b.mtime));
}

/// Group time-sorted artifacts into events.
///
/// `bucket_sec == 0` yields one event per artifact at its own elapsed time.
/// Otherwise an artifact lands in the bucket keyed
/// `floor((mtime - t0) / bucket_sec) * bucket_sec`, and buckets come out in
/// ascending key order.
pub fn group_events(
    artifacts: &[TestArtifact],
    t0: f64,
    bucket_sec: f64,
) -> Result<Vec<Event>, DomainError> {
    if !bucket_sec.is_finite() || bucket_sec < 0.0 {
        return Err(DomainError::InvalidBucket(bucket_sec));
    }

    if bucket_sec == 0.0 {
        return Ok(artifacts
            .iter()
            .map(|a| Event {
                elapsed_sec: a.mtime - t0,
                artifacts: vec![a.clone()],
            })
            .collect());
    }

    let mut buckets: BTreeMap<i64, Vec<TestArtifact>> = BTreeMap::new();
    for a in artifacts {
        let idx = ((a.mtime - t0) / bucket_sec).floor() as i64;
        buckets.entry(idx).or_default().push(a.clone());
    }

    Ok(buckets
        .into_iter()
        .map(|(idx, artifacts)| Event {
            elapsed_sec: idx as f64 * bucket_sec,
            artifacts,
        })
        .collect())
}

/// Order the corpus, choose `t0` and build events.
///
/// Returns `Ok(None)` for an empty corpus: that is a valid terminal state.
pub fn build_timeline(
    mut artifacts: Vec<TestArtifact>,
    run_start_marker: Option<f64>,
    bucket_sec: f64,
) -> Result<Option<Timeline>, DomainError> {
    sort_by_mtime(&mut artifacts);
    let Some(first) = artifacts.first() else {
        return Ok(None);
    };

    let t0 = select_t0(first.mtime, run_start_marker);
    let events = group_events(&artifacts, t0, bucket_sec)?;
    Ok(Some(Timeline { t0, events }))
}
