//! Structure-aware fuzzing of the LOCF resampler.
//!
//! Any step and any set of records must either be rejected or yield a grid
//! that starts at zero.

#![no_main]

use arbitrary::Arbitrary;
use covtrace_types::{EventRecord, GridEnd};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    records: Vec<EventRecord>,
    step: f64,
    grid_end: GridEnd,
}

fuzz_target!(|input: Input| {
    if let Ok(samples) = covtrace_domain::resample(&input.records, input.step, input.grid_end) {
        if let Some(first) = samples.first() {
            assert_eq!(first.elapsed_sec, 0.0);
        }
    }
});
