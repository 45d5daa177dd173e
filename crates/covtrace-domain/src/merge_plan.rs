//! Bounded merge planning.
//!
//! A merge over more inputs than the chunk size is split into two levels:
//! chunks merge into partials, partials merge into the output.

use crate::DomainError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePlan<'a, T> {
    /// One invocation over every input.
    Flat(&'a [T]),

    /// One invocation per chunk, then one over all partials.
    TwoLevel(Vec<&'a [T]>),
}

impl<T> MergePlan<'_, T> {
    /// Number of merge-tool invocations the plan needs.
    pub fn invocations(&self) -> usize {
        match self {
            MergePlan::Flat(_) => 1,
            MergePlan::TwoLevel(chunks) => chunks.len() + 1,
        }
    }
}

pub fn plan_merge<T>(inputs: &[T], chunk_size: usize) -> Result<MergePlan<'_, T>, DomainError> {
    if chunk_size == 0 {
        return Err(DomainError::InvalidChunkSize);
    }
    if inputs.is_empty() {
        return Err(DomainError::EmptyMergeInputs);
    }

    if inputs.len() <= chunk_size {
        Ok(MergePlan::Flat(inputs))
    } else {
        Ok(MergePlan::TwoLevel(inputs.chunks(chunk_size).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Profiles modelled as sets of covered region ids; merge is union.
    fn merge_sets(inputs: &[&BTreeSet<u32>]) -> BTreeSet<u32> {
        inputs.iter().flat_map(|s| s.iter().copied()).collect()
    }

    fn execute(plan: &MergePlan<'_, BTreeSet<u32>>) -> BTreeSet<u32> {
        match plan {
            MergePlan::Flat(inputs) => merge_sets(&inputs.iter().collect::<Vec<_>>()),
            MergePlan::TwoLevel(chunks) => {
                let partials: Vec<BTreeSet<u32>> = chunks
                    .iter()
                    .map(|c| merge_sets(&c.iter().collect::<Vec<_>>()))
                    .collect();
                merge_sets(&partials.iter().collect::<Vec<_>>())
            }
        }
    }

    fn profiles(n: usize) -> Vec<BTreeSet<u32>> {
        (0..n as u32)
            .map(|i| [i, i * 7 % 11, 100 + i % 3].into_iter().collect())
            .collect()
    }

    #[test]
    fn empty_inputs_are_an_error() {
        let empty: Vec<BTreeSet<u32>> = vec![];
        assert!(matches!(
            plan_merge(&empty, 4),
            Err(DomainError::EmptyMergeInputs)
        ));
    }

    #[test]
    fn zero_chunk_size_is_an_error() {
        assert!(matches!(
            plan_merge(&[1, 2], 0),
            Err(DomainError::InvalidChunkSize)
        ));
    }

    #[test]
    fn chunked_merge_matches_flat_merge() {
        let k = 4;
        for n in [1, k, k + 1, 3 * k] {
            let inputs = profiles(n);
            let flat = execute(&MergePlan::Flat(&inputs));
            let plan = plan_merge(&inputs, k).unwrap();
            assert_eq!(execute(&plan), flat, "n={n}");
        }
    }

    #[test]
    fn plan_shape_depends_on_chunk_size() {
        let inputs: Vec<u32> = (0..12).collect();
        assert_eq!(plan_merge(&inputs, 12).unwrap(), MergePlan::Flat(&inputs[..]));

        let plan = plan_merge(&inputs, 5).unwrap();
        match &plan {
            MergePlan::TwoLevel(chunks) => {
                let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
                assert_eq!(sizes, vec![5, 5, 2]);
            }
            other => panic!("expected two-level plan, got {other:?}"),
        }
        assert_eq!(plan.invocations(), 4);
    }
}
