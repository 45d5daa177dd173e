//! Profile merging: bounded two-level merges and the cumulative fold.

use anyhow::Context;
use covtrace_adapters::{CommandSpec, ProcessRunner};
use covtrace_domain::{plan_merge, MergePlan};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytes of merge-tool output kept for error messages.
pub const MERGE_OUTPUT_CAP: usize = 64 * 1024;

pub struct ProfileMerger<'r, R: ProcessRunner> {
    runner: &'r R,
    tool: String,
    threads: usize,
    chunk_size: usize,
}

impl<'r, R: ProcessRunner> ProfileMerger<'r, R> {
    pub fn new(runner: &'r R, tool: impl Into<String>, threads: usize, chunk_size: usize) -> Self {
        Self {
            runner,
            tool: tool.into(),
            threads: threads.max(1),
            chunk_size,
        }
    }

    /// Merge `inputs` into `out`.
    ///
    /// More inputs than the chunk size are merged chunk by chunk into
    /// `parts_dir/part_NNNN.profdata`, then the partials into `out`. Partials
    /// are removed afterwards. Any non-zero tool exit is fatal.
    pub fn merge(&self, inputs: &[PathBuf], out: &Path, parts_dir: &Path) -> anyhow::Result<()> {
        match plan_merge(inputs, self.chunk_size)? {
            MergePlan::Flat(all) => self.invoke(all, out),
            MergePlan::TwoLevel(chunks) => {
                fs::create_dir_all(parts_dir)
                    .with_context(|| format!("create dir {}", parts_dir.display()))?;

                let mut partials = Vec::with_capacity(chunks.len());
                for (i, chunk) in chunks.iter().enumerate() {
                    let part = parts_dir.join(format!("part_{i:04}.profdata"));
                    self.invoke(chunk, &part)?;
                    partials.push(part);
                }
                debug!(
                    inputs = inputs.len(),
                    partials = partials.len(),
                    "merging partial profiles"
                );
                self.invoke(&partials, out)?;

                for part in &partials {
                    if let Err(err) = fs::remove_file(part) {
                        debug!(path = %part.display(), "could not remove partial profile: {err}");
                    }
                }
                Ok(())
            }
        }
    }

    /// `new = merge([previous, bucket])`, or `merge([bucket])` for the first event.
    pub fn fold_cumulative(
        &self,
        previous: Option<&Path>,
        bucket: &Path,
        out: &Path,
        parts_dir: &Path,
    ) -> anyhow::Result<()> {
        let mut inputs = Vec::with_capacity(2);
        if let Some(prev) = previous {
            inputs.push(prev.to_path_buf());
        }
        inputs.push(bucket.to_path_buf());
        self.merge(&inputs, out, parts_dir)
    }

    fn invoke(&self, inputs: &[PathBuf], out: &Path) -> anyhow::Result<()> {
        let mut argv = Vec::with_capacity(inputs.len() + 6);
        argv.push(self.tool.clone());
        argv.push("merge".to_string());
        argv.push("-sparse".to_string());
        argv.push(format!("--num-threads={}", self.threads));
        argv.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        argv.push("-o".to_string());
        argv.push(out.to_string_lossy().into_owned());

        debug!(inputs = inputs.len(), out = %out.display(), "merge");
        let res = self
            .runner
            .run(&CommandSpec::new(argv, MERGE_OUTPUT_CAP))
            .with_context(|| format!("failed to run {} merge", self.tool))?;

        if !res.success() {
            anyhow::bail!(
                "{} merge failed (exit {}) writing {}:\n{}{}",
                self.tool,
                res.exit_code,
                out.display(),
                res.stderr_lossy(),
                res.stdout_lossy()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covtrace_fake::{exit, ok, output_arg, FakeProcessRunner};
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    /// Fake merge tool whose "profiles" are in-memory sets of region ids:
    /// inputs named `raw<N>` cover region N; merged outputs are unions.
    fn set_merger() -> (FakeProcessRunner, Arc<Mutex<std::collections::BTreeMap<String, BTreeSet<u32>>>>) {
        let store = Arc::new(Mutex::new(std::collections::BTreeMap::<String, BTreeSet<u32>>::new()));
        let s = store.clone();
        let runner = FakeProcessRunner::new(move |spec| {
            let out = output_arg(spec).unwrap().to_string();
            let inputs = &spec.argv[4..spec.argv.len() - 2];
            let mut store = s.lock().unwrap();
            let mut merged = BTreeSet::new();
            for input in inputs {
                match input.strip_prefix("raw") {
                    Some(n) => {
                        merged.insert(n.parse::<u32>().unwrap() % 7);
                    }
                    None => merged.extend(store[input].iter().copied()),
                }
            }
            store.insert(out, merged);
            Ok(ok(""))
        });
        (runner, store)
    }

    fn raws(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("raw{i}"))).collect()
    }

    #[test]
    fn merge_command_line_is_sparse_with_threads() {
        let runner = FakeProcessRunner::always_ok();
        let merger = ProfileMerger::new(&runner, "llvm-profdata", 8, 5000);
        merger
            .merge(&raws(2), Path::new("out.profdata"), Path::new("parts"))
            .unwrap();

        assert_eq!(
            runner.calls()[0].argv,
            vec![
                "llvm-profdata",
                "merge",
                "-sparse",
                "--num-threads=8",
                "raw0",
                "raw1",
                "-o",
                "out.profdata"
            ]
        );
    }

    #[test]
    fn chunked_merge_equals_flat_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let k = 3;
        for n in [1, k, k + 1, 3 * k] {
            let (runner, store) = set_merger();
            ProfileMerger::new(&runner, "llvm-profdata", 1, usize::MAX)
                .merge(&raws(n), Path::new("flat"), tmp.path())
                .unwrap();
            ProfileMerger::new(&runner, "llvm-profdata", 1, k)
                .merge(&raws(n), Path::new("chunked"), tmp.path())
                .unwrap();

            let store = store.lock().unwrap();
            assert_eq!(store["flat"], store["chunked"], "n={n}");
        }
    }

    #[test]
    fn two_level_merge_writes_numbered_partials() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeProcessRunner::always_ok();
        ProfileMerger::new(&runner, "llvm-profdata", 1, 2)
            .merge(&raws(5), Path::new("out"), tmp.path())
            .unwrap();

        let outs: Vec<String> = runner
            .calls()
            .iter()
            .map(|c| output_arg(c).unwrap().to_string())
            .collect();
        let part = |i: usize| {
            tmp.path()
                .join(format!("part_{i:04}.profdata"))
                .to_string_lossy()
                .into_owned()
        };
        assert_eq!(outs, vec![part(0), part(1), part(2), "out".to_string()]);
    }

    #[test]
    fn zero_inputs_are_an_error() {
        let runner = FakeProcessRunner::always_ok();
        let err = ProfileMerger::new(&runner, "llvm-profdata", 1, 4)
            .merge(&[], Path::new("out"), Path::new("parts"))
            .unwrap_err();
        assert!(err.to_string().contains("at least one input"), "{err}");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn tool_failure_is_fatal_and_carries_diagnostics() {
        let runner = FakeProcessRunner::new(|_| Ok(exit(1, "error: malformed profile data")));
        let err = ProfileMerger::new(&runner, "llvm-profdata", 1, 4)
            .merge(&raws(1), Path::new("out"), Path::new("parts"))
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exit 1"), "{msg}");
        assert!(msg.contains("malformed profile data"), "{msg}");
    }

    #[test]
    fn cumulative_fold_includes_previous_profile() {
        let runner = FakeProcessRunner::always_ok();
        let merger = ProfileMerger::new(&runner, "llvm-profdata", 1, 4);
        merger
            .fold_cumulative(None, Path::new("bucket_a"), Path::new("cum_a"), Path::new("p"))
            .unwrap();
        merger
            .fold_cumulative(
                Some(Path::new("cum_a")),
                Path::new("bucket_b"),
                Path::new("cum_b"),
                Path::new("p"),
            )
            .unwrap();

        let calls = runner.calls();
        assert_eq!(&calls[0].argv[4..], ["bucket_a", "-o", "cum_a"]);
        assert_eq!(&calls[1].argv[4..], ["cum_a", "bucket_b", "-o", "cum_b"]);
    }
}
