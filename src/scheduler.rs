//! Scheduler (4.H): runs a leveled execution plan across a bounded worker
//! pool, consulting the file and command caches for incremental skips,
//! deduplicating identical command keys, and honoring `skip_errors`
//! cancellation. Grounded on the teacher's `execute_builds` (builder/
//! orchestrator.rs): a shared-state tracker of completed/failed commands
//! polled by workers, here generalized from manual `thread::spawn` + a
//! polling `mpsc` loop to a `rayon` thread pool driving one level at a time,
//! which gives per-level parallelism without hand-rolled bookkeeping.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::cache::file_db::{self, FileCache};
use crate::cache::CommandCache;
use crate::config::SchedulerPolicy;
use crate::error::{Error, Result};
use crate::graph::CommandGraph;
use crate::plan::TraceEvent;
use crate::target::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    CacheHit,
    Failed,
    SkippedDependencyFailed,
}

/// Per-invocation dedup/result state for one command key, shared across
/// threads that might be racing to run the identical command (5: "at-most-
/// one runs; the second awaits the first's result").
struct InFlight {
    lock: Mutex<Option<Outcome>>,
}

pub struct ExecutionReport {
    pub succeeded: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub first_error: Option<Error>,
    pub trace_events: Vec<TraceEvent>,
}

/// Tees a child process's stream to both an in-memory buffer and, if
/// `echo_to` is set, an output file — the same 8KB chunked read-and-echo
/// loop as the teacher's `spawn_tee_reader` (dockyard/mod.rs), adapted from
/// a sandbox-output pipe to a plain child-process pipe.
fn tee_reader<R: Read + Send + 'static>(mut source: R, mut echo_to: Option<std::fs::File>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut collected = Vec::new();
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if let Some(f) = echo_to.as_mut() {
                        let _ = f.write_all(&buf[..n]);
                    }
                }
                Err(_) => break,
            }
        }
        collected
    })
}

pub struct Scheduler<'a> {
    policy: SchedulerPolicy,
    file_cache: &'a FileCache,
    command_cache: &'a CommandCache,
    build_dir: std::path::PathBuf,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        policy: SchedulerPolicy,
        file_cache: &'a FileCache,
        command_cache: &'a CommandCache,
        build_dir: std::path::PathBuf,
    ) -> Self {
        Scheduler { policy, file_cache, command_cache, build_dir }
    }

    /// Runs every level of `graph` in order, respecting `self.policy.jobs`
    /// worker threads within a level.
    pub fn execute(&self, graph: &CommandGraph, levels: &[Vec<usize>]) -> Result<ExecutionReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.policy.jobs.max(1))
            .build()
            .map_err(|e| Error::BadInput(format!("failed to build worker pool: {e}")))?;

        let succeeded = AtomicUsize::new(0);
        let cache_hits = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let cancel = AtomicBool::new(false);
        let failed_indices: Mutex<std::collections::HashSet<usize>> = Mutex::new(std::collections::HashSet::new());
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let in_flight: Mutex<HashMap<u64, Arc<InFlight>>> = Mutex::new(HashMap::new());
        let trace_events: Mutex<Vec<TraceEvent>> = Mutex::new(Vec::new());
        let start_instant = Instant::now();

        for (level_idx, level) in levels.iter().enumerate() {
            pool.install(|| {
                use rayon::prelude::*;
                level.par_iter().for_each(|&idx| {
                    if cancel.load(Ordering::SeqCst) {
                        skipped.fetch_add(1, Ordering::SeqCst);
                        return;
                    }

                    let predecessor_failed = graph
                        .predecessors(idx)
                        .iter()
                        .any(|p| failed_indices.lock().unwrap().contains(p));
                    if predecessor_failed {
                        failed_indices.lock().unwrap().insert(idx);
                        skipped.fetch_add(1, Ordering::SeqCst);
                        return;
                    }

                    let command = &graph.commands[idx];
                    let key = graph.keys[idx];

                    let entry = {
                        let mut map = in_flight.lock().unwrap();
                        map.entry(key).or_insert_with(|| Arc::new(InFlight { lock: Mutex::new(None) })).clone()
                    };
                    let mut slot = entry.lock.lock().unwrap();
                    if let Some(prior) = *slot {
                        match prior {
                            Outcome::Succeeded | Outcome::CacheHit => {
                                succeeded.fetch_add(1, Ordering::SeqCst);
                            }
                            Outcome::Failed | Outcome::SkippedDependencyFailed => {
                                failed_indices.lock().unwrap().insert(idx);
                                failed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        return;
                    }

                    let outcome = self.run_one(command, level_idx, &start_instant, &trace_events);
                    *slot = Some(outcome);
                    drop(slot);

                    match outcome {
                        Outcome::CacheHit => {
                            cache_hits.fetch_add(1, Ordering::SeqCst);
                        }
                        Outcome::Succeeded => {
                            succeeded.fetch_add(1, Ordering::SeqCst);
                        }
                        Outcome::Failed => {
                            failed_indices.lock().unwrap().insert(idx);
                            let prev_failed = failed.fetch_add(1, Ordering::SeqCst) + 1;
                            {
                                let mut fe = first_error.lock().unwrap();
                                if fe.is_none() {
                                    *fe = Some(Error::CommandFailed {
                                        command: command.program.clone(),
                                        exit_code: 1,
                                    });
                                }
                            }
                            if prev_failed > self.policy.skip_errors {
                                cancel.store(true, Ordering::SeqCst);
                            }
                        }
                        Outcome::SkippedDependencyFailed => unreachable!(),
                    }
                });
            });
        }

        Ok(ExecutionReport {
            succeeded: succeeded.load(Ordering::SeqCst),
            cache_hits: cache_hits.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            skipped: skipped.load(Ordering::SeqCst),
            cancelled: cancel.load(Ordering::SeqCst),
            first_error: first_error.into_inner().unwrap(),
            trace_events: trace_events.into_inner().unwrap(),
        })
    }

    fn run_one(
        &self,
        command: &Command,
        level: usize,
        start_instant: &Instant,
        trace_events: &Mutex<Vec<TraceEvent>>,
    ) -> Outcome {
        let key = command.key();

        if !self.policy.build_always && self.is_cache_hit(command, key) {
            tracing::debug!(command = %command.program, %key, "cache hit, skipping");
            return Outcome::CacheHit;
        }
        tracing::debug!(command = %command.program, %key, "cache miss, executing");

        let started = Instant::now();
        let result = self.spawn_and_wait(command);
        let duration = started.elapsed();

        trace_events.lock().unwrap().push(TraceEvent {
            name: format!("{} {}", command.program, command.args.join(" ")),
            ts_micros: started.duration_since(*start_instant).as_micros() as u64,
            dur_micros: duration.as_micros() as u64,
            level,
            pid: std::process::id(),
            tid: level,
        });

        match result {
            Ok(true) => {
                self.refresh_fingerprints(command);
                let outputs_hash = self.hash_outputs(command);
                self.command_cache.record(key, outputs_hash);
                Outcome::Succeeded
            }
            _ => Outcome::Failed,
        }
    }

    fn is_cache_hit(&self, command: &Command, key: u64) -> bool {
        if !self.command_cache.has_record(key) {
            return false;
        }
        if !command.outputs.iter().all(|p| p.exists()) {
            return false;
        }
        command.inputs.iter().all(|input| match self.file_cache.lookup(input) {
            Some(record) => file_db::fs_last_write_nanos(input) == Some(record.last_write_nanos),
            None => false,
        })
    }

    fn spawn_and_wait(&self, command: &Command) -> Result<bool> {
        let mut builder = ProcessCommand::new(&command.program);
        builder.args(&command.args);
        if let Some(cwd) = &command.cwd {
            builder.current_dir(cwd);
        }
        for (k, v) in &command.env {
            builder.env(k, v);
        }
        builder.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = builder.spawn().map_err(|e| Error::filesystem(&command.program, e))?;

        let stdout_file = self.tee_output_file(command, "stdout");
        let stderr_file = self.tee_output_file(command, "stderr");
        let stdout_handle = child.stdout.take().map(|s| tee_reader(s, stdout_file));
        let stderr_handle = child.stderr.take().map(|s| tee_reader(s, stderr_file));

        let status = child.wait().map_err(|e| Error::filesystem(&command.program, e))?;
        if let Some(h) = stdout_handle {
            let _ = h.join();
        }
        if let Some(h) = stderr_handle {
            let _ = h.join();
        }

        Ok(status.success())
    }

    fn tee_output_file(&self, command: &Command, stream: &str) -> Option<std::fs::File> {
        if !self.policy.write_output_to_file {
            return None;
        }
        let output = command.outputs.first()?;
        let path = output.with_extension(format!("{stream}.log"));
        std::fs::File::create(path).ok()
    }

    fn refresh_fingerprints(&self, command: &Command) {
        for output in &command.outputs {
            if let Some(nanos) = file_db::fs_last_write_nanos(output) {
                self.file_cache.record_file(output, nanos, Vec::new());
            }
        }
        for input in &command.inputs {
            if let Some(nanos) = file_db::fs_last_write_nanos(input) {
                if self.file_cache.lookup(input).is_none() {
                    self.file_cache.record_file(input, nanos, Vec::new());
                }
            }
        }
    }

    fn hash_outputs(&self, command: &Command) -> u64 {
        let mut hasher = Sha256::new();
        let mut outputs: Vec<&std::path::PathBuf> = command.outputs.iter().collect();
        outputs.sort();
        for output in outputs {
            if let Some(record) = self.file_cache.lookup(output) {
                hasher.update(output.to_string_lossy().as_bytes());
                hasher.update(record.last_write_nanos.to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap())
    }

    /// The build-dir root this scheduler's cyclic dumps / time traces live
    /// under, exposed so the driver can locate `misc/time_trace.json`.
    pub fn build_dir(&self) -> &std::path::Path {
        &self.build_dir
    }
}

/// Backoff helper reused from the resolver's retry policy shape, exposed
/// here so a future cancellation-aware wait loop (5: "worker joins with a
/// bounded timeout") has a single place to source its timeout increments.
pub fn bounded_join_timeout(attempt: u32) -> Duration {
    Duration::from_millis(200).saturating_mul(attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn policy(jobs: usize, skip_errors: usize) -> SchedulerPolicy {
        SchedulerPolicy { jobs, skip_errors, build_always: false, write_output_to_file: false, time_trace: false }
    }

    fn echo_command(tag: &str, output: &std::path::Path) -> Command {
        Command {
            program: "sh".into(),
            args: vec!["-c".into(), format!("echo {tag} > {}", output.display())],
            cwd: None,
            env: Map::new(),
            inputs: vec![],
            outputs: vec![output.to_path_buf()],
            depends_on: vec![],
        }
    }

    #[test]
    fn executes_a_single_level_successfully() {
        let build_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let file_cache = FileCache::open(&build_dir.path().join("files")).unwrap();
        let command_cache = CommandCache::open(&build_dir.path().join("commands")).unwrap();

        let output = out_dir.path().join("out.txt");
        let graph = CommandGraph::build(vec![echo_command("hello", &output)]);
        let levels = graph.create_execution_plan(build_dir.path()).unwrap();

        let scheduler = Scheduler::new(policy(1, 0), &file_cache, &command_cache, build_dir.path().to_path_buf());
        let report = scheduler.execute(&graph, &levels).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
        assert!(output.exists());
    }

    #[test]
    fn second_run_is_a_cache_hit_when_nothing_changed() {
        let build_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let file_cache = FileCache::open(&build_dir.path().join("files")).unwrap();
        let command_cache = CommandCache::open(&build_dir.path().join("commands")).unwrap();

        let output = out_dir.path().join("out.txt");
        let graph = CommandGraph::build(vec![echo_command("hello", &output)]);
        let levels = graph.create_execution_plan(build_dir.path()).unwrap();

        let scheduler = Scheduler::new(policy(1, 0), &file_cache, &command_cache, build_dir.path().to_path_buf());
        scheduler.execute(&graph, &levels).unwrap();

        let graph2 = CommandGraph::build(vec![echo_command("hello", &output)]);
        let levels2 = graph2.create_execution_plan(build_dir.path()).unwrap();
        let report2 = scheduler.execute(&graph2, &levels2).unwrap();

        assert_eq!(report2.cache_hits, 1);
        assert_eq!(report2.succeeded, 0);
    }

    #[test]
    fn build_always_forces_reexecution_despite_cache() {
        let build_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let file_cache = FileCache::open(&build_dir.path().join("files")).unwrap();
        let command_cache = CommandCache::open(&build_dir.path().join("commands")).unwrap();

        let output = out_dir.path().join("out.txt");
        let graph = CommandGraph::build(vec![echo_command("hello", &output)]);
        let levels = graph.create_execution_plan(build_dir.path()).unwrap();

        let scheduler = Scheduler::new(policy(1, 0), &file_cache, &command_cache, build_dir.path().to_path_buf());
        scheduler.execute(&graph, &levels).unwrap();

        let always_policy = SchedulerPolicy { build_always: true, ..policy(1, 0) };
        let scheduler2 = Scheduler::new(always_policy, &file_cache, &command_cache, build_dir.path().to_path_buf());
        let graph2 = CommandGraph::build(vec![echo_command("hello", &output)]);
        let levels2 = graph2.create_execution_plan(build_dir.path()).unwrap();
        let report2 = scheduler2.execute(&graph2, &levels2).unwrap();

        assert_eq!(report2.succeeded, 1);
        assert_eq!(report2.cache_hits, 0);
    }

    #[test]
    fn failure_propagates_to_dependents_and_stops_within_skip_errors() {
        let build_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let file_cache = FileCache::open(&build_dir.path().join("files")).unwrap();
        let command_cache = CommandCache::open(&build_dir.path().join("commands")).unwrap();

        let failing = Command {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 1".into()],
            cwd: None,
            env: Map::new(),
            inputs: vec![],
            outputs: vec![out_dir.path().join("never.txt")],
            depends_on: vec![],
        };
        let dependent_output = out_dir.path().join("dependent.txt");
        let dependent = Command {
            program: "sh".into(),
            args: vec!["-c".into(), format!("echo x > {}", dependent_output.display())],
            cwd: None,
            env: Map::new(),
            inputs: vec![out_dir.path().join("never.txt")],
            outputs: vec![dependent_output.clone()],
            depends_on: vec![],
        };

        let graph = CommandGraph::build(vec![failing, dependent]);
        let levels = graph.create_execution_plan(build_dir.path()).unwrap();

        let scheduler = Scheduler::new(policy(1, 0), &file_cache, &command_cache, build_dir.path().to_path_buf());
        let report = scheduler.execute(&graph, &levels).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!dependent_output.exists());
    }
}
