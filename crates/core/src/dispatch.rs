use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::engine::{ChunkSource, ScanEngine};
use crate::error::{DispatchError, ScanError};
use crate::model::{MatchResult, RuleMatch, ScanTarget};

pub const DEFAULT_WORKERS: usize = 64;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Hash matched local files so the report carries evidence digests.
    pub record_digests: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            record_digests: true,
        }
    }
}

pub enum ScanJob {
    /// A local file and the label it is reported under.
    File { path: PathBuf, label: String },
    Chunked(Box<dyn ChunkSource>),
}

impl ScanJob {
    pub fn label(&self) -> &str {
        match self {
            ScanJob::File { label, .. } => label,
            ScanJob::Chunked(source) => source.label(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchSummary {
    pub jobs: u64,
    pub scan_errors: u64,
    pub suppressed: u64,
    pub matches: Vec<MatchResult>,
}

impl DispatchSummary {
    fn absorb(&mut self, other: DispatchSummary) {
        self.jobs += other.jobs;
        self.scan_errors += other.scan_errors;
        self.suppressed += other.suppressed;
        self.matches.extend(other.matches);
    }
}

/// Fixed pool of scan workers fed by a single producer through a bounded
/// queue. Each worker keeps its own tally and hands it back when joined.
pub struct ScanDispatcher {
    sender: Sender<ScanJob>,
    workers: Vec<JoinHandle<DispatchSummary>>,
    target: ScanTarget,
}

impl ScanDispatcher {
    pub fn start(
        engine: Arc<dyn ScanEngine>,
        target: ScanTarget,
        options: &DispatchOptions,
    ) -> Self {
        let (sender, receiver) = bounded::<ScanJob>(options.queue_capacity.max(1));
        let workers = (0..options.workers.max(1))
            .map(|_| {
                let worker = Worker {
                    engine: Arc::clone(&engine),
                    target: target.clone(),
                    record_digests: options.record_digests,
                };
                let receiver = receiver.clone();
                thread::spawn(move || worker.run(receiver))
            })
            .collect();

        Self {
            sender,
            workers,
            target,
        }
    }

    /// Enqueues a job, blocking while the queue is full.
    pub fn submit(&self, job: ScanJob) -> Result<(), DispatchError> {
        self.sender.send(job).map_err(|_| DispatchError::Closed)
    }

    /// Closes the queue and waits until every enqueued job has been scanned.
    pub fn drain(self) -> DispatchSummary {
        let ScanDispatcher {
            sender,
            workers,
            target,
        } = self;
        drop(sender);

        let mut summary = DispatchSummary::default();
        for handle in workers {
            match handle.join() {
                Ok(tally) => summary.absorb(tally),
                Err(_) => {
                    error!("scan worker for {} panicked", target);
                    summary.scan_errors += 1;
                }
            }
        }
        debug!(
            "dispatcher for {} drained: {} job(s), {} match(es)",
            target,
            summary.jobs,
            summary.matches.len()
        );
        summary
    }
}

struct Worker {
    engine: Arc<dyn ScanEngine>,
    target: ScanTarget,
    record_digests: bool,
}

impl Worker {
    fn run(self, jobs: Receiver<ScanJob>) -> DispatchSummary {
        let mut tally = DispatchSummary::default();
        for job in jobs {
            tally.jobs += 1;
            let label = job.label().to_string();
            // A panicking job must not take the tally of earlier jobs with it.
            let Ok(result) = panic::catch_unwind(AssertUnwindSafe(|| self.scan(job))) else {
                error!("scan of {:?} in {} panicked", label, self.target);
                tally.scan_errors += 1;
                continue;
            };
            match result {
                Ok((label, digest_path, matches)) => {
                    let digest = match (&digest_path, matches.is_empty()) {
                        (Some(path), false) if self.record_digests => digest_file(path),
                        _ => None,
                    };
                    for found in matches {
                        warn!(
                            scan_target = %self.target,
                            path = %label,
                            rule = %found.rule,
                            namespace = %found.namespace,
                            "file in {} at path {:?} violated rule {:?} from {:?}",
                            self.target,
                            label,
                            found.rule,
                            found.namespace
                        );
                        tally.matches.push(MatchResult {
                            rule_name: found.rule,
                            rule_namespace: found.namespace,
                            target: self.target.clone(),
                            subject_label: label.clone(),
                            digest: digest.clone(),
                        });
                    }
                }
                Err((_, err)) if err.is_benign() => tally.suppressed += 1,
                Err((label, err)) => {
                    warn!(
                        "could not scan file in {} at path {:?}: {}",
                        self.target, label, err
                    );
                    tally.scan_errors += 1;
                }
            }
        }
        tally
    }

    /// One engine call per job.
    #[allow(clippy::type_complexity)]
    fn scan(
        &self,
        job: ScanJob,
    ) -> Result<(String, Option<PathBuf>, Vec<RuleMatch>), (String, ScanError)> {
        match job {
            ScanJob::File { path, label } => match self.engine.scan_file(&path) {
                Ok(matches) => Ok((label, Some(path), matches)),
                Err(err) => Err((label, err)),
            },
            ScanJob::Chunked(mut source) => {
                let label = source.label().to_string();
                let result = self.engine.scan_chunks(source.as_mut());
                if let Some(fetch_err) = source.take_error() {
                    return Err((label, fetch_err.into()));
                }
                match result {
                    Ok(matches) => Ok((label, None, matches)),
                    Err(err) => Err((label, err)),
                }
            }
        }
    }
}

fn digest_file(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file).ok()?;
    Some(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{DispatchOptions, ScanDispatcher, ScanJob};
    use crate::engine::{ChunkSource, ScanEngine};
    use crate::error::{FetchError, ScanError, ScanErrorKind};
    use crate::model::{ChunkRequest, RuleMatch, ScanTarget};

    /// Scripted engine keyed by file name.
    #[derive(Default)]
    struct ScriptedEngine {
        results: HashMap<String, Result<Vec<RuleMatch>, ScanErrorKind>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<PathBuf>>,
        delay: Duration,
        panic_on: Option<String>,
    }

    impl ScanEngine for ScriptedEngine {
        fn scan_file(&self, path: &Path) -> Result<Vec<RuleMatch>, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().expect("seen lock").push(path.to_path_buf());
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            let name = path.to_string_lossy().to_string();
            if self.panic_on.as_deref() == Some(name.as_str()) {
                panic!("engine blew up on {name}");
            }
            match self.results.get(&name) {
                Some(Ok(matches)) => Ok(matches.clone()),
                Some(Err(kind)) => Err(ScanError::new(*kind, "scripted failure")),
                None => Ok(Vec::new()),
            }
        }

        fn scan_chunks(&self, source: &mut dyn ChunkSource) -> Result<Vec<RuleMatch>, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut next = source.first();
            while let Some(chunk) = next {
                let mut buf = vec![0_u8; chunk.length as usize];
                source.fetch(chunk, &mut buf);
                next = source.next();
            }
            Ok(vec![RuleMatch::new("Remote", "ns")])
        }

        fn rule_count(&self) -> usize {
            1
        }

        fn rule_names(&self) -> Vec<String> {
            vec!["ns:Remote".to_string()]
        }
    }

    struct FailingSource;

    impl ChunkSource for FailingSource {
        fn first(&mut self) -> Option<ChunkRequest> {
            Some(ChunkRequest { base: 0, length: 4 })
        }

        fn next(&mut self) -> Option<ChunkRequest> {
            None
        }

        fn fetch(&mut self, _chunk: ChunkRequest, _buf: &mut [u8]) {}

        fn failed(&self) -> bool {
            true
        }

        fn take_error(&mut self) -> Option<FetchError> {
            Some(FetchError::ShortRead {
                expected: 4,
                received: 0,
            })
        }

        fn label(&self) -> &str {
            "broken-object"
        }
    }

    fn file_job(name: &str) -> ScanJob {
        ScanJob::File {
            path: PathBuf::from(name),
            label: format!("/{name}"),
        }
    }

    fn options(workers: usize, queue_capacity: usize) -> DispatchOptions {
        DispatchOptions {
            workers,
            queue_capacity,
            record_digests: false,
        }
    }

    #[test]
    fn every_job_is_scanned_exactly_once() {
        let engine = Arc::new(ScriptedEngine {
            delay: Duration::from_millis(1),
            ..ScriptedEngine::default()
        });
        let dispatcher = ScanDispatcher::start(
            engine.clone(),
            ScanTarget::Volume("vol-1".to_string()),
            &options(8, 2),
        );
        for index in 0..200 {
            dispatcher
                .submit(file_job(&format!("file-{index}")))
                .expect("submit");
        }
        let summary = dispatcher.drain();

        assert_eq!(summary.jobs, 200);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 200);
        let mut seen = engine.seen.lock().expect("seen lock").clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn one_match_record_per_rule_and_none_for_clean_jobs() {
        let mut results = HashMap::new();
        results.insert(
            "bad".to_string(),
            Ok(vec![RuleMatch::new("EICAR", "test"), RuleMatch::new("Other", "test")]),
        );
        let engine = Arc::new(ScriptedEngine {
            results,
            ..ScriptedEngine::default()
        });
        let dispatcher = ScanDispatcher::start(
            engine,
            ScanTarget::Volume("vol-1".to_string()),
            &options(4, 16),
        );
        for name in ["clean-a", "bad", "clean-b"] {
            dispatcher.submit(file_job(name)).expect("submit");
        }
        let summary = dispatcher.drain();

        assert_eq!(summary.matches.len(), 2);
        assert!(summary
            .matches
            .iter()
            .all(|found| found.subject_label == "/bad"));
        assert_eq!(summary.scan_errors, 0);
    }

    #[test]
    fn benign_errors_are_suppressed_and_real_ones_counted() {
        let mut results = HashMap::new();
        results.insert("gone".to_string(), Err(ScanErrorKind::Vanished));
        results.insert("fifo".to_string(), Err(ScanErrorKind::Unmappable));
        results.insert("eio".to_string(), Err(ScanErrorKind::Io));
        let engine = Arc::new(ScriptedEngine {
            results,
            ..ScriptedEngine::default()
        });
        let dispatcher = ScanDispatcher::start(
            engine,
            ScanTarget::Volume("vol-1".to_string()),
            &options(2, 4),
        );
        for name in ["gone", "fifo", "eio", "fine"] {
            dispatcher.submit(file_job(name)).expect("submit");
        }
        let summary = dispatcher.drain();

        assert_eq!(summary.jobs, 4);
        assert_eq!(summary.suppressed, 2);
        assert_eq!(summary.scan_errors, 1);
        assert!(summary.matches.is_empty());
    }

    #[test]
    fn panicking_job_keeps_the_worker_tally() {
        let mut results = HashMap::new();
        results.insert("bad-a".to_string(), Ok(vec![RuleMatch::new("EICAR", "test")]));
        results.insert("bad-b".to_string(), Ok(vec![RuleMatch::new("EICAR", "test")]));
        let engine = Arc::new(ScriptedEngine {
            results,
            panic_on: Some("boom".to_string()),
            ..ScriptedEngine::default()
        });
        let dispatcher = ScanDispatcher::start(
            engine,
            ScanTarget::Volume("vol-1".to_string()),
            &options(1, 4),
        );
        for name in ["bad-a", "boom", "bad-b"] {
            dispatcher.submit(file_job(name)).expect("submit");
        }
        let summary = dispatcher.drain();

        assert_eq!(summary.jobs, 3);
        assert_eq!(summary.scan_errors, 1);
        assert_eq!(summary.matches.len(), 2);
    }

    #[test]
    fn fetch_errors_discard_matches_for_that_object() {
        let engine = Arc::new(ScriptedEngine::default());
        let dispatcher = ScanDispatcher::start(
            engine,
            ScanTarget::Bucket("b".to_string()),
            &options(1, 1),
        );
        dispatcher
            .submit(ScanJob::Chunked(Box::new(FailingSource)))
            .expect("submit");
        let summary = dispatcher.drain();

        assert_eq!(summary.scan_errors, 1);
        assert!(summary.matches.is_empty());
    }

    #[test]
    fn digests_are_recorded_for_matched_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad");
        std::fs::write(&path, b"payload").expect("write");
        let mut results = HashMap::new();
        results.insert(
            path.to_string_lossy().to_string(),
            Ok(vec![RuleMatch::new("EICAR", "test")]),
        );
        let engine = Arc::new(ScriptedEngine {
            results,
            ..ScriptedEngine::default()
        });
        let dispatcher = ScanDispatcher::start(
            engine,
            ScanTarget::Volume("vol-1".to_string()),
            &DispatchOptions {
                workers: 1,
                queue_capacity: 1,
                record_digests: true,
            },
        );
        dispatcher
            .submit(ScanJob::File {
                path,
                label: "/bad".to_string(),
            })
            .expect("submit");
        let summary = dispatcher.drain();

        let expected = blake3::hash(b"payload").to_hex().to_string();
        assert_eq!(summary.matches[0].digest.as_deref(), Some(expected.as_str()));
    }
}
