use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::client::{HttpTransport, RateLimitedClient, Transport};
use crate::config::PipelineConfig;
use crate::delay_manager::{self, DelayPolicy};
use crate::error::{FetchError, PipelineError, Result};
use crate::parser::RecordParser;
use crate::progress::ProgressReporter;
use crate::record::{Job, Record};
use crate::resume_manager::CheckpointStore;
use crate::sink::ResultSink;

/// Final disposition of one job as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Written(Record),
    /// Valid id, but the API returned no item for it.
    Empty,
    /// Every attempt failed; the job still counts as done.
    Abandoned(FetchError),
    /// Shutdown arrived between attempts. Not done: it runs again on resume.
    Interrupted,
}

struct Completion {
    position: usize,
    job: Job,
    outcome: Outcome,
}

/// Tracks which positions of the submission range are resolved and how far
/// the gap-free prefix reaches. Completions arrive in any order; only the
/// prefix is safe to checkpoint.
#[derive(Debug)]
pub struct CompletionTracker {
    first_index: usize,
    resolved: Vec<bool>,
    frontier: usize,
    count: usize,
}

impl CompletionTracker {
    /// `first_index` is the master-list index of position 0.
    pub fn new(first_index: usize, len: usize) -> Self {
        CompletionTracker {
            first_index,
            resolved: vec![false; len],
            frontier: 0,
            count: 0,
        }
    }

    /// Returns true if the contiguous prefix grew.
    pub fn resolve(&mut self, position: usize) -> bool {
        match self.resolved.get_mut(position) {
            Some(done) if !*done => *done = true,
            _ => return false,
        }
        self.count += 1;

        let before = self.frontier;
        while self.resolved.get(self.frontier).copied().unwrap_or(false) {
            self.frontier += 1;
        }
        self.frontier > before
    }

    /// Master-list index of the last job in the gap-free prefix.
    pub fn contiguous_last(&self) -> Option<usize> {
        self.frontier.checked_sub(1).map(|p| self.first_index + p)
    }

    pub fn resolved_count(&self) -> usize {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.frontier == self.resolved.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs handed to the workers this run.
    pub submitted: usize,
    pub written: usize,
    pub empty: usize,
    pub abandoned: usize,
    /// Jobs past the checkpoint whose row was already in the output.
    pub skipped: usize,
    /// Submitted jobs left without a disposition by a shutdown.
    pub pending: usize,
    pub last_index: i64,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.written + self.empty + self.abandoned
    }
}

/// Runs one job: fetch, parse, and retry the pair with exponential backoff.
/// Failures never leave this function.
fn process_job(
    client: &RateLimitedClient,
    parser: &RecordParser,
    policy: &DelayPolicy,
    shutdown: &AtomicBool,
    job: &Job,
) -> Outcome {
    let mut attempt = 1;
    loop {
        match client.fetch(job) {
            Ok(raw) => {
                return match parser.parse(&raw, job) {
                    Some(record) => Outcome::Written(record),
                    None => Outcome::Empty,
                };
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!("Giving up on game {} after {} attempts: {}", job.external_id, attempt, e);
                return Outcome::Abandoned(e);
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{} for game {} failed: {}",
                    attempt, policy.max_attempts, job.external_id, e
                );
                if shutdown.load(Ordering::SeqCst) {
                    return Outcome::Interrupted;
                }
                delay_manager::retry_backoff(policy, attempt);
                if shutdown.load(Ordering::SeqCst) {
                    return Outcome::Interrupted;
                }
                attempt += 1;
            }
        }
    }
}

/// Owns the client and parser, runs the worker pool and is the single
/// writer of the output file and the checkpoint.
pub struct Dispatcher {
    config: PipelineConfig,
    client: RateLimitedClient,
    parser: RecordParser,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(config: PipelineConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let config = config.normalized();
        let client = RateLimitedClient::new(transport, config.url_template.clone(), config.delays);
        let parser = RecordParser::new(config.schema)?;
        Ok(Dispatcher {
            config,
            client,
            parser,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Dispatcher talking to the real API.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.request_timeout, &config.user_agent)?;
        Self::new(config, Box::new(transport))
    }

    /// Call `store(true, Ordering::SeqCst)` on the returned Arc to stop the
    /// run gracefully.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Processes `jobs[checkpoint + 1..]` and returns once every submitted
    /// job has a disposition, or after a shutdown once in-flight attempts
    /// have finished. The checkpoint is flushed on the way out either way.
    pub fn run(&self, jobs: &[Job]) -> Result<RunSummary> {
        let mut checkpoint = CheckpointStore::load(&self.config.checkpoint);
        let start = checkpoint.next_index().min(jobs.len());
        let remaining = &jobs[start..];

        let (mut sink, existing) = ResultSink::open(
            &self.config.output,
            self.config.schema,
            self.config.list_encoding,
            checkpoint.is_resuming(),
        )?;

        let mut tracker = CompletionTracker::new(start, remaining.len());
        let mut queue = VecDeque::with_capacity(remaining.len());
        let mut skipped = 0;
        for (position, job) in remaining.iter().enumerate() {
            if existing.ids.contains(&job.external_id) {
                debug!("Game {} already in {:?}, skipping", job.external_id, sink.path());
                tracker.resolve(position);
                skipped += 1;
            } else {
                queue.push_back((position, job.clone()));
            }
        }
        if skipped > 0 {
            info!("{} games past the checkpoint were already written", skipped);
            save_checkpoint(&mut checkpoint, &tracker)?;
        }

        let submitted = queue.len();
        info!(
            "Processing {} games (#{} to #{}) with {} workers",
            submitted,
            start,
            jobs.len().saturating_sub(1),
            self.config.workers
        );

        let mut progress = ProgressReporter::new(submitted, self.config.progress_every);
        let mut summary = RunSummary {
            submitted,
            written: 0,
            empty: 0,
            abandoned: 0,
            skipped,
            pending: 0,
            last_index: checkpoint.last_completed(),
            interrupted: false,
            elapsed: Duration::ZERO,
        };
        let mut failure: Option<PipelineError> = None;

        let queue = Mutex::new(queue);
        let queue = &queue;
        let (tx, rx) = mpsc::channel::<Completion>();
        let workers = self.config.workers.min(submitted);

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let tx = tx.clone();
                scope.spawn(move || self.worker_loop(worker_id, queue, tx));
            }
            drop(tx);

            let mut since_flush = 0;
            for done in rx {
                match done.outcome {
                    Outcome::Written(record) => match sink.append(&record) {
                        Ok(()) => summary.written += 1,
                        Err(e) => {
                            // Leave the job unresolved so it is retried on resume.
                            error!("Failed to write game {}: {}", done.job.external_id, e);
                            failure.get_or_insert(e);
                            self.request_shutdown();
                            continue;
                        }
                    },
                    Outcome::Empty => {
                        debug!("No data available for game {}", done.job.external_id);
                        summary.empty += 1;
                    }
                    Outcome::Abandoned(_) => summary.abandoned += 1,
                    Outcome::Interrupted => continue,
                }

                tracker.resolve(done.position);
                progress.tick();
                since_flush += 1;

                if since_flush >= self.config.checkpoint_every {
                    since_flush = 0;
                    match save_checkpoint(&mut checkpoint, &tracker) {
                        Ok(true) => {
                            info!("Checkpoint saved at game #{}", checkpoint.last_completed())
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!("{}", e);
                            failure.get_or_insert(e);
                            self.request_shutdown();
                        }
                    }
                }
            }
        });

        summary.interrupted = self.is_shutdown_requested();
        summary.pending = submitted - summary.processed();
        summary.elapsed = progress.elapsed();

        let saved = save_checkpoint(&mut checkpoint, &tracker).and_then(|_| sink.flush());
        summary.last_index = checkpoint.last_completed();

        if let Some(e) = failure {
            return Err(e);
        }
        saved?;

        if summary.interrupted {
            info!(
                "Interrupted with {} games unfinished. Progress saved at game #{}; \
                 run again to resume.",
                summary.pending, summary.last_index
            );
        } else if tracker.is_complete() {
            info!("All {} games have a result. Checkpoint saved.", tracker.resolved_count());
        }
        Ok(summary)
    }

    fn worker_loop(
        &self,
        worker_id: usize,
        queue: &Mutex<VecDeque<(usize, Job)>>,
        tx: mpsc::Sender<Completion>,
    ) {
        debug!("Worker {} started", worker_id);
        while !self.is_shutdown_requested() {
            let next = match queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some((position, job)) = next else { break };

            let outcome = process_job(
                &self.client,
                &self.parser,
                &self.config.delays,
                &self.shutdown,
                &job,
            );
            if tx.send(Completion { position, job, outcome }).is_err() {
                break;
            }
        }
        debug!("Worker {} stopped", worker_id);
    }
}

/// Advances the checkpoint to the gap-free prefix and persists it.
/// Returns whether anything new was written.
fn save_checkpoint(checkpoint: &mut CheckpointStore, tracker: &CompletionTracker) -> Result<bool> {
    let Some(last) = tracker.contiguous_last() else {
        return Ok(false);
    };
    checkpoint.advance(i64::try_from(last).unwrap_or(i64::MAX));
    if !checkpoint.is_dirty() {
        return Ok(false);
    }
    checkpoint.flush()?;
    Ok(true)
}
