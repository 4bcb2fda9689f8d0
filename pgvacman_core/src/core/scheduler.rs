use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use log::debug;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::{
    core::{
        applier::{ApplyOutcome, LockWait, apply},
        report::Reporter,
        rules::TableMatch,
        session::traits::{CatalogSession, SessionProvider},
        stats::StatsAggregator,
    },
    error::VacmanError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub jobs: usize,
    pub dry_run: bool,
    /// `None` waits indefinitely in the second phase.
    pub lock_timeout: Option<Duration>,
    pub skip_locked: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            dry_run: false,
            lock_timeout: None,
            skip_locked: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// Some tables were left unmodified because their lock could not be taken.
    LocksUnavailable,
}

/// The nowait pass hands contended tables to the retry collector; the
/// waiting pass carries the lock timeout.
#[derive(Debug, Clone)]
enum Phase {
    Nowait(mpsc::UnboundedSender<TableMatch>),
    Wait(Option<Duration>),
}

impl Phase {
    fn lock_wait(&self) -> LockWait {
        match self {
            Phase::Nowait(_) => LockWait::Nowait,
            Phase::Wait(timeout) => LockWait::Wait(*timeout),
        }
    }
}

type Queue = Arc<Mutex<mpsc::Receiver<TableMatch>>>;

struct WorkerContext {
    stats: Arc<StatsAggregator>,
    reporter: Arc<Reporter>,
    halt: AtomicBool,
    dry_run: bool,
    skip_locked: bool,
}

/// Runs table matches over a pool of sessions: a nowait pass over everything,
/// then a waiting pass over whatever could not be locked.
pub struct Scheduler {
    options: SchedulerOptions,
    stats: Arc<StatsAggregator>,
    reporter: Arc<Reporter>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, stats: Arc<StatsAggregator>, reporter: Arc<Reporter>) -> Self {
        Self {
            options,
            stats,
            reporter,
        }
    }

    /// `first` is the session the catalog was read on; it becomes the first
    /// worker. Further sessions are opened up to `min(jobs, tables)`.
    pub async fn run<P: SessionProvider>(
        &self,
        provider: &P,
        first: P::Session,
        tables: Vec<TableMatch>,
    ) -> Result<RunStatus, VacmanError> {
        if tables.is_empty() {
            return Ok(RunStatus::Complete);
        }

        let workers = self.options.jobs.max(1).min(tables.len());
        let mut sessions = Vec::with_capacity(workers);
        sessions.push(first);
        while sessions.len() < workers {
            sessions.push(provider.connect().await?);
        }
        debug!("Opened {} worker sessions for {} tables", sessions.len(), tables.len());

        let context = Arc::new(WorkerContext {
            stats: self.stats.clone(),
            reporter: self.reporter.clone(),
            halt: AtomicBool::new(false),
            dry_run: self.options.dry_run,
            skip_locked: self.options.skip_locked,
        });

        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let mut sessions = run_phase(Phase::Nowait(retry_tx), sessions, tables, &context).await?;

        let mut retries = Vec::new();
        while let Some(table) = retry_rx.recv().await {
            retries.push(table);
        }

        if retries.is_empty() {
            return Ok(self.status());
        }

        sessions.truncate(retries.len());
        debug!(
            "Retrying {} tables with lock waits on {} sessions",
            retries.len(),
            sessions.len()
        );

        run_phase(Phase::Wait(self.options.lock_timeout), sessions, retries, &context).await?;

        Ok(self.status())
    }

    fn status(&self) -> RunStatus {
        if self.stats.snapshot().tables_unlocked() > 0 {
            RunStatus::LocksUnavailable
        } else {
            RunStatus::Complete
        }
    }
}

/// Feeds `tables` to one worker per session and returns the sessions once the
/// queue is drained. The first fatal error wins; the others are logged.
async fn run_phase<S: CatalogSession>(
    phase: Phase,
    sessions: Vec<S>,
    tables: Vec<TableMatch>,
    context: &Arc<WorkerContext>,
) -> Result<Vec<S>, VacmanError> {
    let (tx, rx) = mpsc::channel(tables.len().max(1));
    let queue: Queue = Arc::new(Mutex::new(rx));

    let handles: Vec<JoinHandle<Result<S, VacmanError>>> = sessions
        .into_iter()
        .map(|session| {
            tokio::spawn(worker(phase.clone(), session, queue.clone(), context.clone()))
        })
        .collect();
    drop(queue);
    drop(phase);

    for table in tables {
        if tx.send(table).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut sessions = Vec::with_capacity(handles.len());
    let mut failure = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(session)) => sessions.push(session),
            Ok(Err(e)) => record_failure(&mut failure, e),
            Err(e) => record_failure(&mut failure, VacmanError::Worker(e.to_string())),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(sessions),
    }
}

fn record_failure(failure: &mut Option<VacmanError>, error: VacmanError) {
    match failure {
        None => *failure = Some(error),
        Some(_) => debug!("Additional worker failure: {}", error),
    }
}

async fn worker<S: CatalogSession>(
    phase: Phase,
    mut session: S,
    queue: Queue,
    context: Arc<WorkerContext>,
) -> Result<S, VacmanError> {
    let wait = phase.lock_wait();
    loop {
        if context.halt.load(Ordering::Acquire) {
            break;
        }

        let next = queue.lock().await.recv().await;
        let Some(table) = next else {
            break;
        };

        let relation = table.quoted_name();
        let outcome = match apply(&mut session, &table, wait, context.dry_run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                context.halt.store(true, Ordering::Release);
                return Err(e);
            }
        };

        match (outcome, &phase) {
            (ApplyOutcome::Applied(outcome), _) => {
                context.stats.record_applied(&outcome);
                context.reporter.table(&outcome);
            }
            (ApplyOutcome::LockUnavailable, Phase::Nowait(_)) if context.skip_locked => {
                context.stats.record_skipped();
                context.reporter.skipped(&relation);
            }
            (ApplyOutcome::LockUnavailable | ApplyOutcome::LockTimedOut, Phase::Nowait(retry)) => {
                context.reporter.deferred(&relation);
                if retry.send(table).is_err() {
                    context.halt.store(true, Ordering::Release);
                    return Err(VacmanError::Worker(format!("retry queue closed before {}", relation)));
                }
            }
            (ApplyOutcome::LockUnavailable | ApplyOutcome::LockTimedOut, Phase::Wait(_)) => {
                context.stats.record_locked();
                context.reporter.timed_out(&relation);
            }
        }
    }

    Ok(session)
}
