use std::{fmt, time::Duration};

use log::{debug, warn};
use tokio::{
    sync::oneshot,
    time::{Instant, sleep, sleep_until},
};

use crate::{
    core::{
        catalog::{RelationKind, TOAST_PREFIX},
        quoting::{alter_reset_statement, alter_set_statement},
        rules::TableMatch,
        session::traits::{CatalogSession, StatementCanceller},
    },
    error::{DbError, VacmanError},
};

pub const WAIT_WARNING_AFTER: Duration = Duration::from_secs(1);
pub const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const BEGIN: &str = "begin isolation level read committed";
const SAVEPOINT: &str = "pgvacman_parameter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    ShareUpdateExclusive,
    AccessExclusive,
}

impl LockMode {
    /// The weakest lock that covers every parameter in `parameters`.
    pub fn for_parameters<'a>(mut parameters: impl Iterator<Item = &'a str>) -> Self {
        if parameters.all(is_low_impact) {
            LockMode::ShareUpdateExclusive
        } else {
            LockMode::AccessExclusive
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            LockMode::ShareUpdateExclusive => "share update exclusive",
            LockMode::AccessExclusive => "access exclusive",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parameters that only need the lock autovacuum itself takes.
pub fn is_low_impact(parameter: &str) -> bool {
    if parameter.contains("autovacuum") {
        return true;
    }

    let name = parameter.strip_prefix(TOAST_PREFIX).unwrap_or(parameter);
    name.starts_with("vacuum_")
        || name.starts_with("toast_")
        || name == "fillfactor"
        || name == "parallel_workers"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail at once if the lock is held elsewhere.
    Nowait,
    /// Block, cancelling the wait after the timeout if one is given.
    Wait(Option<Duration>),
}

#[derive(Debug, Clone)]
pub struct ParameterOutcome {
    pub parameter: String,
    pub old: Option<String>,
    pub new: Option<String>,
    pub error: Option<DbError>,
}

impl ParameterOutcome {
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct TableOutcome {
    pub relation: String,
    pub kind: RelationKind,
    pub row_estimate: u64,
    pub lock_mode: LockMode,
    pub parameters: Vec<ParameterOutcome>,
}

impl TableOutcome {
    pub fn applied(&self) -> usize {
        self.parameters.iter().filter(|p| p.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.parameters.len() - self.applied()
    }
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(TableOutcome),
    LockUnavailable,
    LockTimedOut,
}

enum Attempt {
    Done(Result<(), DbError>),
    Unavailable,
    TimedOut,
}

/// Applies one table's deltas on `session`. Lock contention comes back as an
/// [`ApplyOutcome`] variant; `Err` is reserved for failures that end the run.
pub async fn apply<S: CatalogSession>(
    session: &mut S,
    table: &TableMatch,
    wait: LockWait,
    dry_run: bool,
) -> Result<ApplyOutcome, VacmanError> {
    let relation = table.quoted_name();
    let lock_mode = LockMode::for_parameters(table.deltas.keys().map(String::as_str));
    let mut outcome = TableOutcome {
        relation: relation.clone(),
        kind: table.kind,
        row_estimate: table.row_estimate,
        lock_mode,
        parameters: Vec::with_capacity(table.deltas.len()),
    };

    if dry_run {
        outcome.parameters = table
            .deltas
            .iter()
            .map(|(parameter, delta)| ParameterOutcome {
                parameter: parameter.clone(),
                old: delta.old.clone(),
                new: delta.new.clone(),
                error: None,
            })
            .collect();
        return Ok(ApplyOutcome::Applied(outcome));
    }

    statement(session, &relation, BEGIN).await?;

    let lock_table = table.kind.supports_lock_table();
    if lock_table {
        let lock = lock_statement(&relation, lock_mode, wait);
        match attempt(session, &relation, &lock, wait).await? {
            Attempt::Done(Ok(())) => {}
            Attempt::Done(Err(e)) => return abort(session, &relation, e).await,
            Attempt::Unavailable => return give_up(session, &relation, ApplyOutcome::LockUnavailable).await,
            Attempt::TimedOut => return give_up(session, &relation, ApplyOutcome::LockTimedOut).await,
        }
    } else {
        // Each ALTER takes the lock its parameter needs; lock_timeout stands in for NOWAIT.
        let timeout = match wait {
            LockWait::Nowait => "set local lock_timeout = 1",
            LockWait::Wait(_) => "set local lock_timeout = 0",
        };
        statement(session, &relation, timeout).await?;
    }

    for (parameter, delta) in &table.deltas {
        let alter = match &delta.new {
            Some(value) => alter_set_statement(table.kind.alter_keyword(), &relation, parameter, value),
            None => alter_reset_statement(table.kind.alter_keyword(), &relation, parameter),
        };

        statement(session, &relation, &format!("savepoint {}", SAVEPOINT)).await?;

        // Without LOCK TABLE a later parameter may need a stronger lock than
        // the ones already held.
        let result = if lock_table {
            session.execute(&alter).await
        } else {
            match attempt(session, &relation, &alter, wait).await? {
                Attempt::Done(result) => result,
                Attempt::Unavailable => return give_up(session, &relation, ApplyOutcome::LockUnavailable).await,
                Attempt::TimedOut => return give_up(session, &relation, ApplyOutcome::LockTimedOut).await,
            }
        };

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                debug!("{} on {} failed: {}", alter, relation, e);
                statement(session, &relation, &format!("rollback to savepoint {}", SAVEPOINT)).await?;
                Some(e)
            }
        };
        statement(session, &relation, &format!("release savepoint {}", SAVEPOINT)).await?;

        outcome.parameters.push(ParameterOutcome {
            parameter: parameter.clone(),
            old: delta.old.clone(),
            new: delta.new.clone(),
            error,
        });
    }

    statement(session, &relation, "commit").await?;
    Ok(ApplyOutcome::Applied(outcome))
}

fn lock_statement(relation: &str, mode: LockMode, wait: LockWait) -> String {
    match wait {
        LockWait::Nowait => format!("lock table {} in {} mode nowait", relation, mode),
        LockWait::Wait(_) => format!("lock table {} in {} mode", relation, mode),
    }
}

async fn statement<S: CatalogSession>(
    session: &mut S,
    relation: &str,
    sql: &str,
) -> Result<(), VacmanError> {
    session
        .execute(sql)
        .await
        .map_err(|e| VacmanError::statement(relation, e))
}

/// Runs a statement that may block on the relation's lock.
async fn attempt<S: CatalogSession>(
    session: &mut S,
    relation: &str,
    sql: &str,
    wait: LockWait,
) -> Result<Attempt, VacmanError> {
    match wait {
        LockWait::Nowait => match session.execute(sql).await {
            Err(e) if e.is_lock_not_available() => Ok(Attempt::Unavailable),
            result => Ok(Attempt::Done(result)),
        },
        LockWait::Wait(timeout) => {
            let (result, cancelled) = watched(session, relation, sql, timeout).await?;
            match result {
                Err(e) if e.is_lock_not_available() || (cancelled && e.is_query_canceled()) => {
                    Ok(Attempt::TimedOut)
                }
                result => Ok(Attempt::Done(result)),
            }
        }
    }
}

async fn give_up<S: CatalogSession>(
    session: &mut S,
    relation: &str,
    outcome: ApplyOutcome,
) -> Result<ApplyOutcome, VacmanError> {
    statement(session, relation, "rollback").await?;
    Ok(outcome)
}

async fn abort<S: CatalogSession>(
    session: &mut S,
    relation: &str,
    error: DbError,
) -> Result<ApplyOutcome, VacmanError> {
    if let Err(e) = session.execute("rollback").await {
        debug!("Rollback on {} failed: {}", relation, e);
    }
    Err(VacmanError::statement(relation, error))
}

/// Executes `sql` while a watchdog task warns about long waits and cancels
/// the statement once `timeout` passes. The watchdog is joined before this
/// returns. The flag reports whether a cancel was sent.
async fn watched<S: CatalogSession>(
    session: &mut S,
    relation: &str,
    sql: &str,
    timeout: Option<Duration>,
) -> Result<(Result<(), DbError>, bool), VacmanError> {
    let (done_tx, done_rx) = oneshot::channel();
    let watchdog = tokio::spawn(watchdog(session.canceller(), done_rx, relation.to_string(), timeout));

    let result = session.execute(sql).await;
    let _ = done_tx.send(());

    let watch = watchdog
        .await
        .map_err(|e| VacmanError::Worker(format!("lock watchdog for {} failed: {}", relation, e)))?;
    Ok((result, watch.cancels > 0))
}

/// What the watchdog did while one statement ran.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Watch {
    warnings: usize,
    cancels: usize,
}

async fn watchdog<C: StatementCanceller>(
    canceller: C,
    mut done: oneshot::Receiver<()>,
    relation: String,
    timeout: Option<Duration>,
) -> Watch {
    let start = Instant::now();
    let warn_at = start + WAIT_WARNING_AFTER;
    let deadline = timeout.map(|t| start + t);
    let mut watch = Watch::default();

    loop {
        let next = match (watch.warnings > 0, deadline) {
            (false, Some(deadline)) => warn_at.min(deadline),
            (false, None) => warn_at,
            (true, Some(deadline)) => deadline,
            (true, None) => {
                let _ = (&mut done).await;
                return watch;
            }
        };

        tokio::select! {
            _ = &mut done => return watch,
            _ = sleep_until(next) => {}
        }

        let now = Instant::now();
        if watch.warnings == 0 && now >= warn_at {
            warn!("Waiting for lock on {}", relation);
            watch.warnings += 1;
        }
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
    }

    debug!("Lock timeout on {} reached, cancelling", relation);
    loop {
        watch.cancels += 1;
        if let Err(e) = canceller.cancel().await {
            warn!("Unable to cancel lock wait on {}: {}", relation, e);
        }

        tokio::select! {
            _ = &mut done => return watch,
            _ = sleep(CANCEL_RETRY_INTERVAL) => debug!("Lock wait on {} still running, cancelling again", relation),
        }
    }
}
