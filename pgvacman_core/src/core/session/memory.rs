use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_postgres::error::SqlState;

use crate::{
    core::{
        applier::LockMode,
        catalog::CandidateRelation,
        session::traits::{CatalogSession, SessionProvider, StatementCanceller},
    },
    error::{DbError, VacmanError},
};

/// How another (imaginary) backend holds a relation's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// NOWAIT fails, a waiting request gets the lock at once.
    Brief,
    /// Every request blocks until cancelled or timed out.
    Forever,
    /// A waiting request is granted after the given delay.
    For(Duration),
    /// Readers hold the relation: only access exclusive requests conflict,
    /// and those block until cancelled or timed out.
    AccessShare,
}

/// Shared, in-memory stand-in for a database: a catalog snapshot, simulated
/// lock holders and a log of every statement executed by any session.
#[derive(Default)]
pub struct MemoryCatalog {
    relations: Mutex<Vec<CandidateRelation>>,
    contention: Mutex<HashMap<String, Contention>>,
    failing_parameters: Mutex<HashSet<String>>,
    forbidden: Mutex<HashSet<String>>,
    statements: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    ignored_cancels: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new(relations: Vec<CandidateRelation>) -> Arc<Self> {
        Arc::new(Self {
            relations: Mutex::new(relations),
            ..Default::default()
        })
    }

    pub fn contend(&self, schema: &str, name: &str, contention: Contention) {
        self.contention
            .lock()
            .insert(crate::core::quoting::quote_qualified(schema, name), contention);
    }

    /// ALTERs touching `parameter` fail with invalid_parameter_value.
    pub fn reject_parameter(&self, parameter: &str) {
        self.failing_parameters.lock().insert(parameter.to_string());
    }

    /// Locking this relation fails with insufficient_privilege.
    pub fn forbid(&self, schema: &str, name: &str) {
        self.forbidden
            .lock()
            .insert(crate::core::quoting::quote_qualified(schema, name));
    }

    /// The next `count` cancel requests are counted but never reach the
    /// waiting statement.
    pub fn ignore_cancels(&self, count: usize) {
        self.ignored_cancels.store(count, Ordering::SeqCst);
    }

    pub fn relations(&self) -> Vec<CandidateRelation> {
        self.relations.lock().clone()
    }

    pub fn relation(&self, schema: &str, name: &str) -> Option<CandidateRelation> {
        self.relations
            .lock()
            .iter()
            .find(|r| r.schema == schema && r.name == name)
            .cloned()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn contention_for(&self, statement: &str) -> Option<Contention> {
        self.contention
            .lock()
            .iter()
            .find(|(rel, _)| statement.contains(rel.as_str()))
            .map(|(_, c)| *c)
    }

    /// Contention as seen by a request for `mode`.
    fn conflicting(&self, statement: &str, mode: LockMode) -> Option<Contention> {
        match self.contention_for(statement) {
            Some(Contention::AccessShare) if mode < LockMode::AccessExclusive => None,
            contention => contention,
        }
    }

    fn is_forbidden(&self, statement: &str) -> bool {
        self.forbidden.lock().iter().any(|rel| statement.contains(rel.as_str()))
    }

    fn commit(&self, changes: Vec<Change>) {
        let mut relations = self.relations.lock();
        for change in changes {
            if let Some(rel) = relations.iter_mut().find(|r| r.quoted_name() == change.relation) {
                match change.value {
                    Some(value) => rel.options.insert(change.parameter, value),
                    None => rel.options.remove(&change.parameter),
                };
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Change {
    relation: String,
    parameter: String,
    value: Option<String>,
}

#[derive(Default)]
struct Transaction {
    changes: Vec<Change>,
    savepoints: Vec<(String, usize)>,
    lock_timeout: Option<Duration>,
    held: Option<LockMode>,
}

type Waiter = Arc<Mutex<Option<oneshot::Sender<()>>>>;

pub struct MemorySession {
    catalog: Arc<MemoryCatalog>,
    transaction: Option<Transaction>,
    waiter: Waiter,
}

impl MemorySession {
    pub fn new(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            catalog,
            transaction: None,
            waiter: Arc::new(Mutex::new(None)),
        }
    }

    /// Blocks like a lock wait: until `delay` passes (granted) or a cancel arrives.
    async fn wait_for_lock(&self, delay: Option<Duration>) -> Result<(), DbError> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock() = Some(tx);

        let granted = match delay {
            Some(delay) => tokio::select! {
                _ = rx => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                let _ = rx.await;
                false
            }
        };

        self.waiter.lock().take();

        if granted {
            Ok(())
        } else {
            Err(DbError::with_code(
                SqlState::QUERY_CANCELED,
                "canceling statement due to user request",
            ))
        }
    }

    async fn lock(&mut self, statement: &str) -> Result<(), DbError> {
        if self.catalog.is_forbidden(statement) {
            return Err(DbError::with_code(
                SqlState::INSUFFICIENT_PRIVILEGE,
                "permission denied for table",
            ));
        }

        let mode = if statement.contains(" access exclusive ") {
            LockMode::AccessExclusive
        } else {
            LockMode::ShareUpdateExclusive
        };
        let nowait = statement.ends_with(" nowait");
        match (self.catalog.conflicting(statement, mode), nowait) {
            (None, _) => {}
            (Some(_), true) => return Err(lock_not_available()),
            (Some(Contention::Brief), false) => {}
            (Some(Contention::For(delay)), false) => self.wait_for_lock(Some(delay)).await?,
            (Some(Contention::Forever | Contention::AccessShare), false) => self.wait_for_lock(None).await?,
        }

        if let Some(transaction) = self.transaction.as_mut() {
            transaction.held = transaction.held.max(Some(mode));
        }
        Ok(())
    }

    /// Without LOCK TABLE the ALTER waits for the lock its parameter needs,
    /// bounded by lock_timeout.
    async fn alter_lock(&mut self, statement: &str, parameter: &str) -> Result<(), DbError> {
        let Some(transaction) = self.transaction.as_ref() else {
            return Ok(());
        };
        let mode = LockMode::for_parameters(std::iter::once(parameter));
        if transaction.held >= Some(mode) {
            return Ok(());
        }

        let timeout = transaction.lock_timeout;
        let nowait = Duration::from_millis(1);
        match (self.catalog.conflicting(statement, mode), timeout) {
            (None, _) => {}
            (Some(Contention::Brief), Some(timeout)) if timeout <= nowait => {
                return Err(lock_not_available());
            }
            (Some(Contention::Brief), _) => {}
            (Some(Contention::For(delay)), Some(timeout)) if delay <= timeout => {
                tokio::time::sleep(delay).await;
            }
            (Some(_), Some(timeout)) => {
                tokio::time::sleep(timeout).await;
                return Err(lock_not_available());
            }
            (Some(Contention::For(delay)), None) => self.wait_for_lock(Some(delay)).await?,
            (Some(Contention::Forever | Contention::AccessShare), None) => self.wait_for_lock(None).await?,
        }

        if let Some(transaction) = self.transaction.as_mut() {
            transaction.held = transaction.held.max(Some(mode));
        }
        Ok(())
    }

    async fn alter(&mut self, statement: &str) -> Result<(), DbError> {
        let relation = self
            .catalog
            .relations
            .lock()
            .iter()
            .map(|r| r.quoted_name())
            .find(|q| statement.contains(q.as_str()))
            .ok_or_else(|| DbError::with_code(SqlState::UNDEFINED_TABLE, "relation does not exist"))?;

        let rest = &statement[statement.find(relation.as_str()).unwrap_or(0) + relation.len()..];
        let (parameter, value) = parse_alter(rest)
            .ok_or_else(|| DbError::with_code(SqlState::SYNTAX_ERROR, "syntax error"))?;

        if self.catalog.failing_parameters.lock().contains(&parameter) {
            return Err(DbError::with_code(
                SqlState::INVALID_PARAMETER_VALUE,
                format!("unrecognized parameter \"{}\"", parameter),
            ));
        }

        self.alter_lock(statement, &parameter).await?;

        let transaction = self
            .transaction
            .as_mut()
            .ok_or_else(|| DbError::new(None, "alter outside transaction"))?;
        transaction.changes.push(Change {
            relation,
            parameter,
            value,
        });
        Ok(())
    }
}

fn lock_not_available() -> DbError {
    DbError::with_code(SqlState::LOCK_NOT_AVAILABLE, "could not obtain lock on relation")
}

/// Recovers the parameter and value from ` set ("p" = 'v')` / ` reset ("p")`.
fn parse_alter(rest: &str) -> Option<(String, Option<String>)> {
    let rest = rest.trim_start();
    let (is_set, body) = if let Some(body) = rest.strip_prefix("set (") {
        (true, body)
    } else {
        (false, rest.strip_prefix("reset (")?)
    };
    let body = body.strip_suffix(')')?;

    let (quoted_parameter, literal) = if is_set {
        let (p, v) = body.split_once(" = ")?;
        (p, Some(v))
    } else {
        (body, None)
    };

    let value = literal.map(|v| {
        let v = v.trim_start_matches(" E").trim_start_matches('E');
        v[1..v.len() - 1].replace("''", "'").replace("\\\\", "\\")
    });
    Some((unquote_parameter(quoted_parameter), value))
}

fn unquote_parameter(quoted: &str) -> String {
    let unquote = |s: &str| s.trim_matches('"').replace("\"\"", "\"");
    match quoted.split_once("\".\"") {
        Some((ns, name)) => format!("{}.{}", unquote(ns), unquote(name)),
        None => unquote(quoted),
    }
}

impl CatalogSession for MemorySession {
    type Canceller = MemoryCanceller;

    async fn execute(&mut self, statement: &str) -> Result<(), DbError> {
        self.catalog.statements.lock().push(statement.to_string());

        if statement.starts_with("begin") {
            self.transaction = Some(Transaction::default());
            return Ok(());
        }

        if statement == "commit" {
            if let Some(transaction) = self.transaction.take() {
                self.catalog.commit(transaction.changes);
            }
            return Ok(());
        }

        if statement == "rollback" {
            self.transaction = None;
            return Ok(());
        }

        let Some(transaction) = self.transaction.as_mut() else {
            if statement.starts_with("alter ") {
                return Err(DbError::new(None, "alter outside transaction"));
            }
            return Ok(());
        };

        if let Some(name) = statement.strip_prefix("savepoint ") {
            transaction.savepoints.push((name.to_string(), transaction.changes.len()));
            return Ok(());
        }

        if let Some(name) = statement.strip_prefix("release savepoint ") {
            transaction.savepoints.retain(|(n, _)| n != name);
            return Ok(());
        }

        if let Some(name) = statement.strip_prefix("rollback to savepoint ") {
            if let Some((_, mark)) = transaction.savepoints.iter().rev().find(|(n, _)| n == name) {
                transaction.changes.truncate(*mark);
            }
            return Ok(());
        }

        if let Some(value) = statement.strip_prefix("set local lock_timeout = ") {
            let millis: u64 = value.trim_matches('\'').parse().unwrap_or(0);
            transaction.lock_timeout = (millis > 0).then(|| Duration::from_millis(millis));
            return Ok(());
        }

        if statement.starts_with("lock table ") {
            return self.lock(statement).await;
        }

        if statement.starts_with("alter ") {
            return self.alter(statement).await;
        }

        Err(DbError::with_code(SqlState::SYNTAX_ERROR, "unsupported statement"))
    }

    async fn fetch_candidates(&mut self) -> Result<Vec<CandidateRelation>, DbError> {
        Ok(self.catalog.relations())
    }

    async fn list_databases(&mut self) -> Result<Vec<String>, DbError> {
        Ok(vec!["postgres".to_string()])
    }

    fn canceller(&self) -> MemoryCanceller {
        MemoryCanceller {
            catalog: self.catalog.clone(),
            waiter: self.waiter.clone(),
        }
    }
}

pub struct MemoryCanceller {
    catalog: Arc<MemoryCatalog>,
    waiter: Waiter,
}

impl StatementCanceller for MemoryCanceller {
    async fn cancel(&self) -> Result<(), DbError> {
        self.catalog.cancels.fetch_add(1, Ordering::SeqCst);
        let ignored = self
            .catalog
            .ignored_cancels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !ignored {
            if let Some(tx) = self.waiter.lock().take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    }
}

pub struct MemoryProvider {
    catalog: Arc<MemoryCatalog>,
    connections: AtomicUsize,
    reject_password: bool,
}

impl MemoryProvider {
    pub fn new(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            catalog,
            connections: AtomicUsize::new(0),
            reject_password: false,
        }
    }

    pub fn rejecting_password(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            reject_password: true,
            ..Self::new(catalog)
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl SessionProvider for MemoryProvider {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, VacmanError> {
        if self.reject_password {
            return Err(VacmanError::PasswordAuthentication(DbError::with_code(
                SqlState::INVALID_PASSWORD,
                "password authentication failed",
            )));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession::new(self.catalog.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        catalog::RelationKind,
        quoting::{alter_reset_statement, alter_set_statement, quote_qualified},
    };

    fn catalog() -> Arc<MemoryCatalog> {
        MemoryCatalog::new(vec![
            CandidateRelation::new(1, RelationKind::Table, "public", "orders", "app", 10)
                .with_option("fillfactor", "90"),
        ])
    }

    #[tokio::test]
    async fn test_commit_and_rollback_to_savepoint() {
        let catalog = catalog();
        let mut session = MemorySession::new(catalog.clone());
        let rel = quote_qualified("public", "orders");

        session.execute("begin").await.unwrap();
        session.execute("savepoint p1").await.unwrap();
        session
            .execute(&alter_set_statement("table", &rel, "toast.autovacuum_enabled", "it's"))
            .await
            .unwrap();
        session.execute("release savepoint p1").await.unwrap();
        session.execute("savepoint p2").await.unwrap();
        session.execute(&alter_reset_statement("table", &rel, "fillfactor")).await.unwrap();
        session.execute("rollback to savepoint p2").await.unwrap();
        session.execute("commit").await.unwrap();

        let rel = catalog.relation("public", "orders").unwrap();
        assert_eq!(rel.options["toast.autovacuum_enabled"], "it's");
        assert_eq!(rel.options["fillfactor"], "90");
    }

    #[tokio::test]
    async fn test_nowait_on_contended_relation() {
        let catalog = catalog();
        catalog.contend("public", "orders", Contention::Brief);
        let mut session = MemorySession::new(catalog.clone());

        session.execute("begin").await.unwrap();
        let err = session
            .execute("lock table \"public\".\"orders\" in access exclusive mode nowait")
            .await
            .unwrap_err();
        assert!(err.is_lock_not_available());
    }

    #[tokio::test]
    async fn test_cancel_idle_session_is_noop() {
        let catalog = catalog();
        let session = MemorySession::new(catalog.clone());
        session.canceller().cancel().await.unwrap();
        assert!(session.waiter.lock().is_none());
        assert_eq!(catalog.cancel_count(), 1);
    }
}
