use std::future::Future;

use crate::{core::catalog::CandidateRelation, error::{DbError, VacmanError}};

/// One catalog connection. Statements are never issued concurrently on the
/// same session; the only out-of-band operation is [`StatementCanceller::cancel`].
#[allow(async_fn_in_trait)]
pub trait CatalogSession: Send + 'static {
    type Canceller: StatementCanceller;

    fn execute(&mut self, statement: &str) -> impl Future<Output = Result<(), DbError>> + Send;

    fn fetch_candidates(
        &mut self,
    ) -> impl Future<Output = Result<Vec<CandidateRelation>, DbError>> + Send;

    fn list_databases(&mut self) -> impl Future<Output = Result<Vec<String>, DbError>> + Send;

    fn canceller(&self) -> Self::Canceller;
}

/// Cancels whatever statement the owning session is running, without closing it.
/// Cancelling an idle session is a no-op.
#[allow(async_fn_in_trait)]
pub trait StatementCanceller: Send + Sync + 'static {
    fn cancel(&self) -> impl Future<Output = Result<(), DbError>> + Send;
}

#[allow(async_fn_in_trait)]
pub trait SessionProvider: Send + Sync {
    type Session: CatalogSession;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, VacmanError>> + Send;
}
