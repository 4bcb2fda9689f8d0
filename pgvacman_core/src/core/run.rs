use std::{sync::Arc, time::Duration};

use log::{debug, info};

use crate::{
    configuration::Configuration,
    core::{
        matching::resolve_matches,
        report::Reporter,
        rules::evaluate,
        scheduler::{RunStatus, Scheduler, SchedulerOptions},
        session::traits::{CatalogSession, SessionProvider},
        stats::{RunStats, StatsAggregator},
    },
    error::VacmanError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub jobs: usize,
    pub dry_run: bool,
    pub lock_timeout: Option<Duration>,
    pub skip_locked: bool,
    /// Print the matchgroup assignment and exit without changing anything.
    pub display_only: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            dry_run: false,
            lock_timeout: None,
            skip_locked: false,
            display_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub stats: RunStats,
}

/// Reads the catalog, resolves matches and rules, and applies every pending
/// change against the database behind `provider`.
pub async fn run<P: SessionProvider>(
    provider: &P,
    config: &Configuration,
    options: &RunOptions,
) -> Result<RunReport, VacmanError> {
    let mut session = provider.connect().await?;
    let relations = session.fetch_candidates().await.map_err(VacmanError::Catalog)?;
    debug!(
        "{} candidate relations, rulesets manage {} parameters",
        relations.len(),
        config.parameter_names().len()
    );

    let matched = resolve_matches(&config.matchgroups, relations);
    let reporter = Arc::new(Reporter::new(options.dry_run));
    let stats = Arc::new(StatsAggregator::new());

    if options.display_only {
        reporter.matches(config, &evaluate(config, &matched, true));
        return Ok(RunReport {
            status: RunStatus::Complete,
            stats: stats.snapshot(),
        });
    }

    let tables = evaluate(config, &matched, false);
    stats.record_matched(matched.len());
    info!("{} relations matched, {} need changes", matched.len(), tables.len());

    let scheduler = Scheduler::new(
        SchedulerOptions {
            jobs: options.jobs,
            dry_run: options.dry_run,
            lock_timeout: options.lock_timeout,
            skip_locked: options.skip_locked,
        },
        stats.clone(),
        reporter.clone(),
    );
    let status = scheduler.run(provider, session, tables).await?;

    let stats = stats.snapshot();
    reporter.summary(&stats);
    Ok(RunReport { status, stats })
}
