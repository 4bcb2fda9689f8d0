use log::{Level, info, log, warn};
use parking_lot::Mutex;

use crate::{
    configuration::Configuration,
    core::{applier::TableOutcome, rules::TableMatch, stats::RunStats},
};

/// Serializes multi-line blocks so concurrent workers don't interleave them.
/// Successful tables are logged at `info`, anything with a failed parameter
/// at `warn`.
#[derive(Debug, Default)]
pub struct Reporter {
    output: Mutex<()>,
    dry_run: bool,
}

impl Reporter {
    pub fn new(dry_run: bool) -> Self {
        Self {
            output: Mutex::new(()),
            dry_run,
        }
    }

    pub fn table(&self, outcome: &TableOutcome) {
        let level = if outcome.failed() > 0 { Level::Warn } else { Level::Info };
        self.emit(level, &render_table(outcome, self.dry_run));
    }

    pub fn skipped(&self, relation: &str) {
        warn!("Unable to lock {}, skipping", relation);
    }

    pub fn deferred(&self, relation: &str) {
        info!("Unable to lock {} without waiting, will retry", relation);
    }

    pub fn timed_out(&self, relation: &str) {
        warn!("Timed out waiting for lock on {}, not modified", relation);
    }

    pub fn summary(&self, stats: &RunStats) {
        let level = if stats.tables_unlocked() > 0 || stats.parameters_failed > 0 {
            Level::Warn
        } else {
            Level::Info
        };
        self.emit(level, &[render_summary(stats, self.dry_run)]);
    }

    pub fn matches(&self, config: &Configuration, matches: &[TableMatch]) {
        self.emit(Level::Info, &render_matches(config, matches));
    }

    fn emit(&self, level: Level, lines: &[String]) {
        let _guard = self.output.lock();
        for line in lines {
            log!(level, "{}", line);
        }
    }
}

fn render_change(parameter: &str, old: Option<&str>, new: Option<&str>) -> String {
    match (new, old) {
        (None, _) => format!("Reset {}", parameter),
        (Some(new), None) => format!("Set {} to {} (previously unset)", parameter, new),
        (Some(new), Some(old)) => format!("Set {} to {} (previous setting {})", parameter, new, old),
    }
}

pub fn render_table(outcome: &TableOutcome, dry_run: bool) -> Vec<String> {
    let mut lines = Vec::with_capacity(outcome.parameters.len() + 1);
    lines.push(format!(
        "{} {} ({} rows{}):",
        outcome.kind,
        outcome.relation,
        outcome.row_estimate,
        if dry_run { ", dry run" } else { "" }
    ));

    for p in &outcome.parameters {
        match &p.error {
            None => lines.push(format!(
                "  {}",
                render_change(&p.parameter, p.old.as_deref(), p.new.as_deref())
            )),
            Some(e) => lines.push(format!("  Unable to set storage parameter {}: {}", p.parameter, e)),
        }
    }

    lines
}

pub fn render_summary(stats: &RunStats, dry_run: bool) -> String {
    format!(
        "{}{} tables matched, {} updated, {} left locked; {} of {} parameters set, {} failed",
        if dry_run { "Dry run: " } else { "" },
        stats.tables_matched,
        stats.tables_applied,
        stats.tables_unlocked(),
        stats.parameters_applied,
        stats.parameters_attempted,
        stats.parameters_failed
    )
}

/// One block per matchgroup, in configuration order.
pub fn render_matches(config: &Configuration, matches: &[TableMatch]) -> Vec<String> {
    let mut lines = Vec::new();

    for (index, group) in config.matchgroups.iter().enumerate() {
        lines.push(format!(
            "Matchgroup {} (schema ~ {}, table ~ {}, owner ~ {}{}): {}",
            index,
            group.schema.as_str(),
            group.table.as_str(),
            group.owner.as_str(),
            if group.case_sensitive { "" } else { ", case insensitive" },
            group.ruleset.as_deref().unwrap_or("no ruleset")
        ));

        let members: Vec<&TableMatch> = matches.iter().filter(|m| m.matchgroup == index).collect();
        if members.is_empty() {
            lines.push("  no relations".to_string());
        }

        for m in members {
            lines.push(format!(
                "  {} {} ({} rows, owner {})",
                m.kind,
                m.quoted_name(),
                m.row_estimate,
                m.owner
            ));

            if m.ruleset.is_none() {
                lines.push("    no ruleset".to_string());
            } else if m.deltas.is_empty() {
                lines.push("    no changes".to_string());
            }

            for (parameter, delta) in &m.deltas {
                lines.push(format!(
                    "    {}",
                    render_change(parameter, delta.old.as_deref(), delta.new.as_deref())
                ));
            }
        }
    }

    lines
}
