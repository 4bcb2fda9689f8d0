use std::collections::BTreeMap;

use crate::{
    configuration::{Configuration, Ruleset},
    core::{
        catalog::{CandidateRelation, RelationKind},
        matching::MatchedRelation,
        quoting::quote_qualified,
    },
};

/// Required change of one storage parameter. `new == None` is a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDelta {
    pub old: Option<String>,
    pub new: Option<String>,
}

impl OptionDelta {
    #[inline]
    pub fn is_reset(&self) -> bool {
        self.new.is_none()
    }
}

/// A matched relation and the parameter changes it needs. Deltas are kept in a
/// `BTreeMap` so they are always applied and reported in name order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMatch {
    pub oid: i64,
    pub kind: RelationKind,
    pub schema: String,
    pub name: String,
    pub owner: String,
    pub row_estimate: u64,
    pub matchgroup: usize,
    pub ruleset: Option<String>,
    pub deltas: BTreeMap<String, OptionDelta>,
}

impl TableMatch {
    pub fn new(relation: &CandidateRelation, matchgroup: usize, ruleset: Option<&str>) -> Self {
        Self {
            oid: relation.oid,
            kind: relation.kind,
            schema: relation.schema.clone(),
            name: relation.name.clone(),
            owner: relation.owner.clone(),
            row_estimate: relation.row_estimate,
            matchgroup,
            ruleset: ruleset.map(str::to_string),
            deltas: BTreeMap::new(),
        }
    }

    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

/// Target value per parameter at `rows`: every rule with `minrows <= rows` is
/// active, and per parameter the active rule with the highest threshold wins.
pub fn resolve_settings(ruleset: &Ruleset, rows: u64) -> BTreeMap<String, Option<String>> {
    let mut winners: BTreeMap<&str, (u64, &Option<String>)> = BTreeMap::new();

    for rule in ruleset.rules.iter().filter(|r| r.minrows <= rows) {
        for (parameter, value) in &rule.settings {
            let entry = winners.entry(parameter.as_str()).or_insert((rule.minrows, value));
            if rule.minrows >= entry.0 {
                *entry = (rule.minrows, value);
            }
        }
    }

    winners
        .into_iter()
        .map(|(parameter, (_, value))| (parameter.to_string(), value.clone()))
        .collect()
}

/// Compares resolved targets with the live reloptions. Values compare as text.
pub fn diff(
    resolved: &BTreeMap<String, Option<String>>,
    current: &BTreeMap<String, String>,
) -> BTreeMap<String, OptionDelta> {
    resolved
        .iter()
        .filter_map(|(parameter, target)| {
            let old = current.get(parameter);
            let changed = match (target, old) {
                (None, None) => false,
                (None, Some(_)) => true,
                (Some(new), Some(old)) => new != old,
                (Some(_), None) => true,
            };

            changed.then(|| {
                (
                    parameter.clone(),
                    OptionDelta {
                        old: old.cloned(),
                        new: target.clone(),
                    },
                )
            })
        })
        .collect()
}

/// Builds the table matches for the scheduler. Only relations with a ruleset
/// and at least one delta are kept, unless `display` is set, in which case
/// every matched relation is returned.
pub fn evaluate(
    config: &Configuration,
    matched: &[MatchedRelation],
    display: bool,
) -> Vec<TableMatch> {
    matched
        .iter()
        .filter_map(|m| {
            let ruleset = config.ruleset_for(m.matchgroup);
            let mut table_match = TableMatch::new(&m.relation, m.matchgroup, ruleset.map(|r| r.name.as_str()));

            if let Some(ruleset) = ruleset {
                let resolved = resolve_settings(ruleset, m.relation.row_estimate);
                table_match.deltas = diff(&resolved, &m.relation.options);
            }

            (display || !table_match.deltas.is_empty()).then_some(table_match)
        })
        .collect()
}
