use std::{collections::BTreeMap, fmt};

use crate::core::quoting::quote_qualified;

/// Candidate relations with their own and their TOAST table's reloptions.
///
/// `reltuples` is a planner estimate, refreshed by ANALYZE/autovacuum.
pub const CANDIDATE_RELATIONS_QUERY: &str = "select c.oid::bigint as reloid, \
c.relkind::text as relkind, \
n.nspname::text as nspname, \
c.relname::text as relname, \
pg_get_userbyid(c.relowner)::text as relowner, \
c.reltuples::float8 as reltuples, \
coalesce(c.reloptions, '{}'::text[]) as reloptions, \
coalesce(t.reloptions, '{}'::text[]) as toastoptions \
from pg_class c \
join pg_namespace n on n.oid = c.relnamespace \
left join pg_class t on t.oid = c.reltoastrelid \
where c.relpersistence = 'p' \
and c.relkind in ('r', 'm') \
and n.nspname not in ('pg_catalog', 'information_schema') \
order by n.nspname, c.relname";

pub const LIST_DATABASES_QUERY: &str =
    "select datname::text from pg_database where datallowconn and not datistemplate order by datname";

pub const TOAST_PREFIX: &str = "toast.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Table,
    MaterializedView,
}

impl RelationKind {
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" => Some(Self::Table),
            "m" => Some(Self::MaterializedView),
            _ => None,
        }
    }

    pub fn alter_keyword(&self) -> &'static str {
        match self {
            RelationKind::Table => "table",
            RelationKind::MaterializedView => "materialized view",
        }
    }

    /// LOCK TABLE refuses materialized views; their lock is taken by the ALTER itself.
    #[inline]
    pub fn supports_lock_table(&self) -> bool {
        matches!(self, RelationKind::Table)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::Table => f.write_str("Table"),
            RelationKind::MaterializedView => f.write_str("Materialized view"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRelation {
    pub oid: i64,
    pub kind: RelationKind,
    pub schema: String,
    pub name: String,
    pub owner: String,
    pub row_estimate: u64,
    pub options: BTreeMap<String, String>,
}

impl CandidateRelation {
    pub fn new(oid: i64, kind: RelationKind, schema: &str, name: &str, owner: &str, row_estimate: u64) -> Self {
        Self {
            oid,
            kind,
            schema: schema.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            row_estimate,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

/// Negative estimates mean "never analyzed" on PostgreSQL 14+. Fractions are
/// truncated so `minrows` thresholds compare as they would against the float.
pub fn row_estimate(reltuples: f64) -> u64 {
    if reltuples.is_finite() && reltuples > 0.0 {
        reltuples.floor() as u64
    } else {
        0
    }
}

/// Splits `name=value` reloption entries. TOAST entries get the `toast.` prefix
/// they are set with.
pub fn parse_options(reloptions: &[String], toastoptions: &[String]) -> BTreeMap<String, String> {
    let own = reloptions.iter().filter_map(|o| split_option(o, ""));
    let toast = toastoptions.iter().filter_map(|o| split_option(o, TOAST_PREFIX));
    own.chain(toast).collect()
}

fn split_option(option: &str, prefix: &str) -> Option<(String, String)> {
    let (name, value) = option.split_once('=')?;
    Some((format!("{}{}", prefix, name), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let own = vec!["fillfactor=90".to_string(), "autovacuum_vacuum_scale_factor=0.01".to_string()];
        let toast = vec!["autovacuum_enabled=false".to_string()];

        let parsed = parse_options(&own, &toast);

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["fillfactor"], "90");
        assert_eq!(parsed["autovacuum_vacuum_scale_factor"], "0.01");
        assert_eq!(parsed["toast.autovacuum_enabled"], "false");
    }

    #[test]
    fn test_parse_option_value_with_equals() {
        let own = vec!["weird=a=b".to_string(), "garbage".to_string()];
        let parsed = parse_options(&own, &[]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["weird"], "a=b");
    }

    #[test]
    fn test_row_estimate() {
        assert_eq!(row_estimate(-1.0), 0);
        assert_eq!(row_estimate(0.0), 0);
        assert_eq!(row_estimate(1234.6), 1234);
        assert_eq!(row_estimate(999.6), 999);
        assert_eq!(row_estimate(1000.0), 1000);
        assert_eq!(row_estimate(f64::NAN), 0);
    }

    #[test]
    fn test_relkind() {
        assert_eq!(RelationKind::from_relkind("r"), Some(RelationKind::Table));
        assert_eq!(RelationKind::from_relkind("m"), Some(RelationKind::MaterializedView));
        assert_eq!(RelationKind::from_relkind("v"), None);
    }

    #[test]
    fn test_quoted_name() {
        let rel = CandidateRelation::new(1, RelationKind::Table, "Sales", "order\"s", "app", 0);
        assert_eq!(rel.quoted_name(), "\"Sales\".\"order\"\"s\"");
    }
}
