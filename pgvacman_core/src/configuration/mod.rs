use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::VacmanError;

pub const MATCH_ALL: &str = ".*";

/// Selection rule binding relations to a ruleset.
///
/// Patterns are unanchored, like PostgreSQL's `~` operator.
#[derive(Debug, Clone)]
pub struct Matchgroup {
    pub schema: Regex,
    pub table: Regex,
    pub owner: Regex,
    pub case_sensitive: bool,
    pub ruleset: Option<String>,
}

impl Matchgroup {
    pub fn new(
        schema: &str,
        table: &str,
        owner: &str,
        case_sensitive: bool,
        ruleset: Option<&str>,
    ) -> Result<Self, (&'static str, regex::Error)> {
        let compile = |field: &'static str, pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| (field, e))
        };

        Ok(Self {
            schema: compile("schema", schema)?,
            table: compile("table", table)?,
            owner: compile("owner", owner)?,
            case_sensitive,
            ruleset: ruleset.filter(|r| !r.is_empty()).map(str::to_string),
        })
    }

    #[inline]
    pub fn matches(&self, schema: &str, table: &str, owner: &str) -> bool {
        self.schema.is_match(schema) && self.table.is_match(table) && self.owner.is_match(owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub minrows: u64,
    /// `None` resets the parameter to its default.
    pub settings: BTreeMap<String, Option<String>>,
}

/// Rules are kept sorted by ascending `minrows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(name: &str, mut rules: Vec<Rule>) -> Result<Self, VacmanError> {
        rules.sort_by_key(|r| r.minrows);

        if let Some(pair) = rules.windows(2).find(|w| w[0].minrows == w[1].minrows) {
            return Err(VacmanError::DuplicateThreshold {
                ruleset: name.to_string(),
                minrows: pair[0].minrows,
            });
        }

        for rule in &rules {
            if rule.settings.keys().any(|k| k.trim().is_empty()) {
                return Err(VacmanError::Configuration(format!(
                    "ruleset {} contains an empty parameter name",
                    name
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            rules,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub matchgroups: Vec<Matchgroup>,
    pub rulesets: BTreeMap<String, Ruleset>,
}

impl Configuration {
    pub fn new(
        matchgroups: Vec<Matchgroup>,
        rulesets: BTreeMap<String, Ruleset>,
    ) -> Result<Self, VacmanError> {
        for (index, group) in matchgroups.iter().enumerate() {
            if let Some(name) = &group.ruleset {
                if !rulesets.contains_key(name) {
                    return Err(VacmanError::UnknownRuleset {
                        index,
                        ruleset: name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            matchgroups,
            rulesets,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VacmanError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, VacmanError> {
        let file: RuleFile = serde_yaml::from_str(text)?;
        file.try_into()
    }

    pub fn ruleset_for(&self, matchgroup: usize) -> Option<&Ruleset> {
        self.matchgroups
            .get(matchgroup)
            .and_then(|g| g.ruleset.as_ref())
            .and_then(|name| self.rulesets.get(name))
    }

    /// Every parameter name any ruleset mentions.
    pub fn parameter_names(&self) -> BTreeSet<&str> {
        self.rulesets
            .values()
            .flat_map(|rs| rs.rules.iter())
            .flat_map(|r| r.settings.keys())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default, alias = "match")]
    matchgroups: Vec<MatchgroupEntry>,
    #[serde(default, alias = "ruleset")]
    rulesets: BTreeMap<String, Vec<RuleEntry>>,
}

fn match_all() -> String {
    MATCH_ALL.to_string()
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchgroupEntry {
    #[serde(default = "match_all")]
    schema: String,
    #[serde(default = "match_all")]
    table: String,
    #[serde(default = "match_all")]
    owner: String,
    #[serde(default = "yes")]
    case_sensitive: bool,
    #[serde(default)]
    ruleset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    minrows: u64,
    #[serde(default)]
    settings: BTreeMap<String, Option<SettingValue>>,
}

/// YAML scalars are accepted as written and stored as text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<SettingValue> for String {
    fn from(value: SettingValue) -> Self {
        match value {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Integer(i) => i.to_string(),
            SettingValue::Float(f) => f.to_string(),
            SettingValue::Text(s) => s,
        }
    }
}

impl TryFrom<RuleFile> for Configuration {
    type Error = VacmanError;

    fn try_from(file: RuleFile) -> Result<Self, Self::Error> {
        let matchgroups = file
            .matchgroups
            .into_iter()
            .enumerate()
            .map(|(index, m)| {
                Matchgroup::new(
                    &m.schema,
                    &m.table,
                    &m.owner,
                    m.case_sensitive,
                    m.ruleset.as_deref(),
                )
                .map_err(|(field, source)| VacmanError::InvalidPattern {
                    index,
                    field,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rulesets = BTreeMap::new();
        for (name, entries) in file.rulesets {
            let rules = entries
                .into_iter()
                .map(|e| Rule {
                    minrows: e.minrows,
                    settings: e
                        .settings
                        .into_iter()
                        .map(|(k, v)| (k, v.map(String::from)))
                        .collect(),
                })
                .collect();
            let ruleset = Ruleset::new(&name, rules)?;
            rulesets.insert(name, ruleset);
        }

        Configuration::new(matchgroups, rulesets)
    }
}
