//! Active filters, their compiled SQL form, and the query scope snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One filter chip selected by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFilter {
    /// SQL column or expression.
    pub column: String,
    pub value: String,
    #[serde(default)]
    pub exclude: bool,
}

impl ActiveFilter {
    pub fn include(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            exclude: false,
        }
    }

    pub fn exclude(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            exclude: true,
        }
    }

    fn constraint(&self) -> String {
        if self.exclude {
            format!("!={}", self.value)
        } else {
            format!("={}", self.value)
        }
    }
}

impl std::str::FromStr for ActiveFilter {
    type Err = anyhow::Error;

    /// Parses `column=value` or `column!=value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((column, value)) = s.split_once("!=") {
            return Ok(ActiveFilter::exclude(column.trim(), value.trim()));
        }
        match s.split_once('=') {
            Some((column, value)) if !column.trim().is_empty() => {
                Ok(ActiveFilter::include(column.trim(), value.trim()))
            }
            _ => anyhow::bail!("invalid filter '{}': expected column=value or column!=value", s),
        }
    }
}

/// Column -> sorted constraint strings (`=v`, `!=v`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterMap(BTreeMap<String, BTreeSet<String>>);

impl FilterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, constraint: impl Into<String>) {
        self.0.entry(column.into()).or_default().insert(constraint.into());
    }

    pub fn get(&self, column: &str) -> Option<&BTreeSet<String>> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Canonical string form, used as the filter component of anomaly ids.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// Compiled filters: a SQL fragment (`AND ...` or empty) plus the map form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilters {
    pub sql: String,
    pub map: FilterMap,
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Includes on the same column are OR'ed together, excludes are AND'ed.
pub fn compile_filters(filters: &[ActiveFilter]) -> CompiledFilters {
    let mut map = FilterMap::new();
    let mut by_column: BTreeMap<&str, (Vec<&str>, Vec<&str>)> = BTreeMap::new();

    for f in filters {
        map.insert(f.column.clone(), f.constraint());
        let entry = by_column.entry(f.column.as_str()).or_default();
        if f.exclude {
            entry.1.push(f.value.as_str());
        } else {
            entry.0.push(f.value.as_str());
        }
    }

    let mut clauses = Vec::new();
    for (column, (includes, excludes)) in by_column {
        if !includes.is_empty() {
            let ors: Vec<String> = includes
                .iter()
                .map(|v| format!("{} = {}", column, quote(v)))
                .collect();
            clauses.push(format!("({})", ors.join(" OR ")));
        }
        for v in excludes {
            clauses.push(format!("{} != {}", column, quote(v)));
        }
    }

    let sql = clauses
        .iter()
        .map(|c| format!(" AND {}", c))
        .collect::<String>();

    CompiledFilters { sql, map }
}

/// `current` contains every filter `cached` was computed under.
pub fn is_superset(current: &FilterMap, cached: &FilterMap) -> bool {
    cached
        .iter()
        .all(|(column, constraints)| current.get(column) == Some(constraints))
}

/// Immutable snapshot of the scope a result was computed under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub time_filter: String,
    pub host_filter: String,
    pub filter_map: FilterMap,
}

impl QueryContext {
    pub fn new(time_filter: impl Into<String>, host_filter: impl Into<String>, filter_map: FilterMap) -> Self {
        Self {
            time_filter: time_filter.into(),
            host_filter: host_filter.into(),
            filter_map,
        }
    }
}
