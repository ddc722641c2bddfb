//! Named maintenance procedures.
//!
//! A procedure call is a name plus a JSON object of parameters, e.g.
//!
//! ```text
//! compact({"table": "db.events", "target_file_size_bytes": 134217728})
//! expire_snapshots({"table": "db.events", "max_age_days": 7, "dry_run": true})
//! ```
//!
//! Names are case-insensitive. Parameters are checked completely before the
//! engine touches the catalog or storage: unknown procedures fail with
//! [`ProcedureError::UnknownProcedure`], missing, mistyped or unknown
//! parameters with [`ProcedureError::InvalidParameters`].

use crate::config::MAX_RETENTION_DAYS;
use crate::engine::MaintenanceEngine;
use crate::error::ProcedureError;
use crate::maintenance::{CompactOptions, ExpireOptions, Filter, OrphanOptions, SortKey, Stats};
use crate::metadata::TableIdent;
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Registered procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    /// Bin-pack compaction
    Compact,
    /// Compaction with a global sort
    SortCompact,
    /// Snapshot expiry
    ExpireSnapshots,
    /// Orphan removal
    RemoveOrphanFiles,
}

const REGISTRY: &[(&str, Procedure)] = &[
    ("compact", Procedure::Compact),
    ("rewrite_data_files", Procedure::Compact),
    ("sort_compact", Procedure::SortCompact),
    ("expire_snapshots", Procedure::ExpireSnapshots),
    ("remove_orphan_files", Procedure::RemoveOrphanFiles),
];

impl Procedure {
    /// Look up a procedure by name, ignoring case.
    pub fn lookup(name: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(registered, _)| registered.eq_ignore_ascii_case(name.trim()))
            .map(|(_, procedure)| *procedure)
    }

    /// Every registered name, aliases included.
    pub fn names() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(name, _)| *name)
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Compact => "compact",
            Procedure::SortCompact => "sort_compact",
            Procedure::ExpireSnapshots => "expire_snapshots",
            Procedure::RemoveOrphanFiles => "remove_orphan_files",
        }
    }

    fn parameters(&self) -> &'static [&'static str] {
        match self {
            Procedure::Compact => &["table", "target_file_size_bytes", "max_files_per_group", "filter"],
            Procedure::SortCompact => &[
                "table",
                "target_file_size_bytes",
                "max_files_per_group",
                "filter",
                "sort_keys",
            ],
            Procedure::ExpireSnapshots => &["table", "max_age_days", "min_retain", "dry_run"],
            Procedure::RemoveOrphanFiles => &["table", "grace_days", "dry_run"],
        }
    }
}

/// A validated procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureCall {
    /// `compact` / `rewrite_data_files`
    Compact {
        table: TableIdent,
        options: CompactOptions,
    },
    /// `sort_compact`
    SortCompact {
        table: TableIdent,
        sort_keys: Vec<String>,
        options: CompactOptions,
    },
    /// `expire_snapshots`
    ExpireSnapshots {
        table: TableIdent,
        options: ExpireOptions,
    },
    /// `remove_orphan_files`
    RemoveOrphanFiles {
        table: TableIdent,
        options: OrphanOptions,
    },
}

impl ProcedureCall {
    /// Resolve and validate a call without doing any I/O.
    pub fn parse(name: &str, params: &Value) -> Result<Self> {
        let procedure = Procedure::lookup(name)
            .ok_or_else(|| ProcedureError::UnknownProcedure(name.to_string()))?;

        let empty = Map::new();
        let map = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(invalid(
                    procedure,
                    format!("parameters must be an object, got {}", type_name(other)),
                ))
            }
        };
        let params = Params { procedure, map };
        params.reject_unknown()?;

        let table = params.table()?;
        let call = match procedure {
            Procedure::Compact => ProcedureCall::Compact {
                table,
                options: params.compact_options()?,
            },
            Procedure::SortCompact => ProcedureCall::SortCompact {
                table,
                sort_keys: params.sort_keys()?,
                options: params.compact_options()?,
            },
            Procedure::ExpireSnapshots => ProcedureCall::ExpireSnapshots {
                table,
                options: ExpireOptions {
                    max_age_days: params.days("max_age_days")?,
                    min_retain: params.u64("min_retain", 1)?.map(|v| v as usize),
                    dry_run: params.bool("dry_run")?.unwrap_or(false),
                },
            },
            Procedure::RemoveOrphanFiles => ProcedureCall::RemoveOrphanFiles {
                table,
                options: OrphanOptions {
                    grace_days: params.days("grace_days")?,
                    dry_run: params.bool("dry_run")?.unwrap_or(false),
                },
            },
        };

        Ok(call)
    }

    /// The procedure being called.
    pub fn procedure(&self) -> Procedure {
        match self {
            ProcedureCall::Compact { .. } => Procedure::Compact,
            ProcedureCall::SortCompact { .. } => Procedure::SortCompact,
            ProcedureCall::ExpireSnapshots { .. } => Procedure::ExpireSnapshots,
            ProcedureCall::RemoveOrphanFiles { .. } => Procedure::RemoveOrphanFiles,
        }
    }

    /// The target table.
    pub fn table(&self) -> &TableIdent {
        match self {
            ProcedureCall::Compact { table, .. }
            | ProcedureCall::SortCompact { table, .. }
            | ProcedureCall::ExpireSnapshots { table, .. }
            | ProcedureCall::RemoveOrphanFiles { table, .. } => table,
        }
    }
}

fn invalid(procedure: Procedure, message: impl Into<String>) -> crate::Error {
    ProcedureError::InvalidParameters {
        procedure: procedure.name().to_string(),
        message: message.into(),
    }
    .into()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Params<'a> {
    procedure: Procedure,
    map: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    fn reject_unknown(&self) -> Result<()> {
        let allowed = self.procedure.parameters();
        let mut unknown: Vec<&str> = self
            .map
            .keys()
            .map(String::as_str)
            .filter(|key| !allowed.contains(key))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }

        unknown.sort_unstable();
        Err(invalid(
            self.procedure,
            format!(
                "unknown parameter(s) {}; expected one of {}",
                unknown.join(", "),
                allowed.join(", ")
            ),
        ))
    }

    /// Present, non-null value for `key`.
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn table(&self) -> Result<TableIdent> {
        match self.get("table") {
            None => Err(invalid(self.procedure, "missing required parameter table")),
            Some(Value::String(raw)) => raw
                .parse()
                .map_err(|_| invalid(self.procedure, format!("table must be \"namespace.name\", got \"{}\"", raw))),
            Some(other) => Err(invalid(
                self.procedure,
                format!("table must be a string, got {}", type_name(other)),
            )),
        }
    }

    fn u64(&self, key: &str, min: u64) -> Result<Option<u64>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.as_u64() {
            Some(v) if v >= min => Ok(Some(v)),
            Some(v) => Err(invalid(
                self.procedure,
                format!("{} must be at least {}, got {}", key, min, v),
            )),
            None => Err(invalid(
                self.procedure,
                format!("{} must be a non-negative integer, got {}", key, value),
            )),
        }
    }

    fn days(&self, key: &str) -> Result<Option<u64>> {
        match self.u64(key, 0)? {
            Some(days) if days > MAX_RETENTION_DAYS => Err(invalid(
                self.procedure,
                format!("{} must be at most {}, got {}", key, MAX_RETENTION_DAYS, days),
            )),
            days => Ok(days),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(invalid(
                self.procedure,
                format!("{} must be a boolean, got {}", key, type_name(other)),
            )),
        }
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(invalid(
                self.procedure,
                format!("{} must be a string, got {}", key, type_name(other)),
            )),
        }
    }

    fn compact_options(&self) -> Result<CompactOptions> {
        let filter = self.string("filter")?;
        if let Some(text) = &filter {
            Filter::parse(text)?;
        }

        Ok(CompactOptions {
            target_file_size_bytes: self.u64("target_file_size_bytes", 1)?,
            max_files_per_group: self.u64("max_files_per_group", 1)?.map(|v| v as usize),
            filter,
        })
    }

    fn sort_keys(&self) -> Result<Vec<String>> {
        let items = match self.get("sort_keys") {
            None => return Err(invalid(self.procedure, "missing required parameter sort_keys")),
            Some(Value::Array(items)) if items.is_empty() => {
                return Err(invalid(self.procedure, "sort_keys must not be empty"))
            }
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(invalid(
                    self.procedure,
                    format!("sort_keys must be an array of strings, got {}", type_name(other)),
                ))
            }
        };

        items
            .iter()
            .map(|item| {
                let Value::String(raw) = item else {
                    return Err(invalid(
                        self.procedure,
                        format!("sort_keys entries must be strings, got {}", type_name(item)),
                    ));
                };
                raw.parse::<SortKey>()
                    .map_err(|e| invalid(self.procedure, e.to_string()))?;
                Ok(raw.clone())
            })
            .collect()
    }
}

/// Dispatches named procedure calls to a [`MaintenanceEngine`].
#[derive(Debug, Clone)]
pub struct ProcedureDispatcher {
    engine: Arc<MaintenanceEngine>,
}

impl ProcedureDispatcher {
    /// Create a dispatcher over `engine`.
    pub fn new(engine: Arc<MaintenanceEngine>) -> Self {
        Self { engine }
    }

    /// The engine calls are dispatched to.
    pub fn engine(&self) -> &Arc<MaintenanceEngine> {
        &self.engine
    }

    /// Validate and run a procedure, returning its counters.
    pub async fn call(&self, name: &str, params: Value) -> Result<Stats> {
        let call = ProcedureCall::parse(name, &params)?;
        debug!(procedure = call.procedure().name(), table = %call.table(), "Dispatching procedure");
        self.execute(call).await
    }

    /// Run an already validated call.
    pub async fn execute(&self, call: ProcedureCall) -> Result<Stats> {
        let procedure = call.procedure();
        let stats: Stats = match call {
            ProcedureCall::Compact { table, options } => {
                self.engine.compact(&table, options).await?.into()
            }
            ProcedureCall::SortCompact {
                table,
                sort_keys,
                options,
            } => self
                .engine
                .sort_compact(&table, sort_keys, options)
                .await?
                .into(),
            ProcedureCall::ExpireSnapshots { table, options } => {
                self.engine.expire_snapshots(&table, options).await?.into()
            }
            ProcedureCall::RemoveOrphanFiles { table, options } => {
                self.engine.remove_orphan_files(&table, options).await?.into()
            }
        };

        info!(procedure = procedure.name(), stats = ?stats, "Procedure completed");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, PlanningError};
    use serde_json::json;

    fn invalid_message(result: Result<ProcedureCall>) -> String {
        match result {
            Err(Error::Procedure(ProcedureError::InvalidParameters { message, .. })) => message,
            other => panic!("expected InvalidParameters, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(Procedure::lookup("COMPACT"), Some(Procedure::Compact));
        assert_eq!(Procedure::lookup("Rewrite_Data_Files"), Some(Procedure::Compact));
        assert_eq!(Procedure::lookup("expire_snapshots"), Some(Procedure::ExpireSnapshots));
        assert_eq!(Procedure::lookup("vacuum"), None);
        assert_eq!(Procedure::names().count(), 5);
    }

    #[test]
    fn test_unknown_procedure() {
        let err = ProcedureCall::parse("vacuum", &json!({"table": "db.t"})).unwrap_err();
        assert!(matches!(
            err,
            Error::Procedure(ProcedureError::UnknownProcedure(name)) if name == "vacuum"
        ));
    }

    #[test]
    fn test_compact_parameters() {
        let call = ProcedureCall::parse(
            "compact",
            &json!({
                "table": "db.events",
                "target_file_size_bytes": 1024,
                "filter": "region = 'us' AND id > 10"
            }),
        )
        .unwrap();

        assert_eq!(
            call,
            ProcedureCall::Compact {
                table: TableIdent::new("db", "events"),
                options: CompactOptions {
                    target_file_size_bytes: Some(1024),
                    max_files_per_group: None,
                    filter: Some("region = 'us' AND id > 10".into()),
                },
            }
        );
    }

    #[test]
    fn test_missing_table() {
        let message = invalid_message(ProcedureCall::parse("compact", &json!({})));
        assert!(message.contains("table"));
        let message = invalid_message(ProcedureCall::parse("compact", &Value::Null));
        assert!(message.contains("table"));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let message = invalid_message(ProcedureCall::parse(
            "expire_snapshots",
            &json!({"table": "db.t", "retain_last": 3}),
        ));
        assert!(message.contains("retain_last"));
    }

    #[test]
    fn test_mistyped_parameters() {
        let message = invalid_message(ProcedureCall::parse(
            "compact",
            &json!({"table": "db.t", "target_file_size_bytes": "big"}),
        ));
        assert!(message.contains("target_file_size_bytes"));

        let message = invalid_message(ProcedureCall::parse(
            "compact",
            &json!({"table": "db.t", "target_file_size_bytes": 0}),
        ));
        assert!(message.contains("at least 1"));

        let message = invalid_message(ProcedureCall::parse(
            "remove_orphan_files",
            &json!({"table": "db.t", "dry_run": "yes"}),
        ));
        assert!(message.contains("dry_run"));

        let message = invalid_message(ProcedureCall::parse(
            "expire_snapshots",
            &json!({"table": "db.t", "min_retain": 0}),
        ));
        assert!(message.contains("min_retain"));

        let message = invalid_message(ProcedureCall::parse("compact", &json!({"table": "events"})));
        assert!(message.contains("namespace.name"));
    }

    #[test]
    fn test_sort_keys_validation() {
        let message = invalid_message(ProcedureCall::parse("sort_compact", &json!({"table": "db.t"})));
        assert!(message.contains("sort_keys"));

        let message = invalid_message(ProcedureCall::parse(
            "sort_compact",
            &json!({"table": "db.t", "sort_keys": []}),
        ));
        assert!(message.contains("empty"));

        let message = invalid_message(ProcedureCall::parse(
            "sort_compact",
            &json!({"table": "db.t", "sort_keys": ["id SIDEWAYS"]}),
        ));
        assert!(message.contains("SIDEWAYS"));

        let call = ProcedureCall::parse(
            "sort_compact",
            &json!({"table": "db.t", "sort_keys": ["region", "ts DESC NULLS LAST"]}),
        )
        .unwrap();
        assert!(matches!(call, ProcedureCall::SortCompact { sort_keys, .. } if sort_keys.len() == 2));
    }

    #[test]
    fn test_bad_filter_fails_before_io() {
        let err = ProcedureCall::parse("compact", &json!({"table": "db.t", "filter": "id >"}))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Planning(PlanningError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_gc_defaults() {
        let call = ProcedureCall::parse("remove_orphan_files", &json!({"table": "db.t"})).unwrap();
        assert_eq!(
            call,
            ProcedureCall::RemoveOrphanFiles {
                table: TableIdent::new("db", "t"),
                options: OrphanOptions::default(),
            }
        );
    }

    #[test]
    fn test_day_counts_are_bounded() {
        for (name, key) in [
            ("remove_orphan_files", "grace_days"),
            ("expire_snapshots", "max_age_days"),
        ] {
            let err = ProcedureCall::parse(name, &json!({"table": "db.t", key: u64::MAX}))
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Procedure(ProcedureError::InvalidParameters { .. })
            ));

            let err = ProcedureCall::parse(name, &json!({"table": "db.t", key: 100_000_000}))
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Procedure(ProcedureError::InvalidParameters { .. })
            ));

            assert!(ProcedureCall::parse(
                name,
                &json!({"table": "db.t", key: MAX_RETENTION_DAYS})
            )
            .is_ok());
        }
    }
}
