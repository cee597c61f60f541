//! Table restore tasks and the include filters that select them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::extent::TableId;

/// One table's data entry from the backup's global table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub table_id: TableId,
    pub schema: String,
    pub name: String,
}

impl DataEntry {
    pub fn new(table_id: TableId, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table_id,
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Fully-qualified `schema.table` name. Identifiers are assumed quoted already.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Keep entries whose schema is in `include_schemas` and whose qualified name
/// is in `include_tables`. An empty list places no restriction.
pub fn filter_entries(
    entries: &[DataEntry],
    include_schemas: &[String],
    include_tables: &[String],
) -> Vec<DataEntry> {
    let schemas: HashSet<&str> = include_schemas.iter().map(String::as_str).collect();
    let tables: HashSet<&str> = include_tables.iter().map(String::as_str).collect();
    entries
        .iter()
        .filter(|entry| schemas.is_empty() || schemas.contains(entry.schema.as_str()))
        .filter(|entry| tables.is_empty() || tables.contains(entry.qualified_name().as_str()))
        .cloned()
        .collect()
}

/// Work item handed to a restore worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRestoreTask {
    pub table_id: TableId,
    pub schema_qualified_name: String,
    /// Table served immediately before this one, used by single-shot streamers
    /// to work out where a shared stream is positioned.
    pub previous_table_id: Option<TableId>,
}

/// Turn ordered data entries into tasks chained by their predecessor.
pub fn build_tasks(entries: &[DataEntry]) -> Vec<TableRestoreTask> {
    let mut previous = None;
    entries
        .iter()
        .map(|entry| {
            let task = TableRestoreTask {
                table_id: entry.table_id,
                schema_qualified_name: entry.qualified_name(),
                previous_table_id: previous,
            };
            previous = Some(entry.table_id);
            task
        })
        .collect()
}
