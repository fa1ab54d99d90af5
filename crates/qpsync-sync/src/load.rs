//! Incremental load: skip identities already in the table, insert the rest.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use qpsync_core::{Cell, FlatRow, RowSet};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("identity already present")]
    Duplicate,
    #[error("{0}")]
    Failed(String),
}

/// The append-only table responses are loaded into.
#[async_trait]
pub trait DestinationTable: Send {
    /// Values already stored in `identity_column`, rendered as dedup keys.
    async fn existing_keys(&mut self, identity_column: &str) -> Result<HashSet<String>>;

    async fn column_names(&mut self) -> Result<Vec<String>>;

    /// Insert one row; `cells` line up with `columns`.
    async fn insert_row(&mut self, columns: &[&str], cells: &[Cell]) -> Result<(), InsertError>;

    async fn commit(self) -> Result<()>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoadReport {
    pub existing: usize,
    /// Rows left after dropping known identities.
    pub candidates: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Rows whose identity is neither in `existing` nor earlier in the batch.
///
/// Returns the rows to insert plus how many in-batch repeats were dropped.
pub fn plan_inserts<'a>(set: &'a RowSet, existing: &HashSet<String>) -> (Vec<&'a FlatRow>, usize) {
    let mut seen = HashSet::new();
    let mut repeats = 0usize;
    let mut plan = Vec::new();
    for row in set.rows.iter().filter(|r| !existing.contains(&r.key)) {
        if seen.insert(row.key.as_str()) {
            plan.push(row);
        } else {
            repeats += 1;
        }
    }
    (plan, repeats)
}

pub async fn load<D>(set: &RowSet, mut dest: D) -> Result<LoadReport>
where
    D: DestinationTable,
{
    let existing = dest.existing_keys(set.identity_column()).await?;
    let (plan, repeats) = plan_inserts(set, &existing);
    let mut report = LoadReport {
        existing: existing.len(),
        candidates: plan.len(),
        duplicates: repeats,
        ..Default::default()
    };

    if plan.is_empty() {
        info!(existing = report.existing, "no new responses to load");
        return Ok(report);
    }

    let columns = set.columns();
    let table_columns: HashSet<String> = dest.column_names().await?.into_iter().collect();
    let missing: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !table_columns.contains(*c))
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "destination table lacks columns present in this batch");
    }

    for row in plan {
        let cells = set.cells(row);
        match dest.insert_row(&columns, &cells).await {
            Ok(()) => report.inserted += 1,
            Err(InsertError::Duplicate) => {
                debug!(key = %row.key, "identity already loaded; skipping");
                report.duplicates += 1;
            }
            Err(InsertError::Failed(message)) => {
                warn!(key = %row.key, error = %message, "row insert failed; skipping");
                report.failed += 1;
            }
        }
    }

    dest.commit().await?;
    info!(
        inserted = report.inserted,
        duplicates = report.duplicates,
        failed = report.failed,
        "load committed"
    );
    Ok(report)
}
