//! Batch progress summary.
//!
//! Status compares the ledger against the catalog without side effects: counts
//! per recorded status, what is still pending, and which ledger entries the
//! catalog no longer knows about.
use crate::catalog::Catalog;
use crate::ledger::OutcomeLedger;
use crate::outcome::OutcomeStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub catalog: String,
    pub ledger: String,
    pub total: usize,
    pub recorded: usize,
    pub pending: usize,
    /// Status string to count, for catalog scenarios only. Foreign strings
    /// from hand edits are kept verbatim.
    pub statuses: BTreeMap<String, usize>,
    /// Recorded statuses this tool never writes (hand edits, older runs).
    pub unrecognized: usize,
    /// Ledger entries whose scenario is not in the catalog.
    pub orphaned: Vec<String>,
    pub next_pending: Option<String>,
}

pub fn build_status_summary(
    catalog_path: &Path,
    catalog: &Catalog,
    ledger: &OutcomeLedger,
) -> StatusSummary {
    let mut statuses = BTreeMap::new();
    let mut recorded = 0;
    let mut unrecognized = 0;
    let mut next_pending = None;
    for task in catalog.tasks() {
        if ledger.contains(&task.id) {
            recorded += 1;
            let status = ledger
                .status(&task.id)
                .unwrap_or("<non-string>")
                .to_string();
            if status.parse::<OutcomeStatus>().is_err() {
                unrecognized += 1;
            }
            *statuses.entry(status).or_insert(0) += 1;
        } else if next_pending.is_none() {
            next_pending = Some(task.id.clone());
        }
    }
    let orphaned = ledger
        .entries()
        .map(|(id, _)| id)
        .filter(|id| !catalog.tasks().iter().any(|task| task.id == *id))
        .map(str::to_string)
        .collect();

    StatusSummary {
        catalog: catalog_path.display().to_string(),
        ledger: ledger.path().display().to_string(),
        total: catalog.len(),
        recorded,
        pending: catalog.len() - recorded,
        statuses,
        unrecognized,
        orphaned,
        next_pending,
    }
}

pub fn print_status(summary: &StatusSummary) {
    println!("catalog: {}", summary.catalog);
    println!("ledger: {}", summary.ledger);
    println!(
        "scenarios: {} total, {} recorded, {} pending",
        summary.total, summary.recorded, summary.pending
    );
    if !summary.statuses.is_empty() {
        println!("outcomes:");
        for (status, count) in &summary.statuses {
            println!("  - {status}: {count}");
        }
    }
    if summary.unrecognized > 0 {
        println!("unrecognized statuses: {}", summary.unrecognized);
    }
    if !summary.orphaned.is_empty() {
        println!("not in catalog: {}", summary.orphaned.join(", "));
    }
    match &summary.next_pending {
        Some(id) => println!("next: {id}"),
        None => println!("next: none (batch complete)"),
    }
}
