//! Merge shard tables into one table for the whole run.
//!
//! Shards are disjoint, so in a clean run merging is plain concatenation.
//! The merge still tolerates overlap from reruns or hand-assembled inputs:
//!
//! | Situation                          | Kept row                       |
//! |------------------------------------|--------------------------------|
//! | Identical rows                     | one copy                       |
//! | Same date, one row has no comment  | the row with a comment         |
//! | Same date, both have comments      | higher upvotes, earlier on tie |
//!
//! The result has exactly one row per date, ordered by date.

use super::table::{OutputRow, read_table, write_table};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Merge row sets given in shard order.
pub fn merge(shards: Vec<Vec<OutputRow>>) -> Vec<OutputRow> {
    let mut by_date: BTreeMap<_, OutputRow> = BTreeMap::new();

    for row in shards.into_iter().flatten().unique() {
        match by_date.entry(row.date) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                if beats(&row, slot.get()) {
                    slot.insert(row);
                }
            }
        }
    }

    by_date.into_values().collect()
}

/// Whether `challenger` replaces `held` for the same date.
fn beats(challenger: &OutputRow, held: &OutputRow) -> bool {
    match (challenger.has_comment(), held.has_comment()) {
        (true, false) => true,
        (true, true) => challenger.upvotes.unwrap_or(0) > held.upvotes.unwrap_or(0),
        _ => false,
    }
}

/// Read every input table, merge, and write the combined table to `output`.
///
/// Unreadable inputs are logged and skipped so one lost shard does not sink
/// the rest of the run.
///
/// # Returns
///
/// The merged rows that were written.
#[instrument(level = "info", skip(inputs), fields(inputs = inputs.len(), output = %output.display()))]
pub async fn merge_files(
    inputs: &[PathBuf],
    output: &Path,
    with_worst: bool,
) -> Result<Vec<OutputRow>, Box<dyn Error>> {
    let mut shards = Vec::with_capacity(inputs.len());
    for path in inputs {
        match read_table(path).await {
            Ok(rows) => shards.push(rows),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable shard table"),
        }
    }

    let merged = merge(shards);
    let with_comment = merged.iter().filter(|r| r.has_comment()).count();
    write_table(output, &merged, with_worst).await?;
    info!(dates = merged.len(), with_comment, "Merged shard tables");
    Ok(merged)
}
