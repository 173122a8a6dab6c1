//! Output generation: shard tables and the aggregated run table.
//!
//! # Submodules
//!
//! - [`table`]: one CSV row per date, written by each worker
//! - [`aggregate`]: merges shard tables into the final table for a run
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! ├── shard_0_2022-10-24_2022-10-28.csv   # one per shard
//! ├── shard_1_2022-10-29_2022-11-02.csv
//! └── top_comments_2022-10-24_2022-11-02.csv   # merged
//! ```

pub mod aggregate;
pub mod table;
