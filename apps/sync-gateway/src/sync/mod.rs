pub mod engine;
pub mod rows;

pub use engine::{
    LogReport, RowError, SkippedRow, SyncEngine, SyncError, SyncSummary, SyncUpload,
};
pub use rows::{ClassifiedRow, SkipReason, classify_row};
