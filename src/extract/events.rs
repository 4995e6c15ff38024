//! Progress messages emitted while a batch runs

use std::path::PathBuf;
use uuid::Uuid;

use super::result::BatchStatus;
use crate::error::ErrorKind;

/// Messages sent from the extractor to an observer
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractEvent {
    /// Engines are ready and images are about to be processed
    BatchStarted {
        batch_id: Uuid,
        total: usize,
        workers: usize,
    },
    /// One image reached its final outcome (completion order, not input order)
    ImageFinished {
        batch_id: Uuid,
        index: usize,
        path: PathBuf,
        /// `None` on success
        error: Option<ErrorKind>,
    },
    /// All outcomes are final
    BatchFinished {
        batch_id: Uuid,
        status: BatchStatus,
        succeeded: usize,
        failed: usize,
    },
}
