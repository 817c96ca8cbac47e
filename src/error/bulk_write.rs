use std::collections::HashMap;

use crate::{
    error::{WriteConcernError, WriteError},
    results::BulkWriteResult,
};

/// The errors accumulated while executing a bulk write, together with the result of every
/// statement that succeeded before execution stopped.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// The write concern errors reported by each executed batch, in execution order.
    pub write_concern_errors: Vec<WriteConcernError>,

    /// The statements that failed, keyed by the index at which they were added to the bulk
    /// write.
    pub write_errors: HashMap<usize, WriteError>,

    /// The merged result of the batches that were executed.
    pub partial_result: Option<BulkWriteResult>,
}

impl BulkWriteError {
    pub(crate) fn is_empty(&self) -> bool {
        self.write_concern_errors.is_empty() && self.write_errors.is_empty()
    }

    pub(crate) fn merge(&mut self, other: BulkWriteError) {
        self.write_concern_errors.extend(other.write_concern_errors);
        self.write_errors.extend(other.write_errors);
        if let Some(other_partial_result) = other.partial_result {
            self.merge_partial_results(other_partial_result);
        }
    }

    pub(crate) fn merge_partial_results(&mut self, other_partial_result: BulkWriteResult) {
        if let Some(ref mut partial_result) = self.partial_result {
            partial_result.merge(other_partial_result);
        } else {
            self.partial_result = Some(other_partial_result);
        }
    }
}
