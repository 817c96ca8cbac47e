//! Contains the types of results returned by bulk writes.

use std::collections::HashMap;

use crate::bson::Bson;

/// The result of a bulk write.
///
/// Every map is keyed by the index at which the statement was added to the bulk write.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The number of documents matched by update and replace statements, excluding upserts.
    pub matched_count: u64,

    /// The number of documents modified by update and replace statements.
    pub modified_count: u64,

    /// The number of documents deleted.
    pub deleted_count: u64,

    /// The number of documents upserted.
    pub upserted_count: u64,

    /// The `_id` of every inserted document.
    pub inserted_ids: HashMap<usize, Bson>,

    /// The `_id` of every upserted document.
    pub upserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteResult {
    pub(crate) fn merge(&mut self, other: Self) {
        let BulkWriteResult {
            inserted_count: other_inserted_count,
            matched_count: other_matched_count,
            modified_count: other_modified_count,
            deleted_count: other_deleted_count,
            upserted_count: other_upserted_count,
            inserted_ids: other_inserted_ids,
            upserted_ids: other_upserted_ids,
        } = other;

        self.inserted_count += other_inserted_count;
        self.matched_count += other_matched_count;
        self.modified_count += other_modified_count;
        self.deleted_count += other_deleted_count;
        self.upserted_count += other_upserted_count;
        self.inserted_ids.extend(other_inserted_ids);
        self.upserted_ids.extend(other_upserted_ids);
    }
}
