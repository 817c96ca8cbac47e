use serde::Deserialize;

use crate::{
    bson::{doc, Bson, RawDocumentBuf},
    cmap::{Command, RawCommandResponse},
    error::{BulkWriteError, CommandError, Error, IndexedWriteError, Result, WriteConcernError},
    results::BulkWriteResult,
    Namespace,
};

use super::{BulkWriteLimits, BulkWriteOptions};

/// The kind of statements a [`Batch`] holds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum BatchType {
    /// `insert` statements.
    #[display("insert")]
    Insert,

    /// `update` statements, including replacements.
    #[display("update")]
    Update,

    /// `delete` statements.
    #[display("delete")]
    Delete,
}

impl BatchType {
    pub(crate) const ALL: [BatchType; 3] = [BatchType::Insert, BatchType::Update, BatchType::Delete];

    pub(crate) fn command_name(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// The identifier of the document sequence the statements are sent in.
    fn sequence_identifier(self) -> &'static str {
        match self {
            Self::Insert => "documents",
            Self::Update => "updates",
            Self::Delete => "deletes",
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }
}

/// A group of statements of one type that is sent to the server as a single command.
#[derive(Clone, Debug)]
pub struct Batch {
    batch_type: BatchType,
    operations: Vec<RawDocumentBuf>,
    original_indexes: Vec<usize>,
    inserted_ids: Vec<Bson>,
    size_bytes: usize,
}

impl Batch {
    pub(crate) fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            operations: Vec::new(),
            original_indexes: Vec::new(),
            inserted_ids: Vec::new(),
            size_bytes: 0,
        }
    }

    /// The kind of statements in this batch.
    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    /// The number of statements in this batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether this batch has no statements.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The total size in bytes of the statements in this batch.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// For each statement in this batch, the index at which it was added to the bulk write.
    pub fn original_indexes(&self) -> &[usize] {
        &self.original_indexes
    }

    /// Whether a statement of `size_bytes` can be added without exceeding `limits`. An empty
    /// batch accepts any statement.
    pub(crate) fn fits(&self, size_bytes: usize, limits: &BulkWriteLimits) -> bool {
        if self.is_empty() {
            return true;
        }
        self.len() < limits.max_write_batch_size()
            && self.size_bytes + size_bytes <= limits.max_payload_size()
    }

    pub(crate) fn push(
        &mut self,
        statement: RawDocumentBuf,
        original_index: usize,
        inserted_id: Option<Bson>,
    ) {
        self.size_bytes += statement.as_bytes().len();
        self.operations.push(statement);
        self.original_indexes.push(original_index);
        if let Some(id) = inserted_id {
            self.inserted_ids.push(id);
        }
    }

    fn original_index(&self, index: usize) -> Result<usize> {
        self.original_indexes.get(index).copied().ok_or_else(|| {
            Error::invalid_response(format!(
                "the server reported index {index} for a batch of {} statements",
                self.original_indexes.len()
            ))
        })
    }

    /// Builds the command for this batch, moving the statements into its document sequence.
    pub(crate) fn take_command(
        &mut self,
        ns: &Namespace,
        ordered: bool,
        options: &BulkWriteOptions,
    ) -> Result<Command> {
        let name = self.batch_type.command_name();
        let mut body = doc! {
            name: ns.coll.clone(),
            "ordered": ordered,
        };
        for (key, value) in crate::bson::to_document(options)? {
            body.insert(key, value);
        }

        let mut command = Command::new(name, &ns.db, body);
        command.add_document_sequence(
            self.batch_type.sequence_identifier(),
            std::mem::take(&mut self.operations),
        );
        Ok(command)
    }

    /// Converts the server's reply to this batch's command into a result and the errors it
    /// reports, both keyed by original index.
    pub(crate) fn merge_response(
        &self,
        response: RawCommandResponse,
        ordered: bool,
    ) -> Result<(BulkWriteResult, BulkWriteError)> {
        let body: WriteResponseBody = response.body()?;
        let mut result = BulkWriteResult::default();
        let mut error = BulkWriteError::default();

        let errored_positions: Vec<usize> = body
            .write_errors
            .iter()
            .flatten()
            .map(|write_error| write_error.index)
            .collect();

        match self.batch_type {
            BatchType::Insert => {
                result.inserted_count = body.n;
                if ordered {
                    // Ordered inserts stop at the first error, so only the first n were inserted.
                    let n = usize::try_from(body.n).unwrap_or(usize::MAX);
                    for (position, id) in self.inserted_ids.iter().enumerate().take(n) {
                        result
                            .inserted_ids
                            .insert(self.original_index(position)?, id.clone());
                    }
                } else {
                    for (position, id) in self.inserted_ids.iter().enumerate() {
                        if !errored_positions.contains(&position) {
                            result
                                .inserted_ids
                                .insert(self.original_index(position)?, id.clone());
                        }
                    }
                }
            }
            BatchType::Update => {
                let upserted = body.upserted.unwrap_or_default();
                let upserted_count = upserted.len() as u64;
                result.upserted_count = upserted_count;
                result.matched_count = body.n.saturating_sub(upserted_count);
                result.modified_count = body.n_modified;
                for Upserted { index, id } in upserted {
                    result.upserted_ids.insert(self.original_index(index)?, id);
                }
            }
            BatchType::Delete => result.deleted_count = body.n,
        }

        for write_error in body.write_errors.into_iter().flatten() {
            let index = self.original_index(write_error.index)?;
            error.write_errors.insert(index, write_error.into());
        }
        error.write_concern_errors.extend(body.write_concern_error);

        Ok((result, error))
    }

    /// Records a failure of this batch's whole command as a write error at the batch's first
    /// statement.
    pub(crate) fn command_failure(&self, command_error: CommandError) -> BulkWriteError {
        let mut error = BulkWriteError::default();
        if let Some(&index) = self.original_indexes.first() {
            error.write_errors.insert(index, command_error.into());
        }
        error
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponseBody {
    #[serde(default)]
    n: u64,

    #[serde(default)]
    n_modified: u64,

    upserted: Option<Vec<Upserted>>,

    write_errors: Option<Vec<IndexedWriteError>>,

    write_concern_error: Option<WriteConcernError>,
}

#[derive(Debug, Deserialize)]
struct Upserted {
    index: usize,

    #[serde(rename = "_id")]
    id: Bson,
}
