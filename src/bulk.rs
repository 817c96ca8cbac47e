//! Ordered and unordered bulk writes against a single collection.

mod batch;
mod find;
mod options;
#[cfg(test)]
mod test;

use crate::{
    bson::Document,
    cmap::{
        Connection,
        StreamDescription,
        DEFAULT_MAX_BSON_OBJECT_SIZE,
        DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        DEFAULT_MAX_WRITE_BATCH_SIZE,
    },
    error::{BulkWriteError, Error, ErrorKind, Result},
    results::BulkWriteResult,
    trace::BULK_TRACING_EVENT_TARGET,
    Namespace,
};

pub use self::{
    batch::{Batch, BatchType},
    find::FindOperators,
    options::{BulkWriteOptions, UpdateModifications, WriteModel},
};

/// The number of bytes of a message reserved for the command document surrounding a batch's
/// statements.
const COMMAND_OVERHEAD_SIZE: usize = 16_000;

/// The room the server allows beyond the maximum document size for the fields wrapping an
/// update or delete statement's documents.
const STATEMENT_OVERHEAD_SIZE: usize = 16 * 1024;

/// The server limits that bound the size of each batch.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteLimits {
    /// The maximum size of a single statement.
    pub max_bson_object_size: i64,

    /// The maximum number of statements in one batch.
    pub max_write_batch_size: i64,

    /// The maximum size of a wire protocol message.
    pub max_message_size_bytes: i32,
}

impl Default for BulkWriteLimits {
    fn default() -> Self {
        Self {
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

impl From<&StreamDescription> for BulkWriteLimits {
    fn from(description: &StreamDescription) -> Self {
        Self {
            max_bson_object_size: description.max_bson_object_size,
            max_write_batch_size: description.max_write_batch_size,
            max_message_size_bytes: description.max_message_size_bytes,
        }
    }
}

impl BulkWriteLimits {
    /// Limits with the given values.
    pub fn new(
        max_bson_object_size: i64,
        max_write_batch_size: i64,
        max_message_size_bytes: i32,
    ) -> Self {
        Self {
            max_bson_object_size,
            max_write_batch_size,
            max_message_size_bytes,
        }
    }

    fn max_bson_object_size(&self) -> usize {
        usize::try_from(self.max_bson_object_size).unwrap_or_default()
    }

    /// The largest statement of `batch_type` that may be added. Inserted documents are bound by
    /// the maximum document size itself.
    fn max_statement_size(&self, batch_type: BatchType) -> usize {
        match batch_type {
            BatchType::Insert => self.max_bson_object_size(),
            BatchType::Update | BatchType::Delete => {
                self.max_bson_object_size() + STATEMENT_OVERHEAD_SIZE
            }
        }
    }

    pub(crate) fn max_write_batch_size(&self) -> usize {
        usize::try_from(self.max_write_batch_size).unwrap_or_default()
    }

    /// The number of bytes of statements one batch may carry.
    pub(crate) fn max_payload_size(&self) -> usize {
        usize::try_from(self.max_message_size_bytes)
            .unwrap_or_default()
            .saturating_sub(COMMAND_OVERHEAD_SIZE)
    }
}

/// A set of insert, update, replace and delete statements against one collection, split into
/// batches as they are added and executed with [`execute`](BulkWriteOperation::execute).
///
/// An ordered bulk write groups contiguous statements of the same type, executes its batches one
/// after another and stops at the first batch that reports a write error. An unordered bulk write
/// keeps one open batch per statement type and executes every batch regardless of errors.
#[derive(Debug)]
pub struct BulkWriteOperation {
    ns: Namespace,
    limits: BulkWriteLimits,
    options: BulkWriteOptions,
    ordered: bool,

    /// Full batches, in the order they were sealed.
    sealed: Vec<Batch>,

    /// The open batch for each statement type, indexed by `BatchType::slot`. In ordered mode at
    /// most one is open.
    current: [Option<Batch>; 3],

    len: usize,
}

impl BulkWriteOperation {
    /// Creates an ordered bulk write.
    pub fn ordered(
        ns: Namespace,
        limits: BulkWriteLimits,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Self {
        Self::new(ns, limits, options.into(), true)
    }

    /// Creates an unordered bulk write.
    pub fn unordered(
        ns: Namespace,
        limits: BulkWriteLimits,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Self {
        Self::new(ns, limits, options.into(), false)
    }

    fn new(
        ns: Namespace,
        limits: BulkWriteLimits,
        options: Option<BulkWriteOptions>,
        ordered: bool,
    ) -> Self {
        Self {
            ns,
            limits,
            options: options.unwrap_or_default(),
            ordered,
            sealed: Vec::new(),
            current: [None, None, None],
            len: 0,
        }
    }

    /// Whether this bulk write is ordered.
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// The collection this bulk write applies to.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The number of statements added so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no statements have been added.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The batches that will be executed, in execution order.
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.sealed
            .iter()
            .chain(self.current.iter().flatten())
            .filter(|batch| !batch.is_empty())
    }

    /// Adds an insert of `document`, generating an `_id` for it if it doesn't have one.
    pub fn insert(&mut self, document: Document) -> Result<()> {
        self.add(WriteModel::InsertOne { document })
    }

    /// Starts an update, replace or delete of the documents matching `filter`.
    pub fn find(&mut self, filter: Document) -> FindOperators<'_> {
        FindOperators::new(self, filter)
    }

    /// Adds a statement.
    ///
    /// Fails if the statement is invalid or too large for the server; the bulk write is
    /// unchanged in that case. Inserted documents may be up to the maximum document size, and
    /// update and delete statements get 16 KiB beyond it for their surrounding fields.
    pub fn add(&mut self, model: WriteModel) -> Result<()> {
        let batch_type = model.batch_type();
        let (statement, inserted_id) = model.into_statement()?;

        let size = statement.as_bytes().len();
        let max_size = self.limits.max_statement_size(batch_type);
        if size > max_size {
            return Err(Error::invalid_argument(format!(
                "{batch_type} statement must be within {max_size} bytes, but the statement \
                 provided is {size} bytes",
            )));
        }

        if self.ordered {
            for other in BatchType::ALL.into_iter().filter(|t| *t != batch_type) {
                self.seal(other);
            }
        }
        if self.current[batch_type.slot()]
            .as_ref()
            .is_some_and(|batch| !batch.fits(size, &self.limits))
        {
            self.seal(batch_type);
        }

        let index = self.len;
        self.current[batch_type.slot()]
            .get_or_insert_with(|| Batch::new(batch_type))
            .push(statement, index, inserted_id);
        self.len += 1;

        Ok(())
    }

    fn seal(&mut self, batch_type: BatchType) {
        if let Some(batch) = self.current[batch_type.slot()].take() {
            tracing::debug!(
                target: BULK_TRACING_EVENT_TARGET,
                namespace = %self.ns,
                commandName = %batch_type,
                statements = batch.len(),
                sizeBytes = batch.size_bytes(),
                "Batch sealed"
            );
            self.sealed.push(batch);
        }
    }

    /// Executes every batch over `conn` and merges the server's replies.
    ///
    /// If any statement fails, or the server reports a write concern error, the returned error
    /// is an [`ErrorKind::BulkWrite`] holding the write errors keyed by the index at which each
    /// statement was added and the result of everything that was executed. A network or protocol
    /// failure stops execution immediately; the resulting `BulkWrite` error has that failure as
    /// its source.
    pub async fn execute(self, conn: &mut Connection) -> Result<BulkWriteResult> {
        if self.is_empty() {
            return Err(Error::invalid_argument(
                "cannot execute a bulk write with no statements",
            ));
        }
        if let Some(ref write_concern) = self.options.write_concern {
            write_concern.validate()?;
            if !write_concern.is_acknowledged() {
                return Err(Error::invalid_argument(
                    "bulk writes do not support unacknowledged write concerns",
                ));
            }
        }

        let BulkWriteOperation {
            ns,
            options,
            ordered,
            sealed,
            current,
            ..
        } = self;

        let mut result = BulkWriteResult::default();
        let mut errors = BulkWriteError::default();

        for mut batch in sealed.into_iter().chain(current.into_iter().flatten()) {
            let command = batch.take_command(&ns, ordered, &options)?;
            tracing::debug!(
                target: BULK_TRACING_EVENT_TARGET,
                driverConnectionId = conn.id,
                namespace = %ns,
                commandName = %batch.batch_type(),
                statements = batch.original_indexes().len(),
                "Batch dispatched"
            );

            let batch_errors = match conn.run_command(command).await {
                Ok(response) => match batch.merge_response(response, ordered) {
                    Ok((batch_result, batch_errors)) => {
                        result.merge(batch_result);
                        batch_errors
                    }
                    Err(error) => return Err(abort(error, result, errors)),
                },
                Err(error) => match error.kind.as_ref() {
                    ErrorKind::Command(command_error) => {
                        batch.command_failure(command_error.clone())
                    }
                    _ => return Err(abort(error, result, errors)),
                },
            };

            tracing::debug!(
                target: BULK_TRACING_EVENT_TARGET,
                driverConnectionId = conn.id,
                namespace = %ns,
                commandName = %batch.batch_type(),
                writeErrors = batch_errors.write_errors.len(),
                writeConcernErrors = batch_errors.write_concern_errors.len(),
                "Batch merged"
            );

            let stop = ordered && !batch_errors.write_errors.is_empty();
            errors.merge(batch_errors);
            if stop {
                break;
            }
        }

        if errors.is_empty() {
            Ok(result)
        } else {
            errors.partial_result = Some(result);
            Err(ErrorKind::BulkWrite(errors).into())
        }
    }
}

/// Wraps a failure that stopped execution in a `BulkWrite` error carrying what was done so far.
fn abort(source: Error, result: BulkWriteResult, mut errors: BulkWriteError) -> Error {
    errors.partial_result = Some(result);
    Error::from(ErrorKind::BulkWrite(errors)).with_source(source)
}
