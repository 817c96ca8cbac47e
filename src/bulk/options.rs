use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{Array, Bson, Document, RawDocumentBuf},
    bson_util::{get_or_prepend_id_field, replacement_document_check, update_document_check},
    error::Result,
    options::WriteConcern,
    serde_util,
};

use super::BatchType;

/// Specifies the options to a [`BulkWriteOperation`](crate::BulkWriteOperation).
///
/// Whether the bulk write is ordered is decided by the constructor used, not by these options.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// If true, allows the writes to opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Tags the commands sent for this bulk write so they can be identified in the server's
    /// logs and profiler output.
    pub comment: Option<Bson>,

    /// Variables that update and delete filters can refer to as `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// The write concern every batch is sent with.
    #[serde(skip_serializing_if = "serde_util::write_concern_is_empty")]
    pub write_concern: Option<WriteConcern>,
}

/// The modifications an update statement applies to the documents it matches.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum UpdateModifications {
    /// A document that contains only update operator expressions.
    Document(Document),

    /// An aggregation pipeline.
    Pipeline(Vec<Document>),
}

impl From<Document> for UpdateModifications {
    fn from(item: Document) -> Self {
        UpdateModifications::Document(item)
    }
}

impl From<Vec<Document>> for UpdateModifications {
    fn from(item: Vec<Document>) -> Self {
        UpdateModifications::Pipeline(item)
    }
}

/// A single statement of a bulk write.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WriteModel {
    /// Inserts `document`, generating an `_id` for it if it doesn't have one.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Updates the first document matching `filter`.
    UpdateOne {
        /// The filter selecting the document to update.
        filter: Document,
        /// The update to apply.
        update: UpdateModifications,
        /// Which array elements an update operator on an array field applies to.
        array_filters: Option<Array>,
        /// The collation used when matching `filter`.
        collation: Option<Document>,
        /// The index the server uses to find matching documents.
        hint: Option<Bson>,
        /// Whether to insert a document if none match `filter`.
        upsert: Option<bool>,
    },

    /// Updates every document matching `filter`.
    UpdateMany {
        /// The filter selecting the documents to update.
        filter: Document,
        /// The update to apply.
        update: UpdateModifications,
        /// Which array elements an update operator on an array field applies to.
        array_filters: Option<Array>,
        /// The collation used when matching `filter`.
        collation: Option<Document>,
        /// The index the server uses to find matching documents.
        hint: Option<Bson>,
        /// Whether to insert a document if none match `filter`.
        upsert: Option<bool>,
    },

    /// Replaces the first document matching `filter` with `replacement`.
    ReplaceOne {
        /// The filter selecting the document to replace.
        filter: Document,
        /// The replacement document. Must not contain update operators.
        replacement: Document,
        /// The collation used when matching `filter`.
        collation: Option<Document>,
        /// The index the server uses to find matching documents.
        hint: Option<Bson>,
        /// Whether to insert `replacement` if no document matches `filter`.
        upsert: Option<bool>,
    },

    /// Deletes the first document matching `filter`.
    DeleteOne {
        /// The filter selecting the document to delete.
        filter: Document,
        /// The collation used when matching `filter`.
        collation: Option<Document>,
        /// The index the server uses to find matching documents.
        hint: Option<Bson>,
    },

    /// Deletes every document matching `filter`.
    DeleteMany {
        /// The filter selecting the documents to delete.
        filter: Document,
        /// The collation used when matching `filter`.
        collation: Option<Document>,
        /// The index the server uses to find matching documents.
        hint: Option<Bson>,
    },
}

#[skip_serializing_none]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatement<'a, U> {
    q: &'a Document,
    u: &'a U,
    multi: bool,
    upsert: Option<bool>,
    array_filters: Option<&'a Array>,
    collation: Option<&'a Document>,
    hint: Option<&'a Bson>,
}

#[skip_serializing_none]
#[derive(Serialize)]
struct DeleteStatement<'a> {
    q: &'a Document,
    limit: i32,
    collation: Option<&'a Document>,
    hint: Option<&'a Bson>,
}

impl WriteModel {
    pub(crate) fn batch_type(&self) -> BatchType {
        match self {
            Self::InsertOne { .. } => BatchType::Insert,
            Self::UpdateOne { .. } | Self::UpdateMany { .. } | Self::ReplaceOne { .. } => {
                BatchType::Update
            }
            Self::DeleteOne { .. } | Self::DeleteMany { .. } => BatchType::Delete,
        }
    }

    /// Whether this statement applies to every document that matches its filter. Returns `None`
    /// for inserts.
    fn multi(&self) -> Option<bool> {
        match self {
            Self::UpdateMany { .. } | Self::DeleteMany { .. } => Some(true),
            Self::UpdateOne { .. } | Self::ReplaceOne { .. } | Self::DeleteOne { .. } => {
                Some(false)
            }
            Self::InsertOne { .. } => None,
        }
    }

    /// Validates this model and converts it into the statement sent in the command's document
    /// sequence. Also returns the `_id` of the document if this is an insert.
    pub(crate) fn into_statement(self) -> Result<(RawDocumentBuf, Option<Bson>)> {
        let multi = self.multi().unwrap_or_default();
        match self {
            Self::InsertOne { mut document } => {
                let id = get_or_prepend_id_field(&mut document);
                Ok((RawDocumentBuf::from_document(&document)?, Some(id)))
            }
            Self::UpdateOne {
                filter,
                update,
                array_filters,
                collation,
                hint,
                upsert,
            }
            | Self::UpdateMany {
                filter,
                update,
                array_filters,
                collation,
                hint,
                upsert,
            } => {
                if let UpdateModifications::Document(ref update_document) = update {
                    update_document_check(update_document)?;
                }
                let statement = UpdateStatement {
                    q: &filter,
                    u: &update,
                    multi,
                    upsert,
                    array_filters: array_filters.as_ref(),
                    collation: collation.as_ref(),
                    hint: hint.as_ref(),
                };
                Ok((crate::bson::to_raw_document_buf(&statement)?, None))
            }
            Self::ReplaceOne {
                filter,
                replacement,
                collation,
                hint,
                upsert,
            } => {
                replacement_document_check(&replacement)?;
                let statement = UpdateStatement {
                    q: &filter,
                    u: &replacement,
                    multi,
                    upsert,
                    array_filters: None,
                    collation: collation.as_ref(),
                    hint: hint.as_ref(),
                };
                Ok((crate::bson::to_raw_document_buf(&statement)?, None))
            }
            Self::DeleteOne {
                filter,
                collation,
                hint,
            }
            | Self::DeleteMany {
                filter,
                collation,
                hint,
            } => {
                let statement = DeleteStatement {
                    q: &filter,
                    limit: if multi { 0 } else { 1 },
                    collation: collation.as_ref(),
                    hint: hint.as_ref(),
                };
                Ok((crate::bson::to_raw_document_buf(&statement)?, None))
            }
        }
    }
}
