use crate::{
    bson::{Array, Bson, Document},
    error::Result,
};

use super::{BulkWriteOperation, UpdateModifications, WriteModel};

/// Builds the update, replace or delete statement for the documents matching a filter. Created
/// by [`BulkWriteOperation::find`].
///
/// ```no_run
/// # fn run(bulk: &mut mongo_bulk_auth::BulkWriteOperation) -> mongo_bulk_auth::error::Result<()> {
/// use mongo_bulk_auth::bson::doc;
///
/// bulk.find(doc! { "sku": "abc" })
///     .upsert()
///     .update_one(doc! { "$inc": { "qty": 1 } })?;
/// bulk.find(doc! { "qty": 0 }).delete()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FindOperators<'a> {
    bulk: &'a mut BulkWriteOperation,
    filter: Document,
    upsert: Option<bool>,
    collation: Option<Document>,
    array_filters: Option<Array>,
    hint: Option<Bson>,
}

impl<'a> FindOperators<'a> {
    pub(crate) fn new(bulk: &'a mut BulkWriteOperation, filter: Document) -> Self {
        Self {
            bulk,
            filter,
            upsert: None,
            collation: None,
            array_filters: None,
            hint: None,
        }
    }

    /// Inserts a document if no document matches the filter. Applies to updates and
    /// replacements.
    pub fn upsert(mut self) -> Self {
        self.upsert = Some(true);
        self
    }

    /// The collation used when matching the filter.
    pub fn collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Which array elements an update operator on an array field applies to.
    pub fn array_filters(mut self, array_filters: impl IntoIterator<Item = Document>) -> Self {
        self.array_filters = Some(array_filters.into_iter().map(Bson::Document).collect());
        self
    }

    /// The index the server uses to find matching documents, by name or by key pattern.
    pub fn hint(mut self, hint: impl Into<Bson>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Updates the first matching document.
    pub fn update_one(self, update: impl Into<UpdateModifications>) -> Result<()> {
        let model = WriteModel::UpdateOne {
            filter: self.filter,
            update: update.into(),
            array_filters: self.array_filters,
            collation: self.collation,
            hint: self.hint,
            upsert: self.upsert,
        };
        self.bulk.add(model)
    }

    /// Updates every matching document.
    pub fn update(self, update: impl Into<UpdateModifications>) -> Result<()> {
        let model = WriteModel::UpdateMany {
            filter: self.filter,
            update: update.into(),
            array_filters: self.array_filters,
            collation: self.collation,
            hint: self.hint,
            upsert: self.upsert,
        };
        self.bulk.add(model)
    }

    /// Replaces the first matching document.
    pub fn replace_one(self, replacement: Document) -> Result<()> {
        let model = WriteModel::ReplaceOne {
            filter: self.filter,
            replacement,
            collation: self.collation,
            hint: self.hint,
            upsert: self.upsert,
        };
        self.bulk.add(model)
    }

    /// Deletes the first matching document.
    pub fn delete_one(self) -> Result<()> {
        let model = WriteModel::DeleteOne {
            filter: self.filter,
            collation: self.collation,
            hint: self.hint,
        };
        self.bulk.add(model)
    }

    /// Deletes every matching document.
    pub fn delete(self) -> Result<()> {
        let model = WriteModel::DeleteMany {
            filter: self.filter,
            collation: self.collation,
            hint: self.hint,
        };
        self.bulk.add(model)
    }
}
