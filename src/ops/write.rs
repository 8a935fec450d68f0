use super::{Repo, projection_document};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema::ID_FIELD;
use crate::value::Value;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ReturnDocument;

/// Outcome of an `update` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Default)]
pub struct FindAndModifyOptions {
    pub sort: Option<Document>,
    /// Delete the matched document instead of updating it.
    pub remove: bool,
    /// Return the post-update document instead of the pre-update one.
    pub return_new: bool,
    pub upsert: bool,
    pub projection: Option<Vec<String>>,
}

impl Repo {
    /// Persists a record: insert when it has never been saved, whole-document
    /// replace otherwise. Validates first, assigns the identity back onto the
    /// record, and resets its dirty state. Returns the identity value.
    pub async fn save(&self, record: &mut Record) -> Result<Bson> {
        record.validate()?;
        let doc = record.to_wire(None)?;

        let id = if record.is_new() || !doc.contains_key("_id") {
            let filter = Document::new();
            self.timed("insert", &filter, async {
                let result = self
                    .collection()
                    .insert_one(doc)
                    .await
                    .map_err(Error::from)?;
                Ok(result.inserted_id)
            })
            .await?
        } else {
            let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
            let filter = doc! { "_id": id.clone() };
            self.timed("replace", &filter, async {
                self.collection()
                    .replace_one(filter.clone(), doc)
                    .await
                    .map_err(Error::from)
            })
            .await?;
            id
        };

        record.set(ID_FIELD, Value::from_bson(id.clone()))?;
        record.clear_changed_fields();
        Ok(id)
    }

    /// Deletes the document backing this record. The record keeps its data
    /// but no longer corresponds to anything stored.
    pub async fn delete(&self, record: &Record) -> Result<u64> {
        let id = record
            .id()
            .ok_or_else(|| Error::Operation("cannot delete a record without an id".into()))?
            .to_bson()?;
        self.remove(doc! { "_id": id }, false).await
    }

    /// Applies a raw update document to every match (or the first, with
    /// `multi: false`). Empty filters and empty updates are rejected.
    pub async fn update(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        if update.is_empty() {
            return Err(Error::Operation("cannot do empty updates".into()));
        }
        if filter.is_empty() {
            return Err(Error::Operation("cannot do empty filters".into()));
        }
        let filter = self.rewrite_filter(filter);
        let update = self.rewrite_update(update)?;

        let result = self
            .timed("update", &filter, async {
                if multi {
                    self.collection()
                        .update_many(filter.clone(), update)
                        .upsert(upsert)
                        .await
                        .map_err(Error::from)
                } else {
                    self.collection()
                        .update_one(filter.clone(), update)
                        .upsert(upsert)
                        .await
                        .map_err(Error::from)
                }
            })
            .await?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    /// Deletes matching documents, returning how many were removed.
    pub async fn remove(&self, filter: Document, multi: bool) -> Result<u64> {
        if filter.is_empty() {
            return Err(Error::Operation("cannot do empty filters".into()));
        }
        let filter = self.rewrite_filter(filter);
        let result = self
            .timed("remove", &filter, async {
                if multi {
                    self.collection()
                        .delete_many(filter.clone())
                        .await
                        .map_err(Error::from)
                } else {
                    self.collection()
                        .delete_one(filter.clone())
                        .await
                        .map_err(Error::from)
                }
            })
            .await?;
        Ok(result.deleted_count)
    }

    /// Atomic read-modify-write of a single document.
    pub async fn find_and_modify(
        &self,
        filter: Document,
        update: Option<Document>,
        options: FindAndModifyOptions,
    ) -> Result<Option<Record>> {
        if update.is_none() && !options.remove {
            return Err(Error::Operation(
                "cannot have empty update and no remove flag".into(),
            ));
        }
        let filter = self.rewrite_filter(filter);

        let doc = self
            .timed("find_and_modify", &filter, async {
                if options.remove {
                    let mut query = self.collection().find_one_and_delete(filter.clone());
                    if let Some(sort) = &options.sort {
                        query = query.sort(sort.clone());
                    }
                    if let Some(projection) = &options.projection {
                        query =
                            query.projection(projection_document(self.schema(), projection));
                    }
                    query.await.map_err(Error::from)
                } else {
                    let update = self.rewrite_update(update.unwrap_or_default())?;
                    let mut query = self
                        .collection()
                        .find_one_and_update(filter.clone(), update)
                        .upsert(options.upsert)
                        .return_document(if options.return_new {
                            ReturnDocument::After
                        } else {
                            ReturnDocument::Before
                        });
                    if let Some(sort) = &options.sort {
                        query = query.sort(sort.clone());
                    }
                    if let Some(projection) = &options.projection {
                        query =
                            query.projection(projection_document(self.schema(), projection));
                    }
                    query.await.map_err(Error::from)
                }
            })
            .await?;

        doc.map(|doc| self.schema().load(doc)).transpose()
    }

    /// Applies an update document to the document backing `record` and
    /// refreshes the in-memory copy from the post-update state. Returns
    /// false when the backing document no longer exists.
    pub async fn update_record(&self, record: &mut Record, update: Document) -> Result<bool> {
        if update.is_empty() {
            return Err(Error::Operation("cannot do empty updates".into()));
        }
        let id = record
            .id()
            .ok_or_else(|| Error::Operation("cannot update a record without an id".into()))?
            .to_bson()?;

        let fresh = self
            .find_and_modify(
                doc! { "_id": id },
                Some(update),
                FindAndModifyOptions {
                    return_new: true,
                    ..FindAndModifyOptions::default()
                },
            )
            .await?;
        match fresh {
            Some(fresh) => {
                record.refresh_from(fresh);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn set(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$set": values }).await
    }

    pub async fn unset(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$unset": values }).await
    }

    pub async fn inc(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$inc": values }).await
    }

    pub async fn push(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$push": values }).await
    }

    pub async fn pull(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$pull": values }).await
    }

    pub async fn add_to_set(&self, record: &mut Record, values: Document) -> Result<bool> {
        self.update_record(record, doc! { "$addToSet": values }).await
    }

    pub async fn drop_collection(&self) -> Result<()> {
        self.collection().drop().await.map_err(Error::from)
    }
}
