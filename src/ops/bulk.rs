use super::Repo;
use crate::error::{Error, Result};
use crate::record::Record;
use mongodb::bson::{Document, doc, oid::ObjectId};
use std::future::Future;

#[derive(Debug)]
enum BulkOp {
    InsertOne(Document),
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    DeleteOne(Document),
    DeleteMany(Document),
}

/// A batch of queued write operations against one collection.
///
/// Operations are validated and rewritten as they are queued, then executed
/// by [`execute`](Self::execute). An ordered batch stops at the first
/// failure; an unordered batch attempts every operation. Either way a
/// failure surfaces as [`Error::BulkOperation`] carrying the zero-based
/// positions of the failing operations.
#[derive(Debug)]
pub struct BulkContext<'a> {
    repo: &'a Repo,
    ordered: bool,
    ops: Vec<BulkOp>,
}

impl Repo {
    pub fn bulk(&self, ordered: bool) -> BulkContext<'_> {
        BulkContext {
            repo: self,
            ordered,
            ops: Vec::new(),
        }
    }

    async fn apply_bulk_op(&self, op: BulkOp) -> Result<()> {
        match op {
            BulkOp::InsertOne(doc) => {
                self.collection().insert_one(doc).await.map_err(Error::from)?;
            }
            BulkOp::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                self.collection()
                    .update_one(filter, update)
                    .upsert(upsert)
                    .await
                    .map_err(Error::from)?;
            }
            BulkOp::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                self.collection()
                    .update_many(filter, update)
                    .upsert(upsert)
                    .await
                    .map_err(Error::from)?;
            }
            BulkOp::DeleteOne(filter) => {
                self.collection()
                    .delete_one(filter)
                    .await
                    .map_err(Error::from)?;
            }
            BulkOp::DeleteMany(filter) => {
                self.collection()
                    .delete_many(filter)
                    .await
                    .map_err(Error::from)?;
            }
        }
        Ok(())
    }
}

impl BulkContext<'_> {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn update(
        &mut self,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Result<()> {
        if update.is_empty() {
            return Err(Error::Operation("cannot do empty updates".into()));
        }
        if filter.is_empty() {
            return Err(Error::Operation("cannot do empty filters".into()));
        }
        let filter = self.repo.rewrite_filter(filter);
        let update = self.repo.rewrite_update(update)?;
        self.ops.push(if multi {
            BulkOp::UpdateMany {
                filter,
                update,
                upsert,
            }
        } else {
            BulkOp::UpdateOne {
                filter,
                update,
                upsert,
            }
        });
        Ok(())
    }

    pub fn remove(&mut self, filter: Document, multi: bool) -> Result<()> {
        if filter.is_empty() {
            return Err(Error::Operation("cannot do empty filters".into()));
        }
        let filter = self.repo.rewrite_filter(filter);
        self.ops.push(if multi {
            BulkOp::DeleteMany(filter)
        } else {
            BulkOp::DeleteOne(filter)
        });
        Ok(())
    }

    /// Queues an insert for a record, validating it now. A record without an
    /// identity gets one generated here, so the caller knows the id before
    /// the batch runs; the in-memory record is left untouched.
    pub fn save(&mut self, record: &mut Record) -> Result<ObjectId> {
        record.validate()?;
        let mut doc = record.to_wire(None)?;
        let id = match doc.get_object_id("_id") {
            Ok(id) => id,
            Err(_) => {
                let id = ObjectId::new();
                doc.insert("_id", id);
                id
            }
        };
        self.ops.push(BulkOp::InsertOne(doc));
        Ok(id)
    }

    /// Queues an update against the document backing `record`.
    pub fn update_record(&mut self, record: &Record, update: Document) -> Result<()> {
        let id = record
            .id()
            .ok_or_else(|| Error::Operation("cannot update a record without an id".into()))?
            .to_bson()?;
        self.update(doc! { "_id": id }, update, false, false)
    }

    pub fn set(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$set": values })
    }

    pub fn unset(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$unset": values })
    }

    pub fn inc(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$inc": values })
    }

    pub fn push(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$push": values })
    }

    pub fn pull(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$pull": values })
    }

    pub fn add_to_set(&mut self, record: &Record, values: Document) -> Result<()> {
        self.update_record(record, doc! { "$addToSet": values })
    }

    /// Runs the batch. An empty batch is a no-op.
    pub async fn execute(self) -> Result<()> {
        let repo = self.repo;
        self.execute_with(move |op| repo.apply_bulk_op(op)).await
    }

    async fn execute_with<F, Fut>(self, mut apply: F) -> Result<()>
    where
        F: FnMut(BulkOp) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ordered = self.ordered;
        let mut failures = Vec::new();

        for (index, op) in self.ops.into_iter().enumerate() {
            if let Err(err) = apply(op).await {
                failures.push((index, err.to_string()));
                if ordered {
                    break;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::BulkOperation { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldDescriptor, FieldKind};
    use crate::schema::Schema;
    use mongodb::Client;
    use std::sync::{Arc, OnceLock};

    fn repo() -> Repo {
        static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
        let schema = SCHEMA
            .get_or_init(|| {
                Schema::document("BulkQueueTest")
                    .collection("bulk_queue_test")
                    .field(FieldDescriptor::new("name", FieldKind::string()).required())
                    .register()
                    .unwrap()
            })
            .clone();
        // lazy client: nothing connects until an op actually runs
        let options = mongodb::options::ClientOptions::builder()
            .hosts(vec![mongodb::options::ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: Some(27017),
            }])
            .build();
        let client = Client::with_options(options).unwrap();
        Repo::new(&client.database("remora_test"), &schema).unwrap()
    }

    #[tokio::test]
    async fn queueing_validates_eagerly() {
        let repo = repo();
        let mut bulk = repo.bulk(true);

        assert!(bulk.update(doc! { "name": "x" }, doc! {}, false, false).is_err());
        assert!(bulk.update(doc! {}, doc! { "$set": { "name": "y" } }, false, false).is_err());
        assert!(bulk.remove(doc! {}, true).is_err());
        assert!(bulk.is_empty());

        bulk.update(
            doc! { "name": "x" },
            doc! { "$set": { "name": "y" } },
            false,
            false,
        )
        .unwrap();
        assert_eq!(bulk.len(), 1);
    }

    #[tokio::test]
    async fn bulk_save_assigns_an_id_and_validates() {
        let repo = repo();
        let mut bulk = repo.bulk(true);

        let mut invalid = repo.schema().new_record(doc! {}).unwrap();
        assert!(bulk.save(&mut invalid).is_err());

        let mut record = repo.schema().new_record(doc! { "name": "x" }).unwrap();
        let id = bulk.save(&mut record).unwrap();
        assert_eq!(bulk.len(), 1);
        // the queued document carries the id; the record itself is untouched
        assert!(record.id().is_none());
        assert!(!id.to_hex().is_empty());
    }

    fn queue_of_three(repo: &Repo, ordered: bool) -> BulkContext<'_> {
        let mut bulk = repo.bulk(ordered);
        for name in ["a", "b", "c"] {
            bulk.update(
                doc! { "name": name },
                doc! { "$set": { "name": "z" } },
                false,
                false,
            )
            .unwrap();
        }
        bulk
    }

    fn failing_on<'a>(
        indices: &'static [usize],
        applied: &'a mut usize,
    ) -> impl FnMut(BulkOp) -> std::future::Ready<Result<()>> + 'a {
        move |_op| {
            let index = *applied;
            *applied += 1;
            std::future::ready(if indices.contains(&index) {
                Err(Error::Operation("write failed".into()))
            } else {
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn ordered_batches_stop_at_the_first_failure() {
        let repo = repo();
        let bulk = queue_of_three(&repo, true);

        let mut applied = 0;
        let err = bulk
            .execute_with(failing_on(&[1], &mut applied))
            .await
            .unwrap_err();

        // op 2 failed, op 3 was never attempted
        assert_eq!(applied, 2);
        match err {
            Error::BulkOperation { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unordered_batches_attempt_every_op_and_collect_failures() {
        let repo = repo();
        let bulk = queue_of_three(&repo, false);

        let mut applied = 0;
        let err = bulk
            .execute_with(failing_on(&[0, 2], &mut applied))
            .await
            .unwrap_err();

        assert_eq!(applied, 3);
        match err {
            Error::BulkOperation { failures } => {
                let indices: Vec<usize> = failures.iter().map(|(i, _)| *i).collect();
                assert_eq!(indices, [0, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let repo = repo();
        let mut applied = 0;
        repo.bulk(true)
            .execute_with(failing_on(&[], &mut applied))
            .await
            .unwrap();
        assert_eq!(applied, 0);
    }

    #[tokio::test]
    async fn record_updates_require_an_id() {
        let repo = repo();
        let mut bulk = repo.bulk(true);
        let record = repo.schema().new_record(doc! { "name": "x" }).unwrap();
        assert!(bulk.set(&record, doc! { "name": "y" }).is_err());
    }
}
