use super::{DEFAULT_MAX_TIME, FIND_WARNING_DOCS_LIMIT, Repo, projection_document};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::retry::with_retry;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use mongodb::bson::{Bson, Document, doc, oid::ObjectId};
use std::sync::Arc;
use std::time::Duration;

/// Options shared by the query operations. Zero values mean "no bound";
/// an unset `max_time` falls back to [`DEFAULT_MAX_TIME`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Vec<String>>,
    pub skip: u64,
    pub limit: i64,
    pub sort: Option<Document>,
    pub batch_size: Option<u32>,
    pub max_time: Option<Duration>,
}

impl Repo {
    /// Runs a query and materializes every matching record. Transient
    /// connection failures are retried; result sets beyond
    /// [`FIND_WARNING_DOCS_LIMIT`] log a warning suggesting `find_iter`.
    pub async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Record>> {
        let filter = self.rewrite_filter(filter);
        let filter = &filter;
        let options = &options;
        with_retry("find", move || async move {
            let docs = self.find_raw(filter, options).await?;
            if docs.len() > FIND_WARNING_DOCS_LIMIT {
                tracing::warn!(
                    collection = self.collection().name(),
                    docs = docs.len(),
                    "returned more than {FIND_WARNING_DOCS_LIMIT} docs in one find, \
                     consider find_iter"
                );
            }
            docs.into_iter()
                .map(|doc| self.schema().load(doc))
                .collect()
        })
        .await
    }

    pub async fn find_one(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Option<Record>> {
        let filter = self.rewrite_filter(filter);
        let filter = &filter;
        let options = &options;
        with_retry("find_one", move || async move {
            let max_time = options.max_time.unwrap_or(DEFAULT_MAX_TIME);
            self.check_read_max_time("find_one", max_time);

            let mut query = self
                .collection()
                .find_one(filter.clone())
                .max_time(max_time);
            if let Some(projection) = &options.projection {
                query = query.projection(projection_document(self.schema(), projection));
            }
            if let Some(sort) = &options.sort {
                query = query.sort(sort.clone());
            }

            let doc = self
                .timed("find_one", filter, async { query.await.map_err(Error::from) })
                .await?;
            doc.map(|doc| self.schema().load(doc)).transpose()
        })
        .await
    }

    /// Streaming variant of `find` for result sets too large to hold in
    /// memory. The stream owns its cursor; no retry applies once it is open.
    pub async fn find_iter(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<BoxStream<'static, Result<Record>>> {
        let filter = self.rewrite_filter(filter);
        let cursor = self
            .timed("find", &filter, async {
                self.find_query(&filter, &options).await
            })
            .await?;

        let schema = Arc::clone(self.schema());
        Ok(cursor
            .map_err(Error::from)
            .and_then(move |doc| {
                let schema = Arc::clone(&schema);
                async move { schema.load(doc) }
            })
            .boxed())
    }

    pub async fn count(&self, filter: Document, options: FindOptions) -> Result<u64> {
        let filter = self.rewrite_filter(filter);
        let filter = &filter;
        let options = &options;
        with_retry("count", move || async move {
            let max_time = options.max_time.unwrap_or(DEFAULT_MAX_TIME);
            self.check_read_max_time("count", max_time);

            let mut query = self
                .collection()
                .count_documents(filter.clone())
                .max_time(max_time);
            if options.skip > 0 {
                query = query.skip(options.skip);
            }
            if options.limit > 0 {
                query = query.limit(u64::try_from(options.limit).unwrap_or(u64::MAX));
            }

            self.timed("count", filter, async { query.await.map_err(Error::from) })
                .await
        })
        .await
    }

    /// Distinct wire values of one field across the matching documents.
    pub async fn distinct(&self, key: &str, filter: Document) -> Result<Vec<Bson>> {
        let filter = self.rewrite_filter(filter);
        let key = self.schema().wire_path(key);
        let filter = &filter;
        let key = &key;
        with_retry("distinct", move || async move {
            self.timed("distinct", filter, async {
                self.collection()
                    .distinct(key, filter.clone())
                    .await
                    .map_err(Error::from)
            })
            .await
        })
        .await
    }

    pub async fn by_id(&self, id: ObjectId) -> Result<Option<Record>> {
        self.find_one(doc! { "_id": id }, FindOptions::default())
            .await
    }

    pub async fn by_ids(&self, ids: &[ObjectId]) -> Result<Vec<Record>> {
        self.find(
            doc! { "_id": { "$in": ids.to_vec() } },
            FindOptions::default(),
        )
        .await
    }

    /// Re-fetches a record's document and overwrites the in-memory copy,
    /// clearing its dirty state. Returns false when the document is gone.
    pub async fn reload(&self, record: &mut Record) -> Result<bool> {
        let id = record
            .id()
            .ok_or_else(|| Error::Operation("cannot reload a record without an id".into()))?
            .to_bson()?;
        match self
            .find_one(doc! { "_id": id }, FindOptions::default())
            .await?
        {
            Some(fresh) => {
                record.refresh_from(fresh);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Raw aggregation; output documents are returned as-is since pipeline
    /// stages routinely reshape them out of the record schema.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self
            .collection()
            .aggregate(pipeline)
            .await
            .map_err(Error::from)?;
        cursor.try_collect().await.map_err(Error::from)
    }

    async fn find_raw(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        self.timed("find", filter, async {
            let cursor = self.find_query(filter, options).await?;
            cursor.try_collect().await.map_err(Error::from)
        })
        .await
    }

    async fn find_query(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<mongodb::Cursor<Document>> {
        let max_time = options.max_time.unwrap_or(DEFAULT_MAX_TIME);
        self.check_read_max_time("find", max_time);

        let mut query = self.collection().find(filter.clone()).max_time(max_time);
        if let Some(projection) = &options.projection {
            query = query.projection(projection_document(self.schema(), projection));
        }
        if options.skip > 0 {
            query = query.skip(options.skip);
        }
        if options.limit > 0 {
            query = query.limit(options.limit);
        }
        if let Some(sort) = &options.sort {
            query = query.sort(sort.clone());
        }
        if let Some(batch_size) = options.batch_size {
            query = query.batch_size(batch_size);
        }
        query.await.map_err(Error::from)
    }
}
