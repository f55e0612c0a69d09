use crate::error::CrawlError;
use crate::models::TranscriptDocument;
use crate::services::elasticsearch_service::TRANSCRIPTS_INDEX;
use async_trait::async_trait;
use elasticsearch::{Elasticsearch, GetParts, IndexParts};
use log::{debug, info};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// Existing document carried the same checksum; nothing was written.
    Unchanged,
}

/// Storage behind the index writer, injectable for tests.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Checksum of the stored document with this id, if any.
    async fn stored_checksum(&self, doc_id: &str) -> Result<Option<String>, CrawlError>;
    async fn put(&self, doc_id: &str, document: &TranscriptDocument) -> Result<(), CrawlError>;
}

pub struct EsDocumentStore {
    es_client: Elasticsearch,
}

impl EsDocumentStore {
    pub fn new(es_client: Elasticsearch) -> Self {
        EsDocumentStore { es_client }
    }
}

#[async_trait]
impl DocumentStore for EsDocumentStore {
    async fn stored_checksum(&self, doc_id: &str) -> Result<Option<String>, CrawlError> {
        let response = self
            .es_client
            .get(GetParts::IndexId(TRANSCRIPTS_INDEX, doc_id))
            ._source_includes(&["checksum"])
            .send()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("lookup {doc_id}: {e}")))?;

        if response.status_code() == 404 {
            return Ok(None);
        }
        if !response.status_code().is_success() {
            return Err(CrawlError::IndexWrite(format!(
                "lookup {doc_id} failed with status {}",
                response.status_code()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("lookup {doc_id} body: {e}")))?;
        Ok(body["_source"]["checksum"].as_str().map(String::from))
    }

    async fn put(&self, doc_id: &str, document: &TranscriptDocument) -> Result<(), CrawlError> {
        let response = self
            .es_client
            .index(IndexParts::IndexId(TRANSCRIPTS_INDEX, doc_id))
            .body(json!(document))
            .send()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("index {doc_id}: {e}")))?;

        if !response.status_code().is_success() {
            return Err(CrawlError::IndexWrite(format!(
                "index {doc_id} failed with status {}",
                response.status_code()
            )));
        }
        Ok(())
    }
}

/// Sole writer of transcript documents. Upserts are keyed by
/// (video id, language); a matching checksum makes re-delivery a no-op, so
/// the scheduler's at-least-once retries are safe.
pub struct IndexWriter {
    store: Arc<dyn DocumentStore>,
}

impl IndexWriter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        IndexWriter { store }
    }

    pub async fn upsert(
        &self,
        document: &TranscriptDocument,
    ) -> Result<UpsertOutcome, CrawlError> {
        let doc_id = document.doc_id();

        if let Some(existing) = self.store.stored_checksum(&doc_id).await? {
            if existing == document.checksum {
                debug!("Transcript {doc_id} unchanged (checksum match), skipping write");
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        self.store.put(&doc_id, document).await?;
        info!(
            "Indexed transcript {doc_id} ({} segments)",
            document.segments.len()
        );
        Ok(UpsertOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaptionSegment;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub struct MemDocumentStore {
        pub docs: Mutex<HashMap<String, TranscriptDocument>>,
        pub writes: AtomicU32,
    }

    impl MemDocumentStore {
        pub fn new() -> Self {
            MemDocumentStore {
                docs: Mutex::new(HashMap::new()),
                writes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for MemDocumentStore {
        async fn stored_checksum(&self, doc_id: &str) -> Result<Option<String>, CrawlError> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .get(doc_id)
                .map(|d| d.checksum.clone()))
        }

        async fn put(
            &self,
            doc_id: &str,
            document: &TranscriptDocument,
        ) -> Result<(), CrawlError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.docs
                .lock()
                .unwrap()
                .insert(doc_id.to_string(), document.clone());
            Ok(())
        }
    }

    fn doc(video_id: &str, text: &str) -> TranscriptDocument {
        TranscriptDocument::new(
            video_id,
            "en",
            0,
            vec![CaptionSegment {
                start: 0.0,
                duration: 2.0,
                text: text.to_string(),
            }],
        )
    }

    #[tokio::test]
    async fn repeated_upsert_with_same_checksum_is_a_noop() {
        let store = Arc::new(MemDocumentStore::new());
        let writer = IndexWriter::new(store.clone());
        let document = doc("vid-1", "hello");

        assert_eq!(
            writer.upsert(&document).await.unwrap(),
            UpsertOutcome::Written
        );
        assert_eq!(
            writer.upsert(&document).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_content_overwrites() {
        let store = Arc::new(MemDocumentStore::new());
        let writer = IndexWriter::new(store.clone());

        writer.upsert(&doc("vid-1", "hello")).await.unwrap();
        writer.upsert(&doc("vid-1", "edited")).await.unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);

        let docs = store.docs.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["vid-1_en"].segments[0].text, "edited");
    }
}
