use elasticsearch::{indices::IndicesCreateParts, CountParts, Elasticsearch};
use log::{error, info};
use serde_json::{json, Value};

pub const TRANSCRIPTS_INDEX: &str = "youtube_transcripts";
pub const VIDEOS_INDEX: &str = "youtube_videos";
pub const JOBS_INDEX: &str = "crawl_jobs";

async fn create_index(es_client: &Elasticsearch, index: &str, mappings: Value) {
    match es_client
        .indices()
        .create(IndicesCreateParts::Index(index))
        .body(json!({ "mappings": mappings }))
        .send()
        .await
    {
        Ok(response) => {
            if response.status_code().is_success() {
                info!("Elasticsearch index '{index}' created or already exists.");
            } else {
                let response_text = response.text().await.unwrap_or_default();
                if response_text.contains("resource_already_exists_exception") {
                    info!("Elasticsearch index '{index}' already exists.");
                } else {
                    error!("Failed to create Elasticsearch index '{index}': {response_text}");
                }
            }
        }
        Err(e) => {
            error!("Failed to connect to Elasticsearch to create index '{index}': {e:?}");
        }
    }
}

pub async fn create_es_indices(es_client: &Elasticsearch) {
    create_index(
        es_client,
        TRANSCRIPTS_INDEX,
        json!({
            "properties": {
                "video_id": { "type": "keyword" },
                "language": { "type": "keyword" },
                "priority_rank": { "type": "integer" },
                "checksum": { "type": "keyword" },
                "indexed_at": { "type": "date", "format": "epoch_second" },
                "segments": {
                    "properties": {
                        "start": { "type": "float" },
                        "duration": { "type": "float" },
                        "text": { "type": "text" }
                    }
                }
            }
        }),
    )
    .await;

    create_index(
        es_client,
        VIDEOS_INDEX,
        json!({
            "properties": {
                "video_id": { "type": "keyword" },
                "title": { "type": "text" },
                "channel_id": { "type": "keyword" },
                "channel_name": { "type": "keyword" },
                "discovered_at": { "type": "date", "format": "epoch_second" },
                "last_crawl": { "type": "date", "format": "epoch_second" }
            }
        }),
    )
    .await;

    create_index(
        es_client,
        JOBS_INDEX,
        json!({
            "properties": {
                "id": { "type": "keyword" },
                "video_id": { "type": "keyword" },
                "state": { "type": "keyword" },
                "attempts": { "type": "integer" },
                "next_run": { "type": "date", "format": "epoch_second" },
                "created_at": { "type": "date", "format": "epoch_second" },
                "finished_at": { "type": "date", "format": "epoch_second" },
                "priority": { "type": "keyword" },
                "last_error": { "type": "keyword" }
            }
        }),
    )
    .await;
}

pub async fn get_index_count(es_client: &Elasticsearch, index: &str) -> i64 {
    match es_client.count(CountParts::Index(&[index])).send().await {
        Ok(response) => {
            let body = response.json::<Value>().await.unwrap_or_default();
            body["count"].as_i64().unwrap_or(0)
        }
        Err(e) => {
            error!("Failed to get count for index {index}: {e:?}");
            0
        }
    }
}
