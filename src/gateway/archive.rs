//! Durable archival of every outbound request/response tuple.
//!
//! Rows are written synchronously before the call returns to its caller;
//! nothing is batched. Key secrets never reach this layer, only
//! fingerprints, and the `serviceKey` parameter is stripped before the
//! request params are serialized.

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::providers::Provider;
use crate::repository::models::NewRawData;
use crate::repository::raw::RawDataRepository;

/// One finished call, ready for the archive.
pub struct RawCall<'a> {
    pub provider: Provider,
    pub endpoint: &'a str,
    pub params: &'a [(String, String)],
    pub status: u16,
    pub body: &'a Value,
    pub duration_ms: u64,
    pub key_hash: &'a str,
}

#[derive(Clone)]
pub struct RawArchiveWriter {
    repo: RawDataRepository,
}

impl RawArchiveWriter {
    pub fn new(repo: RawDataRepository) -> Self {
        Self { repo }
    }

    /// Write one archive row and return its id.
    ///
    /// An archive failure is logged but does not fail the call that
    /// produced it; the response is still delivered downstream.
    pub async fn archive(&self, call: RawCall<'_>) -> Option<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let params: serde_json::Map<String, Value> = call
            .params
            .iter()
            .filter(|(name, _)| name != "serviceKey")
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();

        let body_text = call.body.to_string();
        let row = NewRawData {
            id: id.clone(),
            provider: call.provider.as_str().to_string(),
            endpoint: call.endpoint.to_string(),
            method: "GET".to_string(),
            request_params: Value::Object(params).to_string(),
            response_status: call.status as i32,
            response_size: body_text.len() as i32,
            response_body: body_text,
            duration_ms: call.duration_ms as i32,
            api_key_hash: call.key_hash.to_string(),
            archive_file_path: None,
            created_at: crate::repository::format_ts(now),
            expires_at: crate::repository::format_ts(now + call.provider.raw_ttl()),
        };

        match self.repo.insert(row).await {
            Ok(()) => Some(id),
            Err(e) => {
                warn!(
                    "raw archive write failed for {} {}: {e}",
                    call.provider, call.endpoint
                );
                None
            }
        }
    }
}
