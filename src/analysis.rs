//! Client for the downstream speech-analysis service.
//!
//! Audio (a spool segment or a staged browser chunk) is POSTed as
//! multipart/form-data; the JSON verdict comes back whole so unknown fields
//! survive the trip. Verdict-to-broadcast shaping lives here too.

use std::path::Path;

use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::rooms::RoomRegistry;

/// Cap on upstream body text carried inside forward errors.
const BODY_SNIPPET_MAX: usize = 300;

/// String fields accompanying one audio upload.
#[derive(Debug, Clone, Default)]
pub struct ForwardFields {
    pub room_id: String,
    pub seq: Option<String>,
    pub timestamp: Option<String>,
    pub client_id: Option<String>,
    pub context_hint: Option<String>,
}

pub struct AnalysisClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AnalysisClient {
    pub fn new(endpoint: String, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { http, endpoint }
    }

    /// Forward a file from disk. The multipart file name defaults to the
    /// on-disk name when no override is given.
    pub async fn forward_file(
        &self,
        path: &Path,
        file_name: Option<&str>,
        fields: &ForwardFields,
    ) -> Result<Value> {
        let bytes = tokio::fs::read(path).await?;
        let name = file_name
            .map(str::to_string)
            .or_else(|| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "audio.wav".to_string());
        self.forward_bytes(bytes, name, fields).await
    }

    /// Forward an in-memory audio payload.
    pub async fn forward_bytes(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        fields: &ForwardFields,
    ) -> Result<Value> {
        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(mime_for(&file_name))
            .map_err(|err| BridgeError::Forward {
                status: None,
                body: err.to_string(),
            })?;

        let mut form = Form::new()
            .part("audio", part)
            .text("roomId", fields.room_id.clone());
        if let Some(seq) = &fields.seq {
            form = form.text("seq", seq.clone());
        }
        if let Some(timestamp) = &fields.timestamp {
            form = form.text("timestamp", timestamp.clone());
        }
        if let Some(client_id) = &fields.client_id {
            form = form.text("clientId", client_id.clone());
        }
        if let Some(hint) = &fields.context_hint {
            form = form.text("context_hint", hint.clone());
        }

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|err| BridgeError::Forward {
                status: err.status().map(|status| status.as_u16()),
                body: snippet(&err.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Forward {
                status: Some(status.as_u16()),
                body: snippet(&body),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| BridgeError::Forward {
                status: Some(status.as_u16()),
                body: snippet(&err.to_string()),
            })
    }
}

/// Shape the room event for a verdict: `"insights"` when the verdict carries
/// any new insights, `"gate"` otherwise.
pub fn verdict_event(room_id: &str, verdict: &Value) -> Value {
    let insights = verdict.get("new_insights").and_then(Value::as_array);
    let has_insights = insights.map(|list| !list.is_empty()).unwrap_or(false);

    let mut payload = serde_json::json!({
        "type": if has_insights { "insights" } else { "gate" },
        "roomId": room_id,
        "chunk_id": verdict.get("chunk_id").cloned().unwrap_or(Value::Null),
        "gate": verdict.get("gate").cloned().unwrap_or(Value::Null),
        "memory_state": verdict.get("memory_state").cloned().unwrap_or(Value::Null),
        "received_at": verdict.pointer("/meta/received_at").cloned().unwrap_or(Value::Null),
    });
    if has_insights {
        payload["new_insights"] = Value::Array(insights.unwrap().clone());
    }
    payload
}

/// Fan a verdict out to every peer in the room.
pub fn broadcast_verdict(rooms: &RoomRegistry, room_id: &str, verdict: &Value) {
    rooms.broadcast(room_id, &verdict_event(room_id, verdict));
}

fn mime_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".wav") {
        "audio/wav"
    } else if lower.ends_with(".webm") {
        "audio/webm"
    } else if lower.ends_with(".ogg") {
        "audio/ogg"
    } else {
        "application/octet-stream"
    }
}

fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_MAX {
        body.to_string()
    } else {
        let mut cut = BODY_SNIPPET_MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body[..cut].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gate_event_when_no_insights() {
        let verdict = json!({
            "chunk_id": "c1",
            "gate": {"v": 0},
            "new_insights": [],
            "memory_state": null,
            "meta": {"received_at": "2026-01-01T00:00:00Z"},
        });
        let event = verdict_event("room-1", &verdict);
        assert_eq!(event["type"], "gate");
        assert_eq!(event["roomId"], "room-1");
        assert_eq!(event["chunk_id"], "c1");
        assert_eq!(event["gate"], json!({"v": 0}));
        assert_eq!(event["received_at"], "2026-01-01T00:00:00Z");
        assert!(event.get("new_insights").is_none());
    }

    #[test]
    fn insights_event_when_insights_present() {
        let verdict = json!({
            "chunk_id": "c2",
            "gate": null,
            "new_insights": [{"type": "insight", "text": "x"}],
            "memory_state": {"deal": {"stage": "discovery"}},
        });
        let event = verdict_event("room-1", &verdict);
        assert_eq!(event["type"], "insights");
        assert_eq!(event["new_insights"], json!([{"type": "insight", "text": "x"}]));
        assert_eq!(event["memory_state"], json!({"deal": {"stage": "discovery"}}));
        assert_eq!(event["received_at"], Value::Null);
    }

    #[test]
    fn missing_verdict_fields_become_null() {
        let event = verdict_event("room-1", &json!({}));
        assert_eq!(event["type"], "gate");
        assert_eq!(event["chunk_id"], Value::Null);
        assert_eq!(event["gate"], Value::Null);
        assert_eq!(event["memory_state"], Value::Null);
    }

    #[test]
    fn mime_is_derived_from_extension() {
        assert_eq!(mime_for("seg_00000.wav"), "audio/wav");
        assert_eq!(mime_for("chunk.WEBM"), "audio/webm");
        assert_eq!(mime_for("chunk.ogg"), "audio/ogg");
        assert_eq!(mime_for("blob"), "application/octet-stream");
    }

    #[test]
    fn snippet_is_bounded() {
        let long = "x".repeat(1000);
        assert_eq!(snippet(&long).len(), BODY_SNIPPET_MAX);
        assert_eq!(snippet("short"), "short");
    }
}
