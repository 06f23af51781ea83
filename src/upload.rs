//! Compatibility path: pre-recorded audio chunks over HTTP.
//!
//! Browsers that cannot publish through the SFU POST their chunks here; the
//! chunk takes the same forward-and-broadcast trip as a live segment.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use actix_multipart::Multipart;
use actix_web::web::Data;
use actix_web::HttpResponse;
use futures_util::TryStreamExt;
use log::warn;
use uuid::Uuid;

use crate::analysis::{broadcast_verdict, AnalysisClient, ForwardFields};
use crate::rooms::{RoomRegistry, DEFAULT_ROOM};

/// `GET /health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"ok": true}))
}

struct UploadPayload {
    audio: Option<(String, Vec<u8>)>,
    fields: HashMap<String, String>,
}

/// `POST /upload-audio`
///
/// Multipart body with the file field `audio` plus optional `roomId`, `seq`,
/// `timestamp`, `clientId`, `context_hint`. The chunk is staged to a temp
/// file, forwarded to the analysis service, and the verdict is both
/// broadcast to the room and mirrored back to the uploader.
pub async fn upload_audio(
    payload: Multipart,
    analysis: Data<AnalysisClient>,
    rooms: Data<RoomRegistry>,
) -> HttpResponse {
    let parsed = match collect_upload(payload).await {
        Ok(parsed) => parsed,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "bad_multipart",
                "detail": err.to_string(),
            }));
        }
    };

    let (file_name, bytes) = match parsed.audio {
        Some(audio) => audio,
        None => {
            return HttpResponse::BadRequest().json(serde_json::json!({"error": "no_audio"}));
        }
    };

    let room_id = parsed
        .fields
        .get("roomId")
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_ROOM.to_string());
    let fields = ForwardFields {
        room_id: room_id.clone(),
        seq: parsed.fields.get("seq").cloned(),
        timestamp: parsed.fields.get("timestamp").cloned(),
        client_id: parsed.fields.get("clientId").cloned(),
        context_hint: parsed.fields.get("context_hint").cloned(),
    };

    let staged = std::env::temp_dir().join(staged_name(&file_name));
    if let Err(err) = tokio::fs::write(&staged, &bytes).await {
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "stage_failed",
            "detail": err.to_string(),
        }));
    }

    let result = analysis
        .forward_file(&staged, Some(file_name.as_str()), &fields)
        .await;
    if let Err(err) = tokio::fs::remove_file(&staged).await {
        warn!("failed to remove staged upload {}: {err}", staged.display());
    }

    match result {
        Ok(verdict) => {
            broadcast_verdict(&rooms, &room_id, &verdict);
            HttpResponse::Ok().json(verdict)
        }
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "forward_failed",
            "detail": err.to_string(),
            "python_status": err.forward_status(),
            "python_body": err.forward_body(),
        })),
    }
}

async fn collect_upload(mut payload: Multipart) -> Result<UploadPayload, actix_multipart::MultipartError> {
    let mut audio = None;
    let mut fields = HashMap::new();
    while let Some(mut field) = payload.try_next().await? {
        let disposition = field.content_disposition();
        let name = disposition.get_name().unwrap_or_default().to_string();
        let file_name = disposition.get_filename().map(str::to_string);
        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            data.extend_from_slice(&chunk);
        }
        if name == "audio" {
            audio = Some((file_name.unwrap_or_else(|| "audio.webm".to_string()), data));
        } else if !name.is_empty() {
            fields.insert(name, String::from_utf8_lossy(&data).into_owned());
        }
    }
    Ok(UploadPayload { audio, fields })
}

/// Temp file name for a staged chunk. Only the extension of the client's
/// filename is kept; the rest could contain path separators.
fn staged_name(file_name: &str) -> String {
    let extension = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("bin");
    format!("upload_{}.{extension}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_name_keeps_only_the_extension() {
        let name = staged_name("../../etc/passwd.webm");
        assert!(name.starts_with("upload_"));
        assert!(name.ends_with(".webm"));
        assert!(!name.contains('/'));

        assert!(staged_name("blob").ends_with(".bin"));
    }
}
