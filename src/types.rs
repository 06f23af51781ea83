//! Signaling wire protocol and SFU codec table.

use mediasoup::prelude::*;
use mediasoup::sctp_parameters::SctpParameters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::{NonZeroU32, NonZeroU8};

/// The single audio codec the router advertises to publishers.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![RtpCodecCapability::Audio {
        mime_type: MimeTypeAudio::Opus,
        preferred_payload_type: None,
        clock_rate: NonZeroU32::new(48000).unwrap(),
        channels: NonZeroU8::new(2).unwrap(),
        parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
        rtcp_feedback: vec![RtcpFeedback::TransportCc],
    }]
}

/// Transport connection details handed to the client so it can establish the
/// WebRTC transport on its side.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
}

/// One inbound signaling message: `{action, data?, requestId?}`.
#[derive(Debug, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// The closed set of client actions, dispatched from a single decode site.
/// Anything not listed lands on `Unknown` and is answered with
/// `unknown_action`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    SetRole { role: String },
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    StartEgress { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    StopEgress { producer_id: ProducerId },
    #[serde(other)]
    Unknown,
}

/// Successful reply correlated to a request.
pub fn ok_reply(request_id: &Option<String>, data: Value) -> Value {
    serde_json::json!({"requestId": request_id, "ok": true, "data": data})
}

/// Failed reply correlated to a request.
pub fn err_reply(request_id: &Option<String>, error: &str) -> Value {
    serde_json::json!({"requestId": request_id, "ok": false, "error": error})
}

/// First server event on a fresh connection.
pub fn welcome_event(peer_id: &str) -> Value {
    serde_json::json!({"type": "welcome", "id": peer_id})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_decodes_with_request_id() {
        let request: ClientRequest = serde_json::from_str(
            r#"{"action":"joinRoom","data":{"roomId":"room-1"},"requestId":"42"}"#,
        )
        .unwrap();
        assert_eq!(request.request_id.as_deref(), Some("42"));
        match request.command {
            ClientCommand::JoinRoom { room_id } => assert_eq!(room_id, "room-1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn dataless_actions_decode_without_data() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"action":"getRouterRtpCapabilities","requestId":"1"}"#)
                .unwrap();
        assert!(matches!(
            request.command,
            ClientCommand::GetRouterRtpCapabilities
        ));

        let request: ClientRequest =
            serde_json::from_str(r#"{"action":"createWebRtcTransport"}"#).unwrap();
        assert!(request.request_id.is_none());
        assert!(matches!(
            request.command,
            ClientCommand::CreateWebRtcTransport
        ));
    }

    #[test]
    fn set_role_decodes() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"action":"setRole","data":{"role":"seller"}}"#).unwrap();
        match request.command {
            ClientCommand::SetRole { role } => assert_eq!(role, "seller"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn egress_actions_decode_producer_ids() {
        let request: ClientRequest = serde_json::from_str(
            r#"{"action":"startEgress","data":{"producerId":"11111111-2222-3333-4444-555555555555"},"requestId":"7"}"#,
        )
        .unwrap();
        assert!(matches!(request.command, ClientCommand::StartEgress { .. }));

        let request: ClientRequest = serde_json::from_str(
            r#"{"action":"stopEgress","data":{"producerId":"11111111-2222-3333-4444-555555555555"}}"#,
        )
        .unwrap();
        assert!(matches!(request.command, ClientCommand::StopEgress { .. }));
    }

    #[test]
    fn unrecognized_action_maps_to_unknown() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"action":"flyToTheMoon","requestId":"9"}"#).unwrap();
        assert_eq!(request.request_id.as_deref(), Some("9"));
        assert!(matches!(request.command, ClientCommand::Unknown));
    }

    #[test]
    fn reply_envelopes_carry_correlation_and_outcome() {
        let ok = ok_reply(&Some("5".to_string()), serde_json::json!({"roomId": "r"}));
        assert_eq!(ok["requestId"], "5");
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["data"]["roomId"], "r");

        let err = err_reply(&None, "unknown_action");
        assert_eq!(err["requestId"], serde_json::Value::Null);
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "unknown_action");
    }

    #[test]
    fn welcome_event_has_no_request_id() {
        let event = welcome_event("peer-1");
        assert_eq!(event["type"], "welcome");
        assert_eq!(event["id"], "peer-1");
        assert!(event.get("requestId").is_none());
    }

    #[test]
    fn router_codec_table_is_opus_only() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 1);
        match &codecs[0] {
            RtpCodecCapability::Audio {
                mime_type,
                clock_rate,
                channels,
                ..
            } => {
                assert_eq!(*mime_type, MimeTypeAudio::Opus);
                assert_eq!(clock_rate.get(), 48000);
                assert_eq!(channels.get(), 2);
            }
            other => panic!("unexpected codec: {other:?}"),
        }
    }
}
