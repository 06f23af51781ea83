//! WebSocket signaling endpoint.
//!
//! One actor per connected peer. Inbound messages are parsed into the typed
//! action set in one place; mediasoup calls run in background tasks and
//! deliver their results back to the actor as messages, so the actor itself
//! never blocks. Every request is answered, correlated by `requestId`.

use actix::prelude::*;
use actix_web::web::{Data, Payload};
use actix_web::{Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{info, warn};
use mediasoup::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::egress::{StartOutcome, StopOutcome};
use crate::rooms::{OutboundText, DEFAULT_ROOM};
use crate::state::AppState;
use crate::types::{
    err_reply, ok_reply, welcome_event, ClientCommand, ClientRequest, TransportOptions,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(50);

/// Correlated reply delivered back to the connection actor, usually from a
/// background task.
#[derive(Message)]
#[rtype(result = "()")]
struct Reply {
    request_id: Option<String>,
    result: Result<Value, String>,
}

/// Internal actor messages for convenience
#[derive(Message)]
#[rtype(result = "()")]
enum InternalMessage {
    /// Save a transport in the connection-specific map so it is not closed
    /// while the peer still uses it
    SaveTransport(WebRtcTransport),
    /// Drop a transport once the SFU reports it closed
    RemoveTransport(TransportId),
    /// Save a producer in the connection-specific map to prevent it from
    /// being destroyed
    SaveProducer(Producer),
    /// Stop/close the WebSocket connection
    Stop,
}

/// Actor representing one signaling connection.
pub struct SignalSession {
    peer_id: String,
    state: Data<AppState>,
    /// Transports created on this peer's request, closed on disconnect
    transports: HashMap<TransportId, WebRtcTransport>,
    /// Producers created on this peer's request, closed on disconnect
    producers: HashMap<ProducerId, Producer>,
    hb: Instant,
}

impl SignalSession {
    pub fn new(state: Data<AppState>) -> Self {
        Self {
            peer_id: Uuid::new_v4().to_string(),
            state,
            transports: HashMap::new(),
            producers: HashMap::new(),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                ctx.address().do_send(InternalMessage::Stop);
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_reply(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        request_id: &Option<String>,
        result: Result<Value, String>,
    ) {
        let envelope = match result {
            Ok(data) => ok_reply(request_id, data),
            Err(error) => err_reply(request_id, &error),
        };
        ctx.text(envelope.to_string());
    }

    fn dispatch(&mut self, request: ClientRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let request_id = request.request_id;
        match request.command {
            ClientCommand::JoinRoom { room_id } => {
                if room_id.trim().is_empty() {
                    self.send_reply(ctx, &request_id, Err("roomId required".to_string()));
                    return;
                }
                self.state.rooms.join_room(&self.peer_id, &room_id);
                info!("peer {} joined room {room_id}", self.peer_id);
                self.send_reply(
                    ctx,
                    &request_id,
                    Ok(serde_json::json!({ "roomId": room_id })),
                );
            }
            ClientCommand::SetRole { role } => {
                self.state.rooms.set_role(&self.peer_id, &role);
                self.send_reply(ctx, &request_id, Ok(serde_json::json!({ "role": role })));
            }
            ClientCommand::GetRouterRtpCapabilities => {
                let result = serde_json::to_value(self.state.router.rtp_capabilities())
                    .map_err(|err| err.to_string());
                self.send_reply(ctx, &request_id, result);
            }
            ClientCommand::CreateWebRtcTransport => {
                let address = ctx.address();
                let router = self.state.router.clone();
                let options = webrtc_transport_options(&self.state.config);
                actix::spawn(async move {
                    match router.create_webrtc_transport(options).await {
                        Ok(transport) => {
                            let transport_id = transport.id();
                            let data = serde_json::to_value(TransportOptions {
                                id: transport_id,
                                ice_parameters: transport.ice_parameters().clone(),
                                ice_candidates: transport.ice_candidates().clone(),
                                dtls_parameters: transport.dtls_parameters(),
                                sctp_parameters: transport.sctp_parameters(),
                            })
                            .map_err(|err| err.to_string());

                            // Forget the transport when the SFU closes it.
                            {
                                let address = address.clone();
                                transport
                                    .on_close(Box::new(move || {
                                        address
                                            .do_send(InternalMessage::RemoveTransport(transport_id));
                                    }))
                                    .detach();
                            }

                            address.do_send(InternalMessage::SaveTransport(transport));
                            address.do_send(Reply {
                                request_id,
                                result: data,
                            });
                        }
                        Err(error) => {
                            address.do_send(Reply {
                                request_id,
                                result: Err(format!("failed to create transport: {error}")),
                            });
                        }
                    }
                });
            }
            ClientCommand::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = match self.transports.get(&transport_id) {
                    Some(transport) => transport.clone(),
                    None => {
                        self.send_reply(ctx, &request_id, Err("transport_not_found".to_string()));
                        return;
                    }
                };
                let address = ctx.address();
                actix::spawn(async move {
                    let result = transport
                        .connect(WebRtcTransportRemoteParameters { dtls_parameters })
                        .await
                        .map(|_| serde_json::json!({}))
                        .map_err(|error| format!("failed to connect transport: {error}"));
                    address.do_send(Reply { request_id, result });
                });
            }
            ClientCommand::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let transport = match self.transports.get(&transport_id) {
                    Some(transport) => transport.clone(),
                    None => {
                        self.send_reply(ctx, &request_id, Err("transport_not_found".to_string()));
                        return;
                    }
                };
                let address = ctx.address();
                let state = self.state.clone();
                let peer_id = self.peer_id.clone();
                actix::spawn(async move {
                    match transport
                        .produce(ProducerOptions::new(kind, rtp_parameters))
                        .await
                    {
                        Ok(producer) => {
                            let producer_id = producer.id();
                            info!("{kind:?} producer created for peer {peer_id}: {producer_id}");
                            address.do_send(InternalMessage::SaveProducer(producer));
                            address.do_send(Reply {
                                request_id,
                                result: Ok(serde_json::json!({ "id": producer_id })),
                            });

                            if state.config.auto_egress && kind == MediaKind::Audio {
                                let room_id = state
                                    .rooms
                                    .room_of(&peer_id)
                                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                                let egress = state.egress.clone();
                                actix::spawn(async move {
                                    if let Err(err) =
                                        egress.start(room_id, peer_id, producer_id).await
                                    {
                                        warn!(
                                            "auto egress failed for producer {producer_id}: {err}"
                                        );
                                    }
                                });
                            }
                        }
                        Err(error) => {
                            address.do_send(Reply {
                                request_id,
                                result: Err(format!("failed to create {kind:?} producer: {error}")),
                            });
                        }
                    }
                });
            }
            ClientCommand::StartEgress { producer_id } => {
                match self.producers.get(&producer_id) {
                    None => {
                        self.send_reply(ctx, &request_id, Err("producer_not_found".to_string()));
                        return;
                    }
                    Some(producer) if producer.kind() != MediaKind::Audio => {
                        self.send_reply(ctx, &request_id, Err("producer_not_audio".to_string()));
                        return;
                    }
                    Some(_) => {}
                }
                let address = ctx.address();
                let egress = self.state.egress.clone();
                let room_id = self
                    .state
                    .rooms
                    .room_of(&self.peer_id)
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                let peer_id = self.peer_id.clone();
                actix::spawn(async move {
                    let result = match egress.start(room_id, peer_id, producer_id).await {
                        Ok(StartOutcome::Started(descriptor)) => {
                            serde_json::to_value(descriptor).map_err(|err| err.to_string())
                        }
                        Ok(StartOutcome::AlreadyRunning(Some(descriptor))) => {
                            serde_json::to_value(descriptor).map_err(|err| err.to_string())
                        }
                        Ok(StartOutcome::AlreadyRunning(None)) => Ok(serde_json::json!({
                            "ok": true,
                            "producerId": producer_id,
                            "alreadyRunning": true,
                        })),
                        Err(err) => Err(err.to_string()),
                    };
                    address.do_send(Reply { request_id, result });
                });
            }
            ClientCommand::StopEgress { producer_id } => {
                let data = match self.state.egress.stop(producer_id) {
                    StopOutcome::Stopped => serde_json::json!({
                        "ok": true,
                        "producerId": producer_id,
                    }),
                    StopOutcome::AlreadyStopped => serde_json::json!({
                        "ok": true,
                        "producerId": producer_id,
                        "alreadyStopped": true,
                    }),
                };
                self.send_reply(ctx, &request_id, Ok(data));
            }
            ClientCommand::Unknown => {
                self.send_reply(ctx, &request_id, Err("unknown_action".to_string()));
            }
        }
    }
}

impl Actor for SignalSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("signaling connection opened for peer {}", self.peer_id);
        self.state
            .rooms
            .register(&self.peer_id, ctx.address().recipient());
        self.hb(ctx);
        ctx.text(welcome_event(&self.peer_id).to_string());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let stopped = self.state.egress.stop_owned_by(&self.peer_id);
        if stopped > 0 {
            info!(
                "stopped {stopped} egress session(s) for disconnected peer {}",
                self.peer_id
            );
        }
        self.state.rooms.unregister(&self.peer_id);
        // Dropping the transport/producer maps closes them on the SFU side.
        info!("signaling connection closed for peer {}", self.peer_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SignalSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.hb = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => self.dispatch(request, ctx),
                Err(error) => {
                    warn!("failed to parse client message: {error}");
                    self.send_reply(ctx, &None, Err("bad_json".to_string()));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_reply(ctx, &None, Err("binary_unsupported".to_string()));
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

/// Server-pushed room event (welcome, insights, gate).
impl Handler<OutboundText> for SignalSession {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Reply> for SignalSession {
    type Result = ();

    fn handle(&mut self, msg: Reply, ctx: &mut Self::Context) {
        self.send_reply(ctx, &msg.request_id, msg.result);
    }
}

impl Handler<InternalMessage> for SignalSession {
    type Result = ();

    fn handle(&mut self, msg: InternalMessage, ctx: &mut Self::Context) {
        match msg {
            InternalMessage::SaveTransport(transport) => {
                self.transports.insert(transport.id(), transport);
            }
            InternalMessage::RemoveTransport(transport_id) => {
                self.transports.remove(&transport_id);
            }
            InternalMessage::SaveProducer(producer) => {
                self.producers.insert(producer.id(), producer);
            }
            InternalMessage::Stop => {
                ctx.stop();
            }
        }
    }
}

fn webrtc_transport_options(config: &crate::config::Config) -> WebRtcTransportOptions {
    WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(ListenInfo {
        protocol: Protocol::Udp,
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        announced_address: config.announced_ip.clone(),
        expose_internal_ip: false,
        port: None,
        port_range: Some(config.rtc_min_port..=config.rtc_max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    }))
}

/// Receives the HTTP request on the WebSocket route and upgrades it to the
/// signaling connection.
pub async fn ws_index(
    request: HttpRequest,
    state: Data<AppState>,
    stream: Payload,
) -> Result<HttpResponse, Error> {
    ws::start(SignalSession::new(state), &request, stream)
}
