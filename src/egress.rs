//! Per-publisher egress lifecycle.
//!
//! One session per audio producer: a plain RTP receiver pushes the
//! publisher's Opus feed to a loopback port where the transcode pipeline
//! picks it up, and a spool poller forwards each finalized WAV segment to
//! the analysis service. Provisioning is retried with a bounded budget
//! because the allocated UDP ports are advisory and can be lost to a race.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use mediasoup::prelude::*;
use serde::Serialize;

use crate::analysis::{broadcast_verdict, AnalysisClient, ForwardFields};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::pipeline::{self, PipelineHandle, PipelineSpec};
use crate::ports::allocate_udp_port;
use crate::rooms::{PeerId, RoomId, RoomRegistry};
use crate::spool::{self, SegmentPoller};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Used when the consumer reports no negotiated audio codec.
const FALLBACK_PAYLOAD_TYPE: u8 = 111;
const FALLBACK_CLOCK_RATE: u32 = 48000;
const FALLBACK_CHANNELS: u8 = 2;

/// What a successful `startEgress` returns to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressDescriptor {
    pub ok: bool,
    pub producer_id: ProducerId,
    pub room_id: RoomId,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub wav_prefix: String,
    pub chunk_seconds: u64,
    pub engine: &'static str,
    pub payload_type: u8,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_running: Option<bool>,
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(EgressDescriptor),
    /// A session for this producer already exists (or is being provisioned);
    /// the descriptor is available once the session is running.
    AlreadyRunning(Option<EgressDescriptor>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Live resources owned by one session, in acquisition order (the plain
/// receiver first, the poller last).
struct EgressSession {
    descriptor: EgressDescriptor,
    poller: SegmentPoller,
    pipeline: PipelineHandle,
    consumer: Consumer,
    transport: PlainTransport,
}

pub struct EgressManager {
    config: Arc<Config>,
    router: Router,
    rooms: Arc<RoomRegistry>,
    analysis: Arc<AnalysisClient>,
    sessions: SessionTable<ProducerId, EgressSession>,
}

impl EgressManager {
    pub fn new(
        config: Arc<Config>,
        router: Router,
        rooms: Arc<RoomRegistry>,
        analysis: Arc<AnalysisClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            rooms,
            analysis,
            sessions: SessionTable::new(),
        })
    }

    /// Provision an egress session for `producer_id`, retrying transient
    /// failures up to the configured budget. A second start for the same
    /// producer is a successful no-op.
    pub async fn start(
        self: Arc<Self>,
        room_id: RoomId,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<StartOutcome> {
        let token = match self.sessions.try_reserve(producer_id, &peer_id) {
            Some(token) => token,
            None => {
                let descriptor = self.sessions.peek_running(&producer_id, |session| {
                    let mut descriptor = session.descriptor.clone();
                    descriptor.already_running = Some(true);
                    descriptor
                });
                return Ok(StartOutcome::AlreadyRunning(descriptor));
            }
        };

        let role = self
            .rooms
            .role_of(&peer_id)
            .unwrap_or_else(|| "unknown".to_string());
        let weak = Arc::downgrade(&self);
        let retries = self.config.max_egress_port_retries.max(1);
        let mut last_error: Option<BridgeError> = None;

        for attempt in 1..=retries {
            match self
                .provision(&weak, &room_id, &peer_id, &role, producer_id, attempt)
                .await
            {
                Ok(session) => {
                    let descriptor = session.descriptor.clone();
                    match self.sessions.commit(&producer_id, token, session) {
                        Ok(()) => {
                            info!(
                                "egress running for producer {producer_id} in room {room_id} \
                                 (rtp {}, attempt {attempt})",
                                descriptor.rtp_port
                            );
                            return Ok(StartOutcome::Started(descriptor));
                        }
                        Err(session) => {
                            // A stop arrived while we were provisioning.
                            self.teardown(session);
                            return Err(BridgeError::Sfu(
                                "egress stopped during provisioning".to_string(),
                            ));
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "egress attempt {attempt}/{retries} failed for producer \
                         {producer_id}: {err}"
                    );
                    last_error = Some(err);
                }
            }
        }

        self.sessions.abort(&producer_id, token);
        Err(BridgeError::EgressExhausted {
            attempts: retries,
            last: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Tear down the session for `producer_id`. Safe to call from close
    /// hooks and repeatedly; reports whether there was anything to stop.
    pub fn stop(&self, producer_id: ProducerId) -> StopOutcome {
        match self.sessions.remove(&producer_id) {
            Removed::NotFound => StopOutcome::AlreadyStopped,
            Removed::Provisioning => {
                info!("egress stop for producer {producer_id} while provisioning");
                StopOutcome::Stopped
            }
            Removed::Session(session) => {
                info!("stopping egress for producer {producer_id}");
                self.teardown(session);
                StopOutcome::Stopped
            }
        }
    }

    /// Stop every session owned by a disconnecting peer.
    pub fn stop_owned_by(&self, peer_id: &str) -> usize {
        let producer_ids = self.sessions.keys_owned_by(peer_id);
        let count = producer_ids.len();
        for producer_id in producer_ids {
            self.stop(producer_id);
        }
        count
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn provision(
        &self,
        weak: &Weak<EgressManager>,
        room_id: &str,
        peer_id: &str,
        role: &str,
        producer_id: ProducerId,
        attempt: u32,
    ) -> Result<EgressSession> {
        // 1. Plain receiver on loopback, RTCP on its own port, server-push
        //    mode (we tell it where to send).
        let transport = self
            .router
            .create_plain_transport(plain_transport_options())
            .await
            .map_err(|err| BridgeError::Sfu(err.to_string()))?;

        // 2. Advisory local ports for the pipeline's udpsrc.
        let rtp_port = allocate_udp_port(LOOPBACK)?;
        let rtcp_port = allocate_udp_port(LOOPBACK)?;

        // 3. Point the receiver at them.
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(LOOPBACK),
                port: Some(rtp_port),
                rtcp_port: Some(rtcp_port),
                srtp_parameters: None,
            })
            .await
            .map_err(|err| BridgeError::Sfu(err.to_string()))?;

        // 4. Unpaused consumer for the publisher's Opus feed.
        let mut consumer_options =
            ConsumerOptions::new(producer_id, opus_capabilities(self.router.rtp_capabilities())?);
        consumer_options.paused = false;
        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(|err| BridgeError::Sfu(err.to_string()))?;
        let (payload_type, clock_rate, channels) = consumer_codec(consumer.rtp_parameters());

        // 5. Transcode pipeline writing numbered segments under the session
        //    prefix.
        let prefix = wav_prefix(room_id, &producer_id);
        let output_pattern = self.config.egress_dir.join(format!("{prefix}%05d.wav"));
        let spec = PipelineSpec {
            bin: self.config.gst_bin.clone(),
            rtp_port,
            payload_type,
            clock_rate,
            channels,
            jitter_latency_ms: self.config.jitter_latency_ms,
            chunk_seconds: self.config.egress_chunk_seconds,
            output_pattern,
        };
        let mut pipeline_handle = pipeline::spawn_pipeline(&spec, &producer_id.to_string())?;

        // 6. Startup gate; an early exit here usually means the udpsrc port
        //    was lost to a race and costs one retry.
        pipeline::wait_healthy(&mut pipeline_handle, self.config.startup_grace).await?;

        // 7. Poller forwarding each finalized segment.
        let poller = self.start_poller(room_id, peer_id, role, producer_id, prefix.clone());

        // Close hooks capture only the producer id and a weak manager
        // reference, so a fired hook after teardown is a harmless no-op.
        {
            let weak = weak.clone();
            consumer
                .on_transport_close(Box::new(move || stop_from_hook(weak, producer_id)))
                .detach();
        }
        {
            let weak = weak.clone();
            consumer
                .on_producer_close(Box::new(move || stop_from_hook(weak, producer_id)))
                .detach();
        }

        Ok(EgressSession {
            descriptor: EgressDescriptor {
                ok: true,
                producer_id,
                room_id: room_id.to_string(),
                rtp_port,
                rtcp_port,
                wav_prefix: prefix,
                chunk_seconds: self.config.egress_chunk_seconds,
                engine: "gstreamer",
                payload_type,
                attempt,
                already_running: None,
            },
            poller,
            pipeline: pipeline_handle,
            consumer,
            transport,
        })
    }

    fn start_poller(
        &self,
        room_id: &str,
        peer_id: &str,
        role: &str,
        producer_id: ProducerId,
        prefix: String,
    ) -> SegmentPoller {
        let analysis = Arc::clone(&self.analysis);
        let rooms = Arc::clone(&self.rooms);
        let room = room_id.to_string();
        let hint = format!("egress peer={peer_id} producer={producer_id} role={role}");

        spool::start(
            self.config.egress_dir.clone(),
            prefix,
            self.config.watch_poll,
            move |path: PathBuf| {
                let analysis = Arc::clone(&analysis);
                let rooms = Arc::clone(&rooms);
                let room = room.clone();
                let hint = hint.clone();
                async move {
                    let now = unix_millis().to_string();
                    let fields = ForwardFields {
                        room_id: room.clone(),
                        seq: Some(now.clone()),
                        timestamp: Some(now),
                        client_id: None,
                        context_hint: Some(hint),
                    };
                    match analysis.forward_file(&path, None, &fields).await {
                        Ok(verdict) => broadcast_verdict(&rooms, &room, &verdict),
                        Err(err) => {
                            warn!("egress forward failed for {}: {err}", path.display())
                        }
                    }
                }
            },
        )
    }

    /// Release everything a session holds, reverse of acquisition order.
    /// Every step runs even if an earlier one reports a failure.
    fn teardown(&self, mut session: EgressSession) {
        session.poller.stop();
        pipeline::terminate(&mut session.pipeline);
        drop(session.consumer);
        drop(session.transport);
    }
}

fn stop_from_hook(weak: Weak<EgressManager>, producer_id: ProducerId) {
    if let Some(manager) = weak.upgrade() {
        manager.stop(producer_id);
    }
}

fn plain_transport_options() -> PlainTransportOptions {
    let mut options = PlainTransportOptions::new(ListenInfo {
        protocol: Protocol::Udp,
        ip: LOOPBACK,
        announced_address: None,
        expose_internal_ip: false,
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    });
    options.rtcp_mux = false;
    options.comedia = false;
    options
}

/// Spool filename prefix tying segments to one session.
pub fn wav_prefix(room_id: &str, producer_id: &ProducerId) -> String {
    format!("room_{room_id}_prod_{producer_id}_")
}

/// The router capabilities restricted to the audio codec, in the form the
/// consumer API accepts.
fn opus_capabilities(finalized: &RtpCapabilitiesFinalized) -> Result<RtpCapabilities> {
    let value =
        serde_json::to_value(finalized).map_err(|err| BridgeError::Sfu(err.to_string()))?;
    let mut capabilities: RtpCapabilities =
        serde_json::from_value(value).map_err(|err| BridgeError::Sfu(err.to_string()))?;
    capabilities
        .codecs
        .retain(|codec| matches!(codec, RtpCodecCapability::Audio { .. }));
    capabilities.header_extensions.clear();
    Ok(capabilities)
}

/// Negotiated audio codec of the consumer, with a conservative fallback.
fn consumer_codec(parameters: &RtpParameters) -> (u8, u32, u8) {
    match parameters.codecs.first() {
        Some(RtpCodecParameters::Audio {
            payload_type,
            clock_rate,
            channels,
            ..
        }) => (*payload_type, clock_rate.get(), channels.get()),
        _ => (FALLBACK_PAYLOAD_TYPE, FALLBACK_CLOCK_RATE, FALLBACK_CHANNELS),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

enum SlotState<T> {
    Provisioning,
    Running(T),
}

struct Slot<T> {
    owner: String,
    token: u64,
    state: SlotState<T>,
}

pub(crate) enum Removed<T> {
    NotFound,
    Provisioning,
    Session(T),
}

/// Registry of sessions keyed by producer id. A `Provisioning` marker
/// reserves the key while construction is in flight so concurrent starts
/// cannot build two pipelines for the same producer; the token guards the
/// commit against a stop that raced the construction.
pub(crate) struct SessionTable<K, T> {
    slots: Mutex<HashMap<K, Slot<T>>>,
    next_token: AtomicU64,
}

impl<K, T> SessionTable<K, T>
where
    K: std::hash::Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Reserve `key` for construction. `None` when a session already exists
    /// or is being provisioned.
    pub(crate) fn try_reserve(&self, key: K, owner: &str) -> Option<u64> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(&key) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            key,
            Slot {
                owner: owner.to_string(),
                token,
                state: SlotState::Provisioning,
            },
        );
        Some(token)
    }

    /// Promote a reservation to a running session. Gives the session back
    /// when the reservation is gone or no longer ours (a stop raced us).
    pub(crate) fn commit(&self, key: &K, token: u64, session: T) -> std::result::Result<(), T> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(key) {
            Some(slot) if slot.token == token && matches!(slot.state, SlotState::Provisioning) => {
                slot.state = SlotState::Running(session);
                Ok(())
            }
            _ => Err(session),
        }
    }

    /// Drop our own reservation after a failed construction.
    pub(crate) fn abort(&self, key: &K, token: u64) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(key) {
            if slot.token == token && matches!(slot.state, SlotState::Provisioning) {
                slots.remove(key);
            }
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Removed<T> {
        let mut slots = self.slots.lock().unwrap();
        match slots.remove(key) {
            None => Removed::NotFound,
            Some(Slot {
                state: SlotState::Provisioning,
                ..
            }) => Removed::Provisioning,
            Some(Slot {
                state: SlotState::Running(session),
                ..
            }) => Removed::Session(session),
        }
    }

    pub(crate) fn peek_running<R>(&self, key: &K, read: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(Slot {
                state: SlotState::Running(session),
                ..
            }) => Some(read(session)),
            _ => None,
        }
    }

    pub(crate) fn keys_owned_by(&self, owner: &str) -> Vec<K> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter(|(_, slot)| slot.owner == owner)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
