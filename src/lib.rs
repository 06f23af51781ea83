//! insight-bridge: real-time audio ingress/egress orchestrator.
//!
//! Browsers publish microphone audio through a mediasoup SFU; per publisher,
//! an egress session extracts the RTP/Opus feed, transcodes it to segmented
//! 16 kHz mono WAV via an external GStreamer process, forwards each segment
//! to a speech-analysis service, and fans the verdicts out to every peer in
//! the publisher's room over the signaling channel. A compatibility HTTP
//! endpoint accepts pre-recorded chunks and takes the same trip.

pub mod analysis;
pub mod config;
pub mod egress;
pub mod error;
pub mod pipeline;
pub mod ports;
pub mod rooms;
pub mod signaling;
pub mod spool;
pub mod state;
pub mod types;
pub mod upload;
