//! Supervision of the external transcode subprocess.
//!
//! The pipeline consumes RTP/Opus from a local UDP port and writes numbered
//! 16 kHz mono WAV segments into the spool directory. It has no readiness
//! protocol, so startup is gated by a grace sleep followed by an exit check.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{BridgeError, Result};

/// Everything needed to assemble the pipeline argument vector.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub bin: String,
    pub rtp_port: u16,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
    pub jitter_latency_ms: u64,
    pub chunk_seconds: u64,
    /// Segment path template, e.g. `<spool>/<prefix>%05d.wav`.
    pub output_pattern: PathBuf,
}

/// A running pipeline subprocess.
#[derive(Debug)]
pub struct PipelineHandle {
    child: Child,
}

/// GStreamer argument vector for one egress session.
pub fn build_args(spec: &PipelineSpec) -> Vec<String> {
    let caps = format!(
        "caps=application/x-rtp,media=audio,encoding-name=OPUS,payload={},clock-rate={},channels={}",
        spec.payload_type, spec.clock_rate, spec.channels
    );
    vec![
        "udpsrc".to_string(),
        "address=127.0.0.1".to_string(),
        format!("port={}", spec.rtp_port),
        caps,
        "!".to_string(),
        "rtpjitterbuffer".to_string(),
        format!("latency={}", spec.jitter_latency_ms),
        "drop-on-latency=true".to_string(),
        "!".to_string(),
        "rtpopusdepay".to_string(),
        "!".to_string(),
        "opusdec".to_string(),
        "!".to_string(),
        "audioconvert".to_string(),
        "!".to_string(),
        "audioresample".to_string(),
        "!".to_string(),
        "audio/x-raw,rate=16000,channels=1".to_string(),
        "!".to_string(),
        "queue".to_string(),
        "!".to_string(),
        "splitmuxsink".to_string(),
        "muxer=wavenc".to_string(),
        format!("location={}", spec.output_pattern.display()),
        format!("max-size-time={}", spec.chunk_seconds * 1_000_000_000),
    ]
}

/// Spawn the transcode pipeline. Stderr is drained line by line into the log,
/// prefixed with `tag` (the producer id).
pub fn spawn_pipeline(spec: &PipelineSpec, tag: &str) -> Result<PipelineHandle> {
    spawn_command(&spec.bin, build_args(spec), tag)
}

pub(crate) fn spawn_command(bin: &str, args: Vec<String>, tag: &str) -> Result<PipelineHandle> {
    let mut child = Command::new(bin)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(BridgeError::PipelineSpawn)?;

    if let Some(stderr) = child.stderr.take() {
        let tag = tag.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[gst {tag}] {line}");
            }
        });
    }

    Ok(PipelineHandle { child })
}

/// Give the pipeline `grace` to come up, then fail if it has already exited.
pub async fn wait_healthy(handle: &mut PipelineHandle, grace: Duration) -> Result<()> {
    tokio::time::sleep(grace).await;
    match handle.child.try_wait() {
        Ok(Some(status)) => Err(BridgeError::PipelineEarlyExit(status.to_string())),
        Ok(None) => Ok(()),
        Err(err) => Err(BridgeError::PipelineEarlyExit(err.to_string())),
    }
}

/// Send an unconditional kill signal. Safe to call more than once and on an
/// already-exited process.
pub fn terminate(handle: &mut PipelineHandle) {
    if let Err(err) = handle.child.start_kill() {
        warn!("pipeline kill failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PipelineSpec {
        PipelineSpec {
            bin: "gst-launch-1.0".to_string(),
            rtp_port: 40000,
            payload_type: 111,
            clock_rate: 48000,
            channels: 2,
            jitter_latency_ms: 50,
            chunk_seconds: 5,
            output_pattern: PathBuf::from("/tmp/spool/room_r_prod_p_%05d.wav"),
        }
    }

    #[test]
    fn args_follow_the_fixed_pipeline_shape() {
        let args = build_args(&spec());
        assert_eq!(args[0], "udpsrc");
        assert_eq!(args[1], "address=127.0.0.1");
        assert_eq!(args[2], "port=40000");
        assert_eq!(
            args[3],
            "caps=application/x-rtp,media=audio,encoding-name=OPUS,payload=111,clock-rate=48000,channels=2"
        );
        assert!(args.contains(&"rtpjitterbuffer".to_string()));
        assert!(args.contains(&"latency=50".to_string()));
        assert!(args.contains(&"drop-on-latency=true".to_string()));
        assert!(args.contains(&"rtpopusdepay".to_string()));
        assert!(args.contains(&"opusdec".to_string()));
        assert!(args.contains(&"audio/x-raw,rate=16000,channels=1".to_string()));
        assert!(args.contains(&"muxer=wavenc".to_string()));
        assert_eq!(
            args[args.len() - 2],
            "location=/tmp/spool/room_r_prod_p_%05d.wav"
        );
        assert_eq!(args[args.len() - 1], "max-size-time=5000000000");
    }

    #[actix_rt::test]
    async fn wait_healthy_passes_for_a_live_process() {
        let mut handle = spawn_command("sleep", vec!["5".to_string()], "test").unwrap();
        wait_healthy(&mut handle, Duration::from_millis(50))
            .await
            .unwrap();
        terminate(&mut handle);
    }

    #[actix_rt::test]
    async fn wait_healthy_fails_on_early_exit() {
        let mut handle = spawn_command("false", vec![], "test").unwrap();
        let result = wait_healthy(&mut handle, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BridgeError::PipelineEarlyExit(_))));
    }

    #[actix_rt::test]
    async fn terminate_is_idempotent() {
        let mut handle = spawn_command("sleep", vec!["5".to_string()], "test").unwrap();
        terminate(&mut handle);
        terminate(&mut handle);
        // The process is gone shortly after the first signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.child.try_wait().unwrap().is_some());
    }

    #[actix_rt::test]
    async fn spawn_surfaces_missing_binary() {
        let result = spawn_command("definitely-not-a-binary-xyz", vec![], "test");
        assert!(matches!(result, Err(BridgeError::PipelineSpawn(_))));
    }
}
