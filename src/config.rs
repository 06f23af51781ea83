//! Environment-driven configuration, read once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the bridge.
///
/// Populated from the environment via [`Config::from_env`]; never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP + signaling listen port (`PORT`).
    pub port: u16,
    /// Analysis service endpoint (`PYTHON_URL`).
    pub python_url: String,
    /// End-to-end timeout for one analysis forward (`PYTHON_TIMEOUT_MS`).
    pub python_timeout: Duration,
    /// Transcode pipeline executable (`GST_BIN`).
    pub gst_bin: String,
    /// Length of one WAV segment in seconds (`EGRESS_CHUNK_SECONDS`).
    pub egress_chunk_seconds: u64,
    /// Spool directory for WAV segments (`EGRESS_DIR`).
    pub egress_dir: PathBuf,
    /// Start egress automatically on `produce` (`AUTO_EGRESS`).
    pub auto_egress: bool,
    /// Spool scan interval (`WATCH_POLL_MS`).
    pub watch_poll: Duration,
    /// Jitter buffer depth handed to the pipeline (`GST_JITTER_LATENCY_MS`).
    pub jitter_latency_ms: u64,
    /// Egress provisioning retry budget (`MAX_EGRESS_PORT_RETRIES`).
    pub max_egress_port_retries: u32,
    /// Pipeline startup grace before the health check (`GST_STARTUP_GRACE_MS`).
    pub startup_grace: Duration,
    /// Lower bound of the SFU media port range (`RTC_MIN_PORT`).
    pub rtc_min_port: u16,
    /// Upper bound of the SFU media port range (`RTC_MAX_PORT`).
    pub rtc_max_port: u16,
    /// External IP advertised in ICE candidates (`ANNOUNCED_IP`).
    pub announced_ip: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            python_url: "http://localhost:8000/process".to_string(),
            python_timeout: Duration::from_millis(120_000),
            gst_bin: "gst-launch-1.0".to_string(),
            egress_chunk_seconds: 5,
            egress_dir: std::env::temp_dir(),
            auto_egress: false,
            watch_poll: Duration::from_millis(250),
            jitter_latency_ms: 50,
            max_egress_port_retries: 10,
            startup_grace: Duration::from_millis(400),
            rtc_min_port: 20_000,
            rtc_max_port: 30_000,
            announced_ip: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// Parse an env var, keeping `fallback` when it is unset or malformed.
fn env_parse<T: FromStr + Copy>(key: &str, fallback: T) -> T {
    env_string(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn env_flag(key: &str) -> bool {
    matches!(env_string(key).as_deref(), Some("true") | Some("1"))
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            port: env_parse("PORT", defaults.port),
            python_url: env_string("PYTHON_URL").unwrap_or(defaults.python_url),
            python_timeout: Duration::from_millis(env_parse(
                "PYTHON_TIMEOUT_MS",
                defaults.python_timeout.as_millis() as u64,
            )),
            gst_bin: env_string("GST_BIN").unwrap_or(defaults.gst_bin),
            egress_chunk_seconds: env_parse("EGRESS_CHUNK_SECONDS", defaults.egress_chunk_seconds),
            egress_dir: env_string("EGRESS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.egress_dir),
            auto_egress: env_flag("AUTO_EGRESS"),
            watch_poll: Duration::from_millis(env_parse(
                "WATCH_POLL_MS",
                defaults.watch_poll.as_millis() as u64,
            )),
            jitter_latency_ms: env_parse("GST_JITTER_LATENCY_MS", defaults.jitter_latency_ms),
            max_egress_port_retries: env_parse(
                "MAX_EGRESS_PORT_RETRIES",
                defaults.max_egress_port_retries,
            ),
            startup_grace: Duration::from_millis(env_parse(
                "GST_STARTUP_GRACE_MS",
                defaults.startup_grace.as_millis() as u64,
            )),
            rtc_min_port: env_parse("RTC_MIN_PORT", defaults.rtc_min_port),
            rtc_max_port: env_parse("RTC_MAX_PORT", defaults.rtc_max_port),
            announced_ip: env_string("ANNOUNCED_IP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that touch the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "PORT",
        "PYTHON_URL",
        "PYTHON_TIMEOUT_MS",
        "GST_BIN",
        "EGRESS_CHUNK_SECONDS",
        "EGRESS_DIR",
        "AUTO_EGRESS",
        "WATCH_POLL_MS",
        "GST_JITTER_LATENCY_MS",
        "MAX_EGRESS_PORT_RETRIES",
        "GST_STARTUP_GRACE_MS",
        "RTC_MIN_PORT",
        "RTC_MAX_PORT",
        "ANNOUNCED_IP",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        let config = Config::from_env();
        assert_eq!(config.port, 3000);
        assert_eq!(config.python_url, "http://localhost:8000/process");
        assert_eq!(config.python_timeout, Duration::from_millis(120_000));
        assert_eq!(config.gst_bin, "gst-launch-1.0");
        assert_eq!(config.egress_chunk_seconds, 5);
        assert_eq!(config.egress_dir, std::env::temp_dir());
        assert!(!config.auto_egress);
        assert_eq!(config.watch_poll, Duration::from_millis(250));
        assert_eq!(config.jitter_latency_ms, 50);
        assert_eq!(config.max_egress_port_retries, 10);
        assert_eq!(config.startup_grace, Duration::from_millis(400));
        assert_eq!(config.rtc_min_port, 20_000);
        assert_eq!(config.rtc_max_port, 30_000);
        assert_eq!(config.announced_ip, None);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("PORT", "8080");
        std::env::set_var("PYTHON_URL", "http://analysis:9000/process");
        std::env::set_var("PYTHON_TIMEOUT_MS", "5000");
        std::env::set_var("EGRESS_DIR", "/var/spool/egress");
        std::env::set_var("MAX_EGRESS_PORT_RETRIES", "3");
        std::env::set_var("ANNOUNCED_IP", "203.0.113.9");

        let config = Config::from_env();
        assert_eq!(config.port, 8080);
        assert_eq!(config.python_url, "http://analysis:9000/process");
        assert_eq!(config.python_timeout, Duration::from_millis(5000));
        assert_eq!(config.egress_dir, PathBuf::from("/var/spool/egress"));
        assert_eq!(config.max_egress_port_retries, 3);
        assert_eq!(config.announced_ip, Some("203.0.113.9".to_string()));

        clear_env();
    }

    #[test]
    fn auto_egress_accepts_true_and_one() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("AUTO_EGRESS", "true");
        assert!(Config::from_env().auto_egress);

        std::env::set_var("AUTO_EGRESS", "1");
        assert!(Config::from_env().auto_egress);

        std::env::set_var("AUTO_EGRESS", "yes");
        assert!(!Config::from_env().auto_egress);

        clear_env();
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("PORT", "not-a-port");
        std::env::set_var("WATCH_POLL_MS", "fast");

        let config = Config::from_env();
        assert_eq!(config.port, 3000);
        assert_eq!(config.watch_poll, Duration::from_millis(250));

        clear_env();
    }
}
