use std::{
    process,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use error::ConfigurationError;
use serde::{Deserialize, Serialize};

pub mod error;

lazy_static::lazy_static! {
    static ref CONNECTION_EPOCH: AtomicUsize = AtomicUsize::new(0);
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Connection {
    /// Prefix of the DCP producer names this client opens.
    #[serde(rename = "name-prefix")]
    pub name_prefix: String,

    /// Establish connection timeout in seconds.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout: u64,

    /// Request/response and waiter timeout in seconds.
    #[serde(rename = "io-timeout")]
    pub io_timeout: u64,

    /// Seconds of inbound silence before a connection counts as dead.
    /// Zero disables dead-peer detection.
    #[serde(rename = "dead-connection-detection-interval")]
    pub dead_connection_detection_interval: u64,

    #[serde(rename = "ssl-enabled")]
    pub ssl_enabled: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            name_prefix: "dcp-client".to_owned(),
            connect_timeout: 20,
            io_timeout: 60,
            dead_connection_detection_interval: 0,
            ssl_enabled: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FlowControl {
    /// Inbound buffer the server may fill before acks are required, in bytes.
    #[serde(rename = "connection-buffer-size")]
    pub connection_buffer_size: u32,

    /// Percentage of the buffer that, once acknowledged by the embedder,
    /// triggers a BUFFER_ACKNOWLEDGEMENT back to the server.
    #[serde(rename = "ack-watermark-percent")]
    pub ack_watermark_percent: u8,

    #[serde(rename = "enable-noop")]
    pub enable_noop: bool,

    #[serde(rename = "noop-interval")]
    pub noop_interval: u64,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            connection_buffer_size: 20_971_520,
            ack_watermark_percent: 20,
            enable_noop: true,
            noop_interval: 120,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Retry {
    /// Max transparent retries before an operation fails with CannotRetry.
    #[serde(rename = "max-attempt")]
    pub max_attempt: u32,

    /// Base delay between attempts in milliseconds; grows exponentially.
    #[serde(rename = "delay-millis")]
    pub delay_millis: u64,

    /// Upper bound on the computed delay in milliseconds.
    #[serde(rename = "delay-cap-millis")]
    pub delay_cap_millis: u64,

    /// Repair rounds the fixer grants one channel before giving up on it.
    #[serde(rename = "max-repair-attempts-per-channel")]
    pub max_repair_attempts_per_channel: u32,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempt: 3,
            delay_millis: 500,
            delay_cap_millis: 10_000,
            max_repair_attempts_per_channel: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Configuration {
    pub bucket: String,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    #[serde(default)]
    pub connection: Connection,

    #[serde(rename = "flow-control", default)]
    pub flow_control: FlowControl,

    #[serde(default)]
    pub retry: Retry,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bucket: "default".to_owned(),
            credentials: None,
            connection: Connection::default(),
            flow_control: FlowControl::default(),
            retry: Retry::default(),
        }
    }
}

impl Configuration {
    pub fn check(&self) -> Result<(), ConfigurationError> {
        if self.bucket.is_empty() {
            return Err(ConfigurationError::EmptyBucket);
        }
        if self.flow_control.ack_watermark_percent == 0
            || self.flow_control.ack_watermark_percent > 100
        {
            return Err(ConfigurationError::BadAckWatermark(
                self.flow_control.ack_watermark_percent,
            ));
        }
        if self.flow_control.connection_buffer_size == 0 {
            return Err(ConfigurationError::ZeroBufferSize);
        }
        if self.retry.max_attempt == 0 {
            return Err(ConfigurationError::ZeroRetryAttempts);
        }
        Ok(())
    }

    /// Unique DCP producer name for one connection to `address`.
    ///
    /// The trailing epoch is a process-wide counter, so reconnect storms
    /// cannot produce duplicate names within a process.
    pub fn connection_name(&self, address: &str) -> String {
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| String::from("unknown"));
        format!(
            "{}-{}-{}:{}:{}",
            self.connection.name_prefix,
            hostname,
            process::id(),
            address,
            CONNECTION_EPOCH.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.io_timeout)
    }

    pub fn dead_connection_detection_interval(&self) -> Option<Duration> {
        match self.connection.dead_connection_detection_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_millis)
    }

    pub fn retry_delay_cap(&self) -> Duration {
        Duration::from_millis(self.retry.delay_cap_millis)
    }

    /// Bytes of acknowledged data that trigger a buffer-ack to the server.
    pub fn ack_watermark(&self) -> u32 {
        let buffer = self.flow_control.connection_buffer_size as u64;
        let percent = self.flow_control.ack_watermark_percent as u64;
        (buffer * percent / 100) as u32
    }
}
