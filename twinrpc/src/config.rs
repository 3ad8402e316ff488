use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::time::Duration;

use crate::{
    EndPointProvider, Format,
    error::{Error, ErrorKind, Result},
};

/// Write-buffer thresholds for connection backpressure.
///
/// A connection stops accepting requests once `high` bytes are queued and
/// accepts them again after draining to `low`.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct WaterMark {
    #[serde_inline_default(256 << 10)]
    pub low: usize,
    #[serde_inline_default(1 << 20)]
    pub high: usize,
}

impl Default for WaterMark {
    fn default() -> Self {
        Self {
            low: 256 << 10,
            high: 1 << 20,
        }
    }
}

impl WaterMark {
    /// # Errors
    pub fn new(low: usize, high: usize) -> Result<Self> {
        let water_mark = Self { low, high };
        water_mark.validate()?;
        Ok(water_mark)
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        if self.high == 0 || self.low > self.high {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid water mark: low {} high {}", self.low, self.high),
            ));
        }
        Ok(())
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ChannelConfig {
    /// Comma separated `host:port` list, only used by client channels.
    #[serde_inline_default(String::new())]
    pub endpoints: String,
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde_inline_default(3)]
    pub max_retry: u32,
    #[serde_inline_default(Duration::from_millis(100))]
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Default timeout of a single remote call.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde_inline_default(WaterMark::default())]
    pub water_mark: WaterMark,
    #[serde_inline_default("twinrpc".to_string())]
    pub client_id: String,
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: impl Into<String>) -> Self {
        self.endpoints = endpoints.into();
        self
    }

    #[must_use]
    pub fn format(&self) -> Format {
        if self.use_msgpack {
            Format::MessagePack
        } else {
            Format::Json
        }
    }

    /// # Errors
    pub fn endpoint_provider(&self) -> Result<EndPointProvider> {
        EndPointProvider::parse(&self.endpoints)
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        self.water_mark.validate()?;
        if self.timeout.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "call timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
