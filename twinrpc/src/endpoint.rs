use std::{
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// A remote address as it appears in configuration.
///
/// Hosts are kept as strings so that DNS names are resolved at connect time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    pub host: String,
    pub port: u16,
}

impl EndPoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for EndPoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("endpoint without port: {s}"),
            ));
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("endpoint without host: {s}"),
            ));
        }
        let port = port.parse::<u16>().map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid port in {s}: {e}"),
            )
        })?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for EndPoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Round-robin selection over a fixed set of endpoints.
#[derive(Debug)]
pub struct EndPointProvider {
    endpoints: Vec<EndPoint>,
    cursor: AtomicUsize,
}

impl EndPointProvider {
    /// # Errors
    ///
    /// Fails with `InvalidArgument` when `endpoints` is empty.
    pub fn new(endpoints: Vec<EndPoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "endpoint list is empty".into(),
            ));
        }
        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Parses `host:port[,host:port...]`.
    ///
    /// # Errors
    ///
    /// Fails when any entry is malformed or the list is empty.
    pub fn parse(list: &str) -> Result<Self> {
        let endpoints = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(EndPoint::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::new(endpoints)
    }

    pub fn next(&self) -> &EndPoint {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[idx % self.endpoints.len()]
    }

    #[must_use]
    pub fn endpoints(&self) -> &[EndPoint] {
        &self.endpoints
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
