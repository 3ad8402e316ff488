use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    BoundService, ChannelConfig, Connection, EndPointProvider, Frame, Hello, InvocationManager,
    Invoker, Peer, RemoteService, ServiceRegistry,
    error::{Error, ErrorKind, Result},
    peer::{CallConfig, Dispatcher},
};

pub(crate) struct ClientInner {
    config: ChannelConfig,
    endpoints: EndPointProvider,
    manager: Arc<InvocationManager>,
    registry: Arc<ServiceRegistry>,
    current: Mutex<Option<Peer>>,
    connecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ClientInner {
    fn call_config(&self) -> CallConfig {
        CallConfig {
            timeout: self.config.timeout,
            format: self.config.format(),
        }
    }

    fn active_peer(&self) -> Option<Peer> {
        let current = self.current.lock().ok()?;
        current.as_ref().filter(|peer| peer.is_active()).cloned()
    }

    /// Returns the live connection, reconnecting when there is none.
    pub(crate) async fn current_peer(&self) -> Result<Peer> {
        if let Some(peer) = self.active_peer() {
            return Ok(peer);
        }

        let _connecting = self.connecting.lock().await;
        if let Some(peer) = self.active_peer() {
            return Ok(peer);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::ChannelUnavailable,
                "channel closed".into(),
            ));
        }

        let peer = self.establish().await?;
        if self.closed.load(Ordering::Acquire) {
            peer.close();
            return Err(Error::new(
                ErrorKind::ChannelUnavailable,
                "channel closed".into(),
            ));
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(peer.clone());
        }
        Ok(peer)
    }

    /// Dials the endpoints round robin, retrying up to `max_retry` times.
    async fn establish(&self) -> Result<Peer> {
        let attempts = self.config.max_retry.saturating_add(1);
        let mut last_err = Error::kind(ErrorKind::ConnectFailed);
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_interval).await;
            }

            let endpoint = self.endpoints.next();
            let handler = Dispatcher::new(
                self.registry.clone(),
                self.manager.clone(),
                self.call_config(),
            );
            match Connection::connect(
                endpoint,
                self.config.connect_timeout,
                self.config.water_mark,
                Arc::new(handler),
            )
            .await
            {
                Ok(conn) => {
                    let hello = Frame::Hello(Hello {
                        client_id: self.config.client_id.clone(),
                    });
                    if let Err(err) = hello.encode().and_then(|bytes| conn.send(bytes)) {
                        tracing::warn!("send hello to {endpoint} failed: {err}");
                        conn.close();
                        last_err = err;
                        continue;
                    }
                    tracing::info!("connected to {endpoint} after {attempt} attempt(s)");
                    return Ok(Peer::new(conn, self.manager.clone(), self.call_config()));
                }
                Err(err) => {
                    tracing::warn!("connect to {endpoint} failed ({attempt}/{attempts}): {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let peer = self.current.lock().ok().and_then(|mut current| current.take());
        if let Some(peer) = peer {
            peer.close();
        }
    }
}

/// The calling side of a symmetric channel.
///
/// A client channel dials one of its endpoints and keeps a single connection
/// open. Both sides may call each other over it: services bound with
/// [`bind_service`](Self::bind_service) are callable by the server.
///
/// ```rust,no_run
/// # use twinrpc::{ChannelConfig, ClientChannel, services::{MetaService, MetaServiceProxy}};
/// # #[tokio::main]
/// # async fn main() -> twinrpc::Result<()> {
/// let config = ChannelConfig::default().with_endpoints("127.0.0.1:8000");
/// let client = ClientChannel::connect(config).await?;
/// let meta = client.get_remote_service::<MetaServiceProxy>();
/// println!("{:?}", meta.list_services().await?);
/// # Ok(())
/// # }
/// ```
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

impl ClientChannel {
    /// Creates a channel without connecting; the first call connects.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the config is invalid or lists no endpoint.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let endpoints = config.endpoint_provider()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                endpoints,
                manager: Arc::default(),
                registry: ServiceRegistry::create(),
                current: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a channel and connects it.
    ///
    /// # Errors
    ///
    /// The last connect error once every attempt failed.
    pub async fn connect(config: ChannelConfig) -> Result<Self> {
        let channel = Self::new(config)?;
        channel.inner.current_peer().await?;
        Ok(channel)
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// A proxy for the remote service `P`, using the configured timeout.
    #[must_use]
    pub fn get_remote_service<P: RemoteService>(&self) -> P {
        self.get_remote_service_with(self.inner.config.timeout)
    }

    #[must_use]
    pub fn get_remote_service_with<P: RemoteService>(&self, timeout: Duration) -> P {
        P::from_invoker(Invoker::client(
            self.inner.clone(),
            timeout,
            self.inner.config.format(),
        ))
    }

    /// Makes `service` callable by the server over this channel.
    pub fn bind_service(&self, service: BoundService) -> Option<Arc<BoundService>> {
        self.inner.registry.bind(service)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn invocation_manager(&self) -> &Arc<InvocationManager> {
        &self.inner.manager
    }

    /// The current connection, if it is active.
    #[must_use]
    pub fn peer(&self) -> Option<Peer> {
        self.inner.active_peer()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active_peer().is_some()
    }

    /// Closes the connection. Proxies of this channel fail with
    /// `ChannelUnavailable` afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("endpoints", &self.inner.endpoints.endpoints())
            .field("peer", &self.inner.active_peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_invalid_config() {
        let err = ClientChannel::new(ChannelConfig::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let mut config = ChannelConfig::default().with_endpoints("127.0.0.1:1");
        config.water_mark.low = config.water_mark.high + 1;
        let err = ClientChannel::new(config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_connect_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = ChannelConfig::default().with_endpoints(addr.to_string());
        config.max_retry = 2;
        config.retry_interval = Duration::from_millis(50);

        let start = std::time::Instant::now();
        let err = ClientChannel::connect(config).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectRefused);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unbounded_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = ChannelConfig::default().with_endpoints(addr.to_string());
        config.max_retry = u32::MAX;
        config.validate().unwrap();

        let client = ClientChannel::connect(config).await.unwrap();
        assert!(client.is_active());
        client.close();
    }
}
