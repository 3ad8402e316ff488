use foldhash::fast::RandomState;
use std::{net::SocketAddr, sync::Arc};

use crate::{
    BoundService, ChannelConfig, Connection, InvocationManager, Listener, Peer, RemoteService,
    ServiceRegistry,
    error::{Error, ErrorKind, Result},
    peer::{CallConfig, Dispatcher},
};

type PeerMap = dashmap::DashMap<u64, Peer, RandomState>;

/// The listening side of a symmetric channel.
///
/// Every accepted connection gets its own invocation manager and shares the
/// server's service registry. Connected clients are tracked as [`Peer`]s so
/// the server can call services they bound.
///
/// # Examples
///
/// ```rust,no_run
/// # use twinrpc::{ChannelConfig, ServerChannel};
/// # use std::{net::SocketAddr, str::FromStr};
/// #[twinrpc::service]
/// trait Echo {
///     async fn echo(&self, text: String) -> twinrpc::Result<String>;
/// }
///
/// struct EchoImpl;
///
/// impl Echo for EchoImpl {
///     async fn echo(&self, text: String) -> twinrpc::Result<String> {
///         Ok(text)
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let server = ServerChannel::new(ChannelConfig::default()).unwrap();
/// server.bind_service(std::sync::Arc::new(EchoImpl).twinrpc_export());
///
/// let addr = SocketAddr::from_str("127.0.0.1:8000").unwrap();
/// server.listen(addr).await.unwrap();
/// server.join().await;
/// # }
/// ```
pub struct ServerChannel {
    config: ChannelConfig,
    registry: Arc<ServiceRegistry>,
    peers: Arc<PeerMap>,
    listener: Listener,
}

impl ServerChannel {
    /// # Errors
    ///
    /// `InvalidArgument` when the config is invalid. `endpoints` is ignored.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: ServiceRegistry::create(),
            peers: Arc::default(),
            listener: Listener::default(),
        })
    }

    pub fn bind_service(&self, service: BoundService) -> Option<Arc<BoundService>> {
        self.registry.bind(service)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Starts accepting connections on `addr` and returns the bound address,
    /// which differs from `addr` when port 0 was requested.
    ///
    /// # Errors
    ///
    /// `ListenFailed` when the address cannot be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let registry = self.registry.clone();
        let peers = Arc::downgrade(&self.peers);
        let water_mark = self.config.water_mark;
        let call = CallConfig {
            timeout: self.config.timeout,
            format: self.config.format(),
        };

        self.listener
            .start_listen(addr, move |stream, addr| {
                let Some(peer_map) = peers.upgrade() else {
                    return;
                };
                let manager = Arc::new(InvocationManager::default());
                let dispatcher = Dispatcher::new(registry.clone(), manager.clone(), call)
                    .with_disconnect_hook({
                        let peers = peers.clone();
                        move |conn: &Connection| {
                            if let Some(peers) = peers.upgrade() {
                                peers.remove(&conn.id());
                            }
                        }
                    });
                match Connection::accept(stream, water_mark, Arc::new(dispatcher)) {
                    Ok(conn) => {
                        let id = conn.id();
                        peer_map.insert(id, Peer::new(conn.clone(), manager, call));
                        if !conn.is_active() {
                            peer_map.remove(&id);
                        }
                    }
                    Err(e) => tracing::warn!("accept {addr} failed: {e}"),
                }
            })
            .await
    }

    /// Currently connected peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    #[must_use]
    pub fn peer(&self, id: u64) -> Option<Peer> {
        self.peers.get(&id).map(|p| p.value().clone())
    }

    /// Finds the peer that announced `client_id`.
    #[must_use]
    pub fn find_peer(&self, client_id: &str) -> Option<Peer> {
        self.peers
            .iter()
            .find(|p| p.client_id() == Some(client_id))
            .map(|p| p.value().clone())
    }

    /// A proxy calling `P` on the connected peer `peer_id`.
    ///
    /// # Errors
    ///
    /// `ChannelUnavailable` when no such peer is connected.
    pub fn get_remote_service<P: RemoteService>(&self, peer_id: u64) -> Result<P> {
        let peer = self.peer(peer_id).ok_or_else(|| {
            Error::new(
                ErrorKind::ChannelUnavailable,
                format!("peer {peer_id} is not connected"),
            )
        })?;
        Ok(peer.get_remote_service())
    }

    /// Stops accepting and closes every connection.
    pub fn stop(&self) {
        self.listener.stop();
        for peer in self.peers() {
            peer.close();
        }
    }

    /// Waits until the accept loop has returned and every closed connection
    /// has released its socket.
    pub async fn join(&self) {
        self.listener.join().await;
        for peer in self.peers() {
            peer.closed().await;
        }
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("registry", &self.registry)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}
