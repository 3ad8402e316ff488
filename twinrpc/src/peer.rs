use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    Connection, Context, Format, Frame, FrameHandler, InvocationManager,
    ServiceRegistry, ServiceRequest, ServiceResponse,
    client::ClientInner,
    error::{Error, ErrorKind, Result},
};

/// Per-proxy call settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallConfig {
    pub timeout: Duration,
    pub format: Format,
}

/// The remote end of one connection, as seen from this process.
///
/// Cheap to clone. Calls made through proxies obtained from a peer use that
/// peer's connection and its invocation manager.
#[derive(Clone)]
pub struct Peer {
    conn: Arc<Connection>,
    manager: Arc<InvocationManager>,
    call: CallConfig,
}

impl Peer {
    pub(crate) fn new(
        conn: Arc<Connection>,
        manager: Arc<InvocationManager>,
        call: CallConfig,
    ) -> Self {
        Self {
            conn,
            manager,
            call,
        }
    }

    /// Connection id, unique within this process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.conn.client_id()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    #[must_use]
    pub fn invocation_manager(&self) -> &Arc<InvocationManager> {
        &self.manager
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Resolves once the underlying connection has released its socket.
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// A proxy calling `P` on this peer.
    #[must_use]
    pub fn get_remote_service<P: RemoteService>(&self) -> P {
        self.get_remote_service_with(self.call.timeout)
    }

    #[must_use]
    pub fn get_remote_service_with<P: RemoteService>(&self, timeout: Duration) -> P {
        P::from_invoker(Invoker {
            target: Target::Peer(self.clone()),
            call: CallConfig {
                timeout,
                format: self.call.format,
            },
        })
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.conn.id())
            .field("peer_addr", &self.conn.peer_addr())
            .field("client_id", &self.conn.client_id())
            .field("pending", &self.manager.pending())
            .finish()
    }
}

type DisconnectHook = Box<dyn Fn(&Connection) + Send + Sync>;

/// Routes decoded frames of one connection: responses to the invocation
/// manager, requests to the registry.
pub(crate) struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    manager: Arc<InvocationManager>,
    call: CallConfig,
    on_disconnect: Option<DisconnectHook>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        manager: Arc<InvocationManager>,
        call: CallConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            call,
            on_disconnect: None,
        }
    }

    #[must_use]
    pub fn with_disconnect_hook(
        mut self,
        hook: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    fn reply(conn: &Connection, rsp: ServiceResponse) {
        let (txid, format) = (rsp.txid, rsp.format);
        let bytes = Frame::Response(rsp).encode().or_else(|err| {
            tracing::error!("encode response #{txid} failed: {err}");
            Frame::Response(ServiceResponse {
                txid,
                format,
                outcome: Err(err.into_remote_fault()),
            })
            .encode()
        });
        let sent = bytes.and_then(|bytes| conn.send_response(bytes));
        if let Err(err) = sent {
            tracing::warn!("response #{txid} to {} dropped: {err}", conn.peer_addr());
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        match frame {
            Frame::Hello(hello) => {
                tracing::info!("connection {} is client {}", conn.id(), hello.client_id);
                conn.set_client_id(hello.client_id);
            }
            Frame::Response(rsp) => self.manager.on_response(rsp),
            Frame::Request(req) => {
                let registry = self.registry.clone();
                let peer = Peer::new(conn.clone(), self.manager.clone(), self.call);
                tokio::spawn(async move {
                    let ctx = Context::new(peer, req.txid);
                    let conn = ctx.peer().conn.clone();
                    if let Some(rsp) = registry.dispatch(req, Some(ctx)).await {
                        Self::reply(&conn, rsp);
                    }
                });
            }
        }
    }

    fn on_disconnect(&self, conn: &Connection, cause: &Error) {
        self.manager.on_connection_failure(conn.id(), cause);
        if let Some(hook) = &self.on_disconnect {
            hook(conn);
        }
    }
}

#[derive(Clone)]
enum Target {
    Peer(Peer),
    Client(Arc<ClientInner>),
}

/// Issues calls on behalf of a generated proxy.
#[derive(Clone)]
pub struct Invoker {
    target: Target,
    call: CallConfig,
}

impl Invoker {
    pub(crate) fn client(inner: Arc<ClientInner>, timeout: Duration, format: Format) -> Self {
        Self {
            target: Target::Client(inner),
            call: CallConfig { timeout, format },
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.call.timeout
    }

    #[must_use]
    pub fn format(&self) -> Format {
        self.call.format
    }

    /// # Errors
    pub fn encode_arg<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        self.call.format.encode(value)
    }

    async fn peer(&self) -> Result<Peer> {
        match &self.target {
            Target::Peer(peer) => Ok(peer.clone()),
            Target::Client(client) => client.current_peer().await.map_err(|err| {
                Error::new(
                    ErrorKind::ChannelUnavailable,
                    format!("no connection: {err}"),
                )
            }),
        }
    }

    fn request(
        &self,
        service: &str,
        method: &str,
        args: Vec<Bytes>,
        oneway: bool,
    ) -> ServiceRequest {
        ServiceRequest {
            txid: 0,
            service: service.to_string(),
            method: method.to_string(),
            args,
            oneway,
            format: self.call.format,
        }
    }

    /// Calls `service/method` and decodes its return value.
    ///
    /// # Errors
    ///
    /// Any transport error, the remote `RemoteFault`/`BindError`, or
    /// `DeserializeFailed` when the return value does not decode as `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: Vec<Bytes>,
    ) -> Result<R> {
        let peer = self.peer().await?;
        let request = self.request(service, method, args, false);
        let rsp = peer
            .manager
            .invoke(&peer.conn, request, self.call.timeout)
            .await?
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::RecvFailed,
                    format!("{service}/{method}: no response"),
                )
            })?;
        rsp.decode()
    }

    /// Sends a one-way call. Returns once the request is queued; the outcome
    /// on the remote side is never reported.
    ///
    /// # Errors
    pub async fn notify(&self, service: &str, method: &str, args: Vec<Bytes>) -> Result<()> {
        let peer = self.peer().await?;
        let request = self.request(service, method, args, true);
        peer.manager
            .invoke(&peer.conn, request, self.call.timeout)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.target {
            Target::Peer(peer) => format!("peer {}", peer.id()),
            Target::Client(_) => "client".to_string(),
        };
        f.debug_struct("Invoker")
            .field("target", &target)
            .field("call", &self.call)
            .finish()
    }
}

/// A proxy type generated by `#[service]`.
pub trait RemoteService: Sized {
    /// Name of the remote service the proxy calls.
    const NAME: &'static str;

    fn from_invoker(invoker: Invoker) -> Self;

    fn invoker(&self) -> &Invoker;
}
