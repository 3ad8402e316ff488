use foldhash::fast::RandomState;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

use crate::{
    Connection, Frame, ServiceRequest, ServiceResponse,
    error::{Error, ErrorKind, Result},
};

/// A call that is waiting for its response.
#[derive(Debug)]
pub struct InFlightRequest {
    pub txid: u64,
    pub requested_at: Instant,
    pub service: String,
    pub method: String,
    pub connection_id: u64,
    completion: oneshot::Sender<Result<ServiceResponse>>,
}

impl InFlightRequest {
    fn complete(self, result: Result<ServiceResponse>) {
        // the caller may have given up already.
        let _ = self.completion.send(result);
    }
}

/// Correlates outgoing calls with their responses.
///
/// Every non-one-way call gets a fresh transaction id and an entry in the
/// pending map. Whoever removes the entry (response, connection failure or
/// the caller's timeout) resolves it, so each call resolves exactly once.
#[derive(Default)]
pub struct InvocationManager {
    index: AtomicU64,
    pending: dashmap::DashMap<u64, InFlightRequest, RandomState>,
}

/// Removes the pending entry when the caller stops waiting.
struct PendingGuard<'a> {
    manager: &'a InvocationManager,
    txid: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.pending.remove(&self.txid);
    }
}

impl InvocationManager {
    fn next_txid(&self) -> u64 {
        self.index.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sends `request` over `conn` and waits for its response.
    ///
    /// The transaction id of `request` is assigned here. One-way requests
    /// return `Ok(None)` as soon as they are queued.
    ///
    /// # Errors
    ///
    /// - `ChannelUnavailable` when `conn` is not active or not writable;
    /// - `Timeout` when no response arrives within `timeout`;
    /// - `ConnectionLost` when `conn` fails while the call is outstanding;
    /// - the remote error (`RemoteFault`, `BindError`) carried by the response.
    pub async fn invoke(
        &self,
        conn: &Connection,
        mut request: ServiceRequest,
        timeout: Duration,
    ) -> Result<Option<ServiceResponse>> {
        if !conn.is_active() || !conn.is_writable() {
            return Err(Error::new(
                ErrorKind::ChannelUnavailable,
                format!(
                    "connection {} to {} is {:?}, writable: {}",
                    conn.id(),
                    conn.peer_addr(),
                    conn.state(),
                    conn.is_writable()
                ),
            ));
        }

        request.txid = self.next_txid();
        let unavailable = |e: Error| Error::new(ErrorKind::ChannelUnavailable, e.to_string());

        if request.oneway {
            let bytes = Frame::Request(request).encode()?;
            conn.send(bytes).map_err(unavailable)?;
            return Ok(None);
        }

        let txid = request.txid;
        let service = request.service.clone();
        let method = request.method.clone();
        let bytes = Frame::Request(request).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            txid,
            InFlightRequest {
                txid,
                requested_at: Instant::now(),
                service: service.clone(),
                method: method.clone(),
                connection_id: conn.id(),
                completion: tx,
            },
        );
        let _guard = PendingGuard { manager: self, txid };

        conn.send(bytes).map_err(unavailable)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                let response = result?;
                if let Err(err) = &response.outcome {
                    return Err(err.clone());
                }
                Ok(Some(response))
            }
            Ok(Err(_)) => Err(Error::new(
                ErrorKind::ConnectionLost,
                format!("{service}/{method}: call abandoned"),
            )),
            Err(_) => {
                tracing::debug!("{service}/{method} #{txid} timed out after {timeout:?}");
                Err(Error::new(
                    ErrorKind::Timeout,
                    format!("{service}/{method} timed out after {timeout:?}"),
                ))
            }
        }
    }

    /// Resolves the call matching `response.txid`. Responses without a
    /// pending call (late or duplicated) are dropped.
    pub fn on_response(&self, response: ServiceResponse) {
        if let Some((_, inflight)) = self.pending.remove(&response.txid) {
            inflight.complete(Ok(response));
        } else {
            tracing::debug!("drop response for unknown txid {}", response.txid);
        }
    }

    /// Fails every call outstanding on the given connection.
    pub fn on_connection_failure(&self, connection_id: u64, cause: &Error) {
        let txids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        for txid in txids {
            if let Some((_, inflight)) = self.pending.remove(&txid) {
                let msg = format!(
                    "{}/{} #{txid} outstanding for {:?}: {cause}",
                    inflight.service,
                    inflight.method,
                    inflight.requested_at.elapsed()
                );
                inflight.complete(Err(Error::new(ErrorKind::ConnectionLost, msg)));
            }
        }
    }

    #[must_use]
    pub fn contains(&self, txid: u64) -> bool {
        self.pending.contains_key(&txid)
    }

    /// Number of calls currently waiting for a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for InvocationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationManager")
            .field("last_txid", &self.index.load(Ordering::Relaxed))
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndPoint, FrameHandler, WaterMark, frame::Format};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::{net::TcpListener, sync::mpsc};

    /// Forwards requests to the test body and failures to the manager.
    struct Loopback {
        manager: Arc<InvocationManager>,
        requests: mpsc::UnboundedSender<ServiceRequest>,
    }

    impl FrameHandler for Loopback {
        fn on_frame(&self, _conn: &Arc<Connection>, frame: Frame) {
            match frame {
                Frame::Request(req) => {
                    let _ = self.requests.send(req);
                }
                Frame::Response(rsp) => self.manager.on_response(rsp),
                Frame::Hello(_) => {}
            }
        }

        fn on_disconnect(&self, conn: &Connection, cause: &Error) {
            self.manager.on_connection_failure(conn.id(), cause);
        }
    }

    struct Fixture {
        manager: Arc<InvocationManager>,
        client: Arc<Connection>,
        server: Arc<Connection>,
        requests: mpsc::UnboundedReceiver<ServiceRequest>,
    }

    async fn fixture() -> Fixture {
        fixture_with(WaterMark::default()).await
    }

    async fn fixture_with(water_mark: WaterMark) -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = EndPoint::from(listener.local_addr().unwrap());
        let manager = Arc::new(InvocationManager::default());

        let (tx, _) = mpsc::unbounded_channel();
        let client_handler = Arc::new(Loopback {
            manager: manager.clone(),
            requests: tx,
        });
        let (tx, requests) = mpsc::unbounded_channel();
        let server_handler = Arc::new(Loopback {
            manager: Arc::default(),
            requests: tx,
        });

        let (client, accepted) = tokio::join!(
            Connection::connect(
                &endpoint,
                Duration::from_secs(1),
                water_mark,
                client_handler
            ),
            listener.accept()
        );
        let server =
            Connection::accept(accepted.unwrap().0, WaterMark::default(), server_handler).unwrap();
        Fixture {
            manager,
            client: client.unwrap(),
            server,
            requests,
        }
    }

    fn request(method: &str) -> ServiceRequest {
        ServiceRequest {
            txid: 0,
            service: "Test".into(),
            method: method.into(),
            args: vec![],
            oneway: false,
            format: Format::Json,
        }
    }

    fn reply(server: &Connection, req: &ServiceRequest, value: u64) {
        let rsp = ServiceResponse::ok(req, Format::Json.encode(&value).unwrap());
        server
            .send_response(Frame::Response(rsp).encode().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_response() {
        let mut f = fixture().await;
        let manager = f.manager.clone();
        let client = f.client.clone();
        let first = tokio::spawn({
            let (manager, client) = (manager.clone(), client.clone());
            async move {
                manager
                    .invoke(&client, request("a()"), Duration::from_secs(5))
                    .await
            }
        });
        let second = tokio::spawn(async move {
            manager
                .invoke(&client, request("b()"), Duration::from_secs(5))
                .await
        });

        let mut reqs = vec![f.requests.recv().await.unwrap(), f.requests.recv().await.unwrap()];
        reqs.sort_by_key(|r| r.method.clone());
        assert_ne!(reqs[0].txid, reqs[1].txid);

        // answer the first call twice before the second gets its answer.
        reply(&f.server, &reqs[0], 1);
        reply(&f.server, &reqs[0], 100);
        let rsp = first.await.unwrap().unwrap().unwrap();
        assert_eq!(rsp.decode::<u64>().unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.pending(), 1);
        assert!(f.manager.contains(reqs[1].txid));

        reply(&f.server, &reqs[1], 2);
        let rsp = second.await.unwrap().unwrap().unwrap();
        assert_eq!(rsp.decode::<u64>().unwrap(), 2);
        assert_eq!(f.manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let mut f = fixture().await;
        let start = Instant::now();
        let err = f
            .manager
            .invoke(&f.client, request("slow()"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(f.manager.pending(), 0);

        let req = f.requests.recv().await.unwrap();
        reply(&f.server, &req, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.pending(), 0);
        assert!(f.client.is_active());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let mut f = fixture().await;
        let call = tokio::spawn({
            let (manager, client) = (f.manager.clone(), f.client.clone());
            async move {
                manager
                    .invoke(&client, request("hang()"), Duration::from_secs(30))
                    .await
            }
        });
        let _req = f.requests.recv().await.unwrap();

        let start = Instant::now();
        f.server.close();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionLost);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(f.manager.pending(), 0);

        let err = f
            .manager
            .invoke(&f.client, request("after()"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelUnavailable);
    }

    #[tokio::test]
    async fn test_not_writable() {
        let mut f = fixture_with(WaterMark::new(1, 1).unwrap()).await;
        let mut filler = request("fill()");
        filler.oneway = true;
        f.client
            .send(Frame::Request(filler).encode().unwrap())
            .unwrap();
        assert!(!f.client.is_writable());

        let err = f
            .manager
            .invoke(&f.client, request("blocked()"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelUnavailable);
        assert_eq!(f.manager.pending(), 0);

        assert_eq!(f.requests.recv().await.unwrap().method, "fill()");
        while !f.client.is_writable() {
            tokio::task::yield_now().await;
        }
        let mut next = request("next()");
        next.oneway = true;
        f.manager
            .invoke(&f.client, next, Duration::from_secs(1))
            .await
            .unwrap();
        // the rejected call did not consume a txid.
        assert_eq!(f.requests.recv().await.unwrap().txid, 1);
    }

    #[tokio::test]
    async fn test_oneway_and_remote_error() {
        let mut f = fixture().await;
        let mut oneway = request("fire()");
        oneway.oneway = true;
        let rsp = f
            .manager
            .invoke(&f.client, oneway, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rsp.is_none());
        assert_eq!(f.manager.pending(), 0);
        assert!(f.requests.recv().await.unwrap().oneway);

        let call = tokio::spawn({
            let (manager, client) = (f.manager.clone(), f.client.clone());
            async move {
                manager
                    .invoke(&client, request("fail()"), Duration::from_secs(5))
                    .await
            }
        });
        let req = f.requests.recv().await.unwrap();
        let rsp = ServiceResponse::err(&req, Error::remote_fault("boom"));
        f.server
            .send_response(Frame::Response(rsp).encode().unwrap())
            .unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteFault);
        assert_eq!(err.msg, "boom");

        // unknown txids are ignored.
        f.manager.on_response(ServiceResponse {
            txid: 12345,
            format: Format::Json,
            outcome: Ok(Bytes::new()),
        });
    }
}
