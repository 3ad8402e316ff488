use std::{
    io::IoSlice,
    net::SocketAddr,
    sync::{
        Arc, OnceLock, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

use crate::{
    EndPoint, Frame, TaskSupervisor, WaterMark,
    error::{Error, ErrorKind, Result},
    msg::parse_frame,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives everything a connection decodes.
///
/// `on_frame` runs on the connection's reader task and must not wait for
/// other frames of the same connection, nor close it.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, conn: &Arc<Connection>, frame: Frame);

    /// Called exactly once, when the connection leaves the active state.
    fn on_disconnect(&self, conn: &Connection, cause: &Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Active,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Queued-byte accounting with water mark hysteresis.
#[derive(Debug)]
struct BackPressure {
    buffered: AtomicUsize,
    writable: AtomicBool,
    water_mark: WaterMark,
}

impl BackPressure {
    fn new(water_mark: WaterMark) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            water_mark,
        }
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn reserve(&self, n: usize) {
        let total = self.buffered.fetch_add(n, Ordering::AcqRel) + n;
        if total >= self.water_mark.high && self.writable.swap(false, Ordering::AcqRel) {
            tracing::debug!("{total} bytes queued, connection not writable");
        }
    }

    fn release(&self, n: usize) {
        let total = self.buffered.fetch_sub(n, Ordering::AcqRel) - n;
        if total <= self.water_mark.low && !self.writable.swap(true, Ordering::AcqRel) {
            tracing::debug!("drained to {total} bytes, connection writable");
        }
    }
}

/// One TCP link between two peers.
///
/// A reader task decodes frames and hands them to the [`FrameHandler`]; a
/// writer task drains the send queue. The state only moves forward:
/// `Connecting -> Active -> Closing -> Closed`.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: AtomicU8,
    sender: mpsc::UnboundedSender<Bytes>,
    back_pressure: BackPressure,
    client_id: OnceLock<String>,
    // held shared while a frame is handed over, taken exclusively by `shutdown`.
    delivery: RwLock<()>,
    handler: Arc<dyn FrameHandler>,
    supervisor: TaskSupervisor,
}

impl Connection {
    /// Dials `endpoint`.
    ///
    /// # Errors
    ///
    /// `ConnectTimeout` when the peer does not accept within `timeout`,
    /// `ConnectRefused` when it rejects, `ConnectFailed` otherwise.
    pub async fn connect(
        endpoint: &EndPoint,
        timeout: Duration,
        water_mark: WaterMark,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<Self>> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Error::new(
                    ErrorKind::ConnectRefused,
                    format!("{endpoint}: {e}"),
                ));
            }
            Ok(Err(e)) => {
                return Err(Error::new(
                    ErrorKind::ConnectFailed,
                    format!("{endpoint}: {e}"),
                ));
            }
            Err(_) => {
                return Err(Error::new(
                    ErrorKind::ConnectTimeout,
                    format!("{endpoint}: not accepted within {timeout:?}"),
                ));
            }
        };
        Self::accept(stream, water_mark, handler)
    }

    /// Wraps an established stream and starts its I/O tasks.
    ///
    /// # Errors
    pub fn accept(
        stream: TcpStream,
        water_mark: WaterMark,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<Self>> {
        let addrs = stream.peer_addr().and_then(|peer| Ok((peer, stream.local_addr()?)));
        let (peer_addr, local_addr) =
            addrs.map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("set nodelay for {peer_addr} failed: {e}");
        }

        let (recv_stream, send_stream) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            sender,
            back_pressure: BackPressure::new(water_mark),
            client_id: OnceLock::new(),
            delivery: RwLock::new(()),
            handler,
            supervisor: TaskSupervisor::create(),
        });
        conn.state
            .store(ConnState::Active as u8, Ordering::Release);

        conn.supervisor.spawn({
            let conn = conn.clone();
            async move {
                if let Err(e) = Self::start_send_loop(&conn, send_stream, receiver).await {
                    tracing::error!("send loop for {} failed: {e}", conn.peer_addr);
                    conn.shutdown(e);
                }
            }
        });
        conn.supervisor.spawn({
            let conn = conn.clone();
            async move {
                if let Err(e) = Self::start_recv_loop(&conn, recv_stream).await {
                    if conn.is_active() {
                        tracing::warn!("recv loop for {} stopped: {e}", conn.peer_addr);
                    }
                    conn.shutdown(e);
                }
            }
        });

        tracing::info!("connection {} established: {local_addr} -> {peer_addr}", conn.id);
        Ok(conn)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.back_pressure.is_writable()
    }

    /// Bytes queued but not yet written to the socket.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.back_pressure.buffered()
    }

    /// Identifier announced by the remote client, if it sent one.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    pub(crate) fn set_client_id(&self, client_id: String) {
        if let Err(client_id) = self.client_id.set(client_id) {
            tracing::warn!(
                "connection {} announced a second client id: {client_id}",
                self.id
            );
        }
    }

    /// Queues an encoded frame.
    ///
    /// # Errors
    ///
    /// `NotActive` unless the connection is active, `NotWritable` while the
    /// queue sits above the high water mark.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(Error::new(
                ErrorKind::NotActive,
                format!("connection {} is {:?}", self.id, self.state()),
            ));
        }
        if !self.is_writable() {
            return Err(Error::new(
                ErrorKind::NotWritable,
                format!("{} bytes queued on connection {}", self.buffered(), self.id),
            ));
        }
        self.enqueue(frame)
    }

    /// Queues a response frame. Responses ignore backpressure: dropping one
    /// would leave the remote caller waiting for its timeout.
    pub(crate) fn send_response(&self, frame: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(Error::new(
                ErrorKind::NotActive,
                format!("connection {} is {:?}", self.id, self.state()),
            ));
        }
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        let len = frame.len();
        self.back_pressure.reserve(len);
        self.sender.send(frame).map_err(|_| {
            self.back_pressure.release(len);
            Error::new(ErrorKind::NotActive, format!("connection {} closed", self.id))
        })
    }

    /// Closes the connection. Idempotent; waits for a frame being handed to
    /// the handler, and no frame reaches the handler afterwards.
    pub fn close(&self) {
        self.shutdown(Error::new(
            ErrorKind::ConnectionLost,
            format!("connection {} closed locally", self.id),
        ));
    }

    /// Resolves once both I/O tasks have returned and the socket is released.
    pub async fn closed(&self) {
        self.supervisor.all_stopped().await;
    }

    fn shutdown(&self, cause: Error) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        drop(self.delivery.write().unwrap_or_else(PoisonError::into_inner));

        self.supervisor.stop();
        self.handler.on_disconnect(self, &cause);
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        tracing::info!("connection {} to {} closed: {cause}", self.id, self.peer_addr);
    }

    async fn start_recv_loop(conn: &Arc<Self>, mut recv_stream: OwnedReadHalf) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(64 << 10);
        loop {
            if let Some(body) = parse_frame(&mut buffer)? {
                let frame = Frame::decode(body)?;
                let _delivery = conn.delivery.read().unwrap_or_else(PoisonError::into_inner);
                if !conn.is_active() {
                    return Ok(());
                }
                conn.handler.on_frame(conn, frame);
            } else {
                if buffer.capacity() - buffer.len() < 4096 {
                    buffer.reserve(64 << 10);
                }
                let n = recv_stream
                    .read_buf(&mut buffer)
                    .await
                    .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::RecvFailed, "socket eof".to_string()));
                }
            }
        }
    }

    async fn start_send_loop(
        conn: &Arc<Self>,
        mut send_stream: OwnedWriteHalf,
        mut receiver: mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut msgs, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                match send_stream.write_vectored(slices).await {
                    Ok(0) => {
                        return Err(Error::new(
                            ErrorKind::SendFailed,
                            "socket write zero".to_string(),
                        ));
                    }
                    Ok(n) => IoSlice::advance_slices(&mut slices, n),
                    Err(e) => return Err(Error::new(ErrorKind::SendFailed, e.to_string())),
                }
            }

            let written = msgs.iter().map(Bytes::len).sum();
            msgs.clear();
            conn.back_pressure.release(written);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Format, Hello};
    use tokio::net::TcpListener;

    struct Recorder {
        frames: mpsc::UnboundedSender<Frame>,
        disconnects: AtomicUsize,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, _conn: &Arc<Connection>, frame: Frame) {
            let _ = self.frames.send(frame);
        }

        fn on_disconnect(&self, _conn: &Connection, _cause: &Error) {
            self.disconnects.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Frame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            frames,
            disconnects: AtomicUsize::new(0),
        });
        (recorder, rx)
    }

    async fn pair(
        water_mark: WaterMark,
    ) -> (
        Arc<Connection>,
        Arc<Recorder>,
        Arc<Connection>,
        mpsc::UnboundedReceiver<Frame>,
        Arc<Recorder>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = EndPoint::from(listener.local_addr().unwrap());

        let (client_handler, _) = recorder();
        let (server_handler, server_frames) = recorder();
        let (client, accepted) = tokio::join!(
            Connection::connect(
                &endpoint,
                Duration::from_secs(1),
                water_mark,
                client_handler.clone()
            ),
            listener.accept()
        );
        let server =
            Connection::accept(accepted.unwrap().0, water_mark, server_handler.clone()).unwrap();
        (
            client.unwrap(),
            client_handler,
            server,
            server_frames,
            server_handler,
        )
    }

    #[test]
    fn test_water_mark_hysteresis() {
        let bp = BackPressure::new(WaterMark::new(10, 20).unwrap());
        bp.reserve(15);
        assert!(bp.is_writable());
        bp.reserve(5);
        assert!(!bp.is_writable());
        bp.release(5);
        assert!(!bp.is_writable(), "must stay unwritable until the low mark");
        bp.release(5);
        assert!(bp.is_writable());
        assert_eq!(bp.buffered(), 10);
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (client, client_handler, server, mut frames, server_handler) =
            pair(WaterMark::default()).await;

        let hello = Frame::Hello(Hello {
            client_id: "agent".into(),
        });
        client.send(hello.encode().unwrap()).unwrap();
        assert_eq!(frames.recv().await.unwrap(), hello);

        client.close();
        client.close();
        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(client_handler.disconnects.load(Ordering::Acquire), 1);
        client.closed().await;

        let err = client.send(hello.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotActive);

        // the remote side observes the close as a disconnect.
        server.closed().await;
        assert_eq!(server.state(), ConnState::Closed);
        assert_eq!(server_handler.disconnects.load(Ordering::Acquire), 1);
    }

    struct Slow {
        entered: AtomicBool,
        finished: AtomicBool,
    }

    impl FrameHandler for Slow {
        fn on_frame(&self, _conn: &Arc<Connection>, _frame: Frame) {
            self.entered.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_millis(200));
            self.finished.store(true, Ordering::Release);
        }

        fn on_disconnect(&self, _conn: &Connection, _cause: &Error) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = EndPoint::from(listener.local_addr().unwrap());
        let slow = Arc::new(Slow {
            entered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let (server_handler, _) = recorder();
        let (client, accepted) = tokio::join!(
            Connection::connect(
                &endpoint,
                Duration::from_secs(1),
                WaterMark::default(),
                slow.clone()
            ),
            listener.accept()
        );
        let client = client.unwrap();
        let server =
            Connection::accept(accepted.unwrap().0, WaterMark::default(), server_handler).unwrap();

        let hello = Frame::Hello(Hello {
            client_id: "slow".into(),
        });
        server.send(hello.encode().unwrap()).unwrap();
        while !slow.entered.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.close();
        assert!(slow.finished.load(Ordering::Acquire));
        assert_eq!(client.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_not_writable() {
        let (client, _, _server, mut frames, _) = pair(WaterMark::new(1, 1).unwrap()).await;

        let frame = Frame::Request(crate::ServiceRequest {
            txid: 1,
            service: "Echo".into(),
            method: "echo(String)".into(),
            args: vec![Format::Json.encode("hi").unwrap()],
            oneway: true,
            format: Format::Json,
        });
        let bytes = frame.encode().unwrap();

        // the writer task cannot run before this task yields.
        client.send(bytes.clone()).unwrap();
        assert!(!client.is_writable());
        let err = client.send(bytes.clone()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotWritable);

        assert_eq!(frames.recv().await.unwrap(), frame);
        while !client.is_writable() {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.buffered(), 0);
        client.send(bytes).unwrap();
        assert_eq!(frames.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = EndPoint::from(listener.local_addr().unwrap());
        drop(listener);

        let (handler, _) = recorder();
        let err = Connection::connect(
            &endpoint,
            Duration::from_secs(1),
            WaterMark::default(),
            handler,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectRefused);
    }
}
