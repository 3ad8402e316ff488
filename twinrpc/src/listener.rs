use std::{io, net::SocketAddr, time::Duration};

use tokio::net::TcpStream;

use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    task_supervisor: TaskSupervisor,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// Binds `addr` and hands every accepted stream to `on_accept` until
    /// stopped.
    ///
    /// # Errors
    ///
    /// `ListenFailed` when the address cannot be bound.
    pub async fn start_listen<F>(&self, addr: SocketAddr, on_accept: F) -> Result<SocketAddr>
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        if self.task_supervisor.is_stopped() {
            return Err(Error::new(
                ErrorKind::ListenFailed,
                "listener already stopped".into(),
            ));
        }
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::ListenFailed, format!("{addr}: {e}")))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::ListenFailed, e.to_string()))?;

        self.task_supervisor.spawn(async move {
            tracing::info!("start listening: {listener_addr}");
            accept_loop(listener_addr, || listener.accept(), on_accept).await;
        });

        Ok(listener_addr)
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

/// Runs until the enclosing task is dropped; accept errors are logged and
/// retried after a pause.
async fn accept_loop<S, A, Fut, F>(listener_addr: SocketAddr, mut accept: A, on_accept: F)
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
    F: Fn(S, SocketAddr),
{
    loop {
        match accept().await {
            Ok((stream, addr)) => on_accept(stream, addr),
            Err(e) => {
                tracing::error!("accept on {listener_addr} failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[tokio::test]
    async fn test_accept_error_keeps_listening() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let script = Arc::new(Mutex::new(VecDeque::from([
            Err(io::Error::other("too many open files")),
            Ok(((), addr)),
            Err(io::Error::other("too many open files")),
            Ok(((), addr)),
        ])));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let accepted = accepted.clone();
            accept_loop(
                addr,
                move || {
                    let next = script.lock().unwrap().pop_front();
                    async move {
                        match next {
                            Some(result) => result,
                            None => std::future::pending().await,
                        }
                    }
                },
                move |(), _| {
                    accepted.fetch_add(1, Ordering::AcqRel);
                },
            )
        });

        let wait = async {
            while accepted.load(Ordering::Acquire) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn test_stop_ends_accepting() {
        let listener = Listener::new();
        let addr = listener
            .start_listen("127.0.0.1:0".parse().unwrap(), |_, _| {})
            .await
            .unwrap();
        tokio::net::TcpStream::connect(addr).await.unwrap();

        listener.stop();
        tokio::time::timeout(Duration::from_secs(5), listener.join())
            .await
            .unwrap();
        let err = listener
            .start_listen("127.0.0.1:0".parse().unwrap(), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ListenFailed);
    }
}
