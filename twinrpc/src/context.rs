use std::future::Future;

use tokio::task::futures::TaskLocalFuture;

use crate::Peer;

tokio::task_local! {
    static CONTEXT: Context;
}

/// The call a service method is currently handling.
///
/// Available through [`Context::current`] while a bound method runs, so the
/// method can call back into its caller over the same connection:
///
/// ```rust,ignore
/// let ctx = twinrpc::Context::current().unwrap();
/// let listener = ctx.peer().get_remote_service::<ProgressListenerProxy>();
/// listener.progress(50).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Context {
    peer: Peer,
    txid: u64,
}

impl Context {
    pub(crate) fn new(peer: Peer, txid: u64) -> Self {
        Self { peer, txid }
    }

    /// Returns the context of the request being handled by this task, if
    /// any.
    #[must_use]
    pub fn current() -> Option<Context> {
        CONTEXT.try_with(Clone::clone).ok()
    }

    /// The peer that sent the request.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Transaction id the caller assigned to the request.
    #[must_use]
    pub fn txid(&self) -> u64 {
        self.txid
    }

    pub(crate) fn scope<F: Future>(self, f: F) -> TaskLocalFuture<Context, F> {
        CONTEXT.scope(self, f)
    }
}
