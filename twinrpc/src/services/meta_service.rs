use std::sync::Weak;

use crate::{Context, Result, ServiceRegistry};

#[twinrpc_macro::service(name = "twinrpc.Meta")]
pub trait MetaService {
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Method signatures of `service`, empty when it is not bound.
    async fn list_methods(&self, service: String) -> Result<Vec<String>>;

    /// Whether this side is still waiting for the response to `txid` on the
    /// connection the question arrived on.
    async fn is_pending(&self, txid: u64) -> Result<bool>;
}

pub struct MetaServiceImpl {
    registry: Weak<ServiceRegistry>,
}

impl MetaServiceImpl {
    pub(crate) fn new(registry: Weak<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

impl MetaService for MetaServiceImpl {
    async fn list_services(&self) -> Result<Vec<String>> {
        Ok(self
            .registry
            .upgrade()
            .map(|r| r.service_names())
            .unwrap_or_default())
    }

    async fn list_methods(&self, service: String) -> Result<Vec<String>> {
        Ok(self
            .registry
            .upgrade()
            .and_then(|r| r.method_names(&service))
            .unwrap_or_default())
    }

    async fn is_pending(&self, txid: u64) -> Result<bool> {
        Ok(Context::current().is_some_and(|ctx| ctx.peer().invocation_manager().contains(txid)))
    }
}
