use bytes::Bytes;
use foldhash::fast::RandomState;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::{
    Context, ServiceRequest, ServiceResponse,
    error::{Error, ErrorKind, Result},
    services::{MetaService, MetaServiceImpl},
};

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;
pub type Method = Box<dyn Fn(ServiceRequest) -> MethodFuture + Send + Sync>;

/// A named set of callable methods, keyed by signature.
///
/// Usually produced by the `twinrpc_export` method that `#[service]`
/// generates.
pub struct BoundService {
    name: String,
    methods: HashMap<String, Method, RandomState>,
}

impl BoundService {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::default(),
        }
    }

    /// Registers `f` under `signature`, replacing any previous handler.
    pub fn add_method<F, Fut>(&mut self, signature: impl Into<String>, f: F)
    where
        F: Fn(ServiceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.methods
            .insert(signature.into(), Box::new(move |req| Box::pin(f(req))));
    }

    /// Binds the same methods under another service name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }
}

impl std::fmt::Debug for BoundService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundService")
            .field("name", &self.name)
            .field("methods", &self.methods.keys())
            .finish()
    }
}

/// Services callable by the remote side of a channel.
///
/// Every registry starts with the built-in [`MetaService`] bound.
pub struct ServiceRegistry {
    services: dashmap::DashMap<String, Arc<BoundService>, RandomState>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn create() -> Arc<Self> {
        Arc::new_cyclic(|registry| {
            let this = Self {
                services: dashmap::DashMap::default(),
            };
            let meta = Arc::new(MetaServiceImpl::new(registry.clone()));
            this.bind(meta.twinrpc_export());
            this
        })
    }

    /// Binds `service` under its name. The last binding wins; the replaced
    /// one is returned.
    pub fn bind(&self, service: BoundService) -> Option<Arc<BoundService>> {
        let name = service.name.clone();
        let replaced = self.services.insert(name.clone(), Arc::new(service));
        if replaced.is_some() {
            tracing::warn!("service {name} rebound");
        } else {
            tracing::debug!("service {name} bound");
        }
        replaced
    }

    pub fn unbind(&self, name: &str) -> Option<Arc<BoundService>> {
        self.services.remove(name).map(|(_, service)| service)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn method_names(&self, name: &str) -> Option<Vec<String>> {
        let service = self.services.get(name)?;
        let mut names: Vec<String> = service.method_names().cloned().collect();
        names.sort();
        Some(names)
    }

    fn lookup(&self, request: &ServiceRequest) -> Result<MethodFuture> {
        let service = self
            .services
            .get(&request.service)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::BindError,
                    format!("service not found: {}", request.service),
                )
            })?;
        let method = service.methods.get(&request.method).ok_or_else(|| {
            Error::new(
                ErrorKind::BindError,
                format!("method not found: {}/{}", request.service, request.method),
            )
        })?;
        Ok(method(request.clone()))
    }

    /// Runs the method `request` names and builds its response.
    ///
    /// The handler runs on its own task, inside `ctx` when one is given.
    /// Handler errors and panics become `RemoteFault`; unknown services and
    /// methods become `BindError`. One-way requests yield `None`.
    pub async fn dispatch(
        &self,
        request: ServiceRequest,
        ctx: Option<Context>,
    ) -> Option<ServiceResponse> {
        let outcome = match self.lookup(&request) {
            Ok(fut) => {
                let task = match ctx {
                    Some(ctx) => tokio::spawn(ctx.scope(fut)),
                    None => tokio::spawn(fut),
                };
                match task.await {
                    Ok(result) => result.map_err(Error::into_remote_fault),
                    Err(e) if e.is_panic() => {
                        tracing::error!("{}/{} panicked", request.service, request.method);
                        Err(Error::remote_fault(format!(
                            "{}/{} panicked",
                            request.service, request.method
                        )))
                    }
                    Err(e) => Err(Error::remote_fault(e)),
                }
            }
            Err(err) => {
                tracing::error!("dispatch #{} failed: {err}", request.txid);
                Err(err)
            }
        };

        if request.oneway {
            if let Err(err) = outcome {
                tracing::warn!(
                    "one-way call {}/{} failed: {err}",
                    request.service,
                    request.method
                );
            }
            return None;
        }
        Some(ServiceResponse {
            txid: request.txid,
            format: request.format,
            outcome,
        })
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Format;

    fn echo_service() -> BoundService {
        let mut service = BoundService::new("Echo");
        service.add_method("echo(String)", |req: ServiceRequest| async move {
            let mut args = req.arg_reader();
            let value: String = args.next_arg()?;
            args.finish()?;
            req.format.encode(&value)
        });
        service.add_method("fail()", |_| async {
            Err::<Bytes, _>(Error::new(ErrorKind::InvalidArgument, "bad input".into()))
        });
        service.add_method("panic()", |_| async { explode() });
        service
    }

    fn explode() -> Result<Bytes> {
        panic!("handler exploded")
    }

    fn request(service: &str, method: &str, args: Vec<Bytes>) -> ServiceRequest {
        ServiceRequest {
            txid: 3,
            service: service.into(),
            method: method.into(),
            args,
            oneway: false,
            format: Format::Json,
        }
    }

    #[tokio::test]
    async fn test_dispatch() {
        let registry = ServiceRegistry::create();
        assert!(registry.bind(echo_service()).is_none());
        assert!(registry.contains("Echo"));
        assert!(registry.contains(<MetaServiceImpl as MetaService>::NAME));

        let arg = Format::Json.encode("hi").unwrap();
        let rsp = registry
            .dispatch(request("Echo", "echo(String)", vec![arg]), None)
            .await
            .unwrap();
        assert_eq!(rsp.txid, 3);
        assert_eq!(rsp.decode::<String>().unwrap(), "hi");

        let rsp = registry
            .dispatch(request("Echo", "echo(String)", vec![]), None)
            .await
            .unwrap();
        let err = rsp.decode::<String>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteFault);
        assert!(err.msg.contains("missing argument #0"), "{err}");
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let registry = ServiceRegistry::create();
        registry.bind(echo_service());

        let rsp = registry
            .dispatch(request("Nope", "x()", vec![]), None)
            .await
            .unwrap();
        let err = rsp.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BindError);
        assert_eq!(err.msg, "service not found: Nope");

        let rsp = registry
            .dispatch(request("Echo", "nope()", vec![]), None)
            .await
            .unwrap();
        let err = rsp.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BindError);
        assert_eq!(err.msg, "method not found: Echo/nope()");

        let rsp = registry
            .dispatch(request("Echo", "fail()", vec![]), None)
            .await
            .unwrap();
        let err = rsp.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteFault);
        assert_eq!(err.msg, "InvalidArgument: bad input");

        let rsp = registry
            .dispatch(request("Echo", "panic()", vec![]), None)
            .await
            .unwrap();
        let err = rsp.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteFault);
        assert_eq!(err.msg, "Echo/panic() panicked");

        // the registry keeps serving after a panic.
        let arg = Format::Json.encode("still here").unwrap();
        let rsp = registry
            .dispatch(request("Echo", "echo(String)", vec![arg]), None)
            .await
            .unwrap();
        assert_eq!(rsp.decode::<String>().unwrap(), "still here");
    }

    #[tokio::test]
    async fn test_oneway_and_rebind() {
        let registry = ServiceRegistry::create();
        registry.bind(echo_service());

        let mut req = request("Echo", "fail()", vec![]);
        req.oneway = true;
        assert!(registry.dispatch(req, None).await.is_none());

        let replaced = registry.bind(echo_service().with_name("Echo")).unwrap();
        assert_eq!(replaced.name(), "Echo");
        registry.bind(echo_service().with_name("Echo2"));
        assert_eq!(
            registry.method_names("Echo2").unwrap(),
            vec!["echo(String)", "fail()", "panic()"]
        );

        assert!(registry.unbind("Echo").is_some());
        assert!(!registry.contains("Echo"));
        assert!(registry.method_names("Echo").is_none());
        assert_eq!(registry.service_names(), vec!["Echo2", "twinrpc.Meta"]);
    }
}
