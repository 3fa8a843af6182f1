//! Service registry: a build-time table of named services and their
//! (possibly overloaded) methods.
//!
//! ```ignore
//! struct Calc;
//!
//! impl RpcService for Calc {
//!     fn register(self: Arc<Self>, methods: &mut MethodTable) {
//!         methods
//!             .method("add", |a: i64, b: i64| a + b)
//!             .method("add", |a: f64, b: f64| a + b);
//!     }
//! }
//!
//! let registry = Registry::builder().mount(Calc).build();
//! ```
use std::{collections::HashMap, fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use self::handler::{Erased, Invoke};
pub use self::{
    handler::Handler,
    param::{simple_type_name, ConversionError, FromParam, Json, ParamType},
    reply::{Deferred, IntoReply, Reply, ReturnKind, Streamed},
};
use crate::{config::TieBreak, error::RpcError, AnyResult};

mod handler;
mod param;
mod reply;
pub mod resolver;

/// Reserved method returning the directory listing.
pub const LISTING_METHOD: &str = "rpc.services";

/// One registered overload.
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamType>,
    pub returns: ReturnKind,
    invoker: Box<dyn Invoke>,
}

impl MethodDescriptor {
    /// Parameter list as shown in logs, e.g. `int, [string]`.
    pub fn signature(&self) -> String {
        self.params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn stub(&self) -> MethodStub {
        MethodStub {
            name: self.name.clone(),
            params: self.params.iter().map(ToString::to_string).collect(),
            returns: self.returns,
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) -> {:?}", self.name, self.signature(), self.returns)
    }
}

/// Collects the methods of one service during registration.
pub struct MethodTable {
    service: String,
    methods: Vec<MethodDescriptor>,
}

impl MethodTable {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Add an overload of `name`. Registration order is declaration order.
    pub fn method<H, Args>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.methods.push(MethodDescriptor {
            name: name.into(),
            params: H::param_types(),
            returns: H::return_kind(),
            invoker: Box::new(Erased::new(handler)),
        });
        self
    }

    pub fn into_methods(self) -> Vec<MethodDescriptor> {
        self.methods
    }
}

/// A plain object whose methods are exposed for remote calls.
pub trait RpcService: Send + Sync + 'static {
    /// Name the service is mounted under.
    fn name(&self) -> String {
        simple_type_name::<Self>().to_lowercase()
    }

    fn register(self: Arc<Self>, methods: &mut MethodTable);
}

/// Directory entry for one mounted service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceListing {
    pub name: String,
    pub methods: Vec<MethodStub>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodStub {
    pub name: String,
    pub params: Vec<String>,
    pub returns: ReturnKind,
}

struct ServiceEntry {
    name: String,
    methods: Vec<MethodDescriptor>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    services: Vec<ServiceEntry>,
}

impl RegistryBuilder {
    /// Mount `service` under its own [`RpcService::name`].
    pub fn mount<S: RpcService>(self, service: S) -> Self {
        let service = Arc::new(service);
        let name = service.name();
        self.mount_arc(name, service)
    }

    /// Mount `service` under an explicit name.
    pub fn mount_as<S: RpcService>(self, name: impl Into<String>, service: S) -> Self {
        self.mount_arc(name.into(), Arc::new(service))
    }

    pub fn mount_arc<S: RpcService>(mut self, name: String, service: Arc<S>) -> Self {
        let mut table = MethodTable::new(name);
        service.register(&mut table);
        let MethodTable { service: name, methods } = table;
        if let Some(pos) = self.services.iter().position(|s| s.name == name) {
            warn!("service {name} mounted twice, the later one wins");
            self.services.remove(pos);
        }
        self.services.push(ServiceEntry { name, methods });
        self
    }

    pub fn build(self) -> Registry {
        let index = self
            .services
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.name.clone(), idx))
            .collect();
        for service in self.services.iter() {
            info!(
                "service {} mounted with {} methods",
                service.name,
                service.methods.len()
            );
        }
        Registry {
            services: self.services,
            index,
        }
    }
}

/// Immutable after build; shared by every connection.
pub struct Registry {
    services: Vec<ServiceEntry>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.index.contains_key(service)
    }

    pub fn methods(&self, service: &str) -> Option<&[MethodDescriptor]> {
        self.index
            .get(service)
            .map(|&idx| self.services[idx].methods.as_slice())
    }

    /// Resolve `target` and invoke the chosen overload.
    ///
    /// `target` is `service.method`, or a bare method name looked up in
    /// `mount`. The outer error is a resolution failure, the inner result is
    /// the invoked method's own outcome.
    pub fn call(
        &self,
        target: &str,
        mount: Option<&str>,
        params: &[Value],
        tie_break: TieBreak,
    ) -> Result<AnyResult<Reply>, RpcError> {
        if target == LISTING_METHOD && params.is_empty() {
            return Ok(Reply::json(&self.listing()));
        }
        match self.split(target, mount) {
            Some((service, method)) => match self.methods(service) {
                Some(methods) => resolver::resolve(methods, target, method, params, tie_break),
                None => Err(not_found(target, params)),
            },
            None => Err(not_found(target, params)),
        }
    }

    fn split<'a>(&self, target: &'a str, mount: Option<&'a str>) -> Option<(&'a str, &'a str)> {
        if let Some((service, method)) = target.split_once('.') {
            if self.contains(service) {
                return Some((service, method));
            }
        }
        mount.map(|service| (service, target))
    }

    pub fn listing(&self) -> Vec<ServiceListing> {
        self.services
            .iter()
            .map(|s| ServiceListing {
                name: s.name.clone(),
                methods: s.methods.iter().map(MethodDescriptor::stub).collect(),
            })
            .collect()
    }
}

fn not_found(target: &str, params: &[Value]) -> RpcError {
    RpcError::MethodDoesNotExist {
        method: target.to_string(),
        shape: crate::protocol::shape_of(params),
    }
}

#[cfg(test)]
mod tests {
    use futures::{future::ready, stream};
    use serde_json::json;

    use super::*;
    use crate::error::map_error;

    struct Calc;

    impl Calc {
        fn div(&self, a: i64, b: i64) -> AnyResult<i64> {
            if b == 0 {
                anyhow::bail!("division by zero");
            }
            Ok(a / b)
        }
    }

    impl RpcService for Calc {
        fn register(self: Arc<Self>, methods: &mut MethodTable) {
            let calc = self.clone();
            methods
                .method("add", |a: i64, b: i64| a + b)
                .method("div", move |a: i64, b: i64| calc.div(a, b))
                .method("later", |a: i64| {
                    Deferred(ready(Ok::<_, anyhow::Error>(a * 2)))
                })
                .method("count", |n: u32| {
                    Streamed(stream::iter((0..n).map(Ok::<_, anyhow::Error>)))
                });
        }
    }

    fn registry() -> Registry {
        Registry::builder().mount(Calc).build()
    }

    #[test]
    fn test_service_name_defaults_to_lowercase_type_name() {
        assert_eq!(Calc.name(), "calc");
        let registry = registry();
        assert!(registry.contains("calc"));
        assert_eq!(registry.methods("calc").unwrap().len(), 4);
    }

    #[test]
    fn test_call_qualified_and_mounted() {
        let registry = registry();
        for (target, mount) in [("calc.add", None), ("add", Some("calc"))] {
            match registry
                .call(target, mount, &[json!(1), json!(2)], TieBreak::default())
                .unwrap()
                .unwrap()
            {
                Reply::Value(v) => assert_eq!(v, json!(3)),
                other => panic!("unexpected {other:?}"),
            }
        }
        let err = registry
            .call("add", None, &[json!(1), json!(2)], TieBreak::default())
            .unwrap_err();
        assert!(matches!(err, RpcError::MethodDoesNotExist { .. }));
        let err = registry
            .call("nope.add", None, &[], TieBreak::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "method nope.add() does not exist");
    }

    #[test]
    fn test_domain_error_is_passed_through() {
        let err = registry()
            .call("calc.div", None, &[json!(1), json!(0)], TieBreak::default())
            .unwrap()
            .unwrap_err();
        let obj = map_error(&err);
        assert_eq!(obj.code, -32000);
        assert_eq!(obj.message, "division by zero");
    }

    #[test]
    fn test_return_kinds() {
        let registry = registry();
        let reply = |target: &str| {
            registry
                .call(target, None, &[json!(2)], TieBreak::default())
                .unwrap()
                .unwrap()
        };
        assert_eq!(reply("calc.later").kind(), ReturnKind::Deferred);
        assert_eq!(reply("calc.count").kind(), ReturnKind::Stream);
    }

    #[test]
    fn test_listing() {
        let registry = Registry::builder().mount_as("math", Calc).build();
        let listing = registry.listing();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "math");
        assert_eq!(
            serde_json::to_value(&listing[0].methods[0]).unwrap(),
            json!({"name": "add", "params": ["int", "int"], "returns": "value"})
        );
        assert_eq!(listing[0].methods[3].returns, ReturnKind::Stream);

        let Reply::Value(served) = registry
            .call(LISTING_METHOD, None, &[], TieBreak::default())
            .unwrap()
            .unwrap()
        else {
            panic!("listing is a plain value");
        };
        assert_eq!(served, serde_json::to_value(&listing).unwrap());
    }
}
