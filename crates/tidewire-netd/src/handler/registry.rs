//! Route → handler table.
//!
//! Built on the [`ServerBuilder`](crate::server::ServerBuilder) before the
//! server starts and frozen inside the shared context afterwards, so lookups
//! need no locking.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tidewire_netproto::dict::RouteDict;
use tracing::info;

use super::{ArgKind, Callable, Component, HandlerKind, HandlerSet, Invocation, ServiceOptions};
use crate::error::ServerError;
use crate::serialize::Serializer;
use crate::session::{Responder, Session};

/// One registered handler.
pub struct HandlerDescriptor {
    route: String,
    service: String,
    method: String,
    arg: ArgKind,
    callable: Callable,
}

impl HandlerDescriptor {
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arg(&self) -> ArgKind {
        self.arg
    }

    pub fn kind(&self) -> HandlerKind {
        self.callable.kind()
    }

    /// Decode `payload` and bind the call's arguments.
    ///
    /// A responder must be supplied exactly when this is a request handler.
    pub(crate) fn bind(
        &self,
        serializer: Serializer,
        session: Arc<Session>,
        payload: Bytes,
        responder: Option<Responder>,
    ) -> Result<Invocation, ServerError> {
        match (&self.callable, responder) {
            (Callable::Notify(f), None) => Ok(f(serializer, session, payload)?),
            (Callable::Request(f), Some(responder)) => {
                Ok(f(serializer, session, payload, responder)?)
            }
            (callable, _) => Err(ServerError::KindMismatch {
                route: self.route.clone(),
                expected: callable.kind(),
            }),
        }
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("route", &self.route)
            .field("kind", &self.kind())
            .field("arg", &self.arg)
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    /// Service name → its routes, in alias order.
    services: BTreeMap<String, Vec<String>>,
    handlers: HashMap<String, HandlerDescriptor>,
    dict: RouteDict,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every handler `component` declares under one service name.
    ///
    /// Either all of the component's routes are added or, on error, none are.
    /// New routes get the next compressed aliases, in route order.
    pub fn register(
        &mut self,
        component: Arc<dyn Component>,
        opts: &ServiceOptions,
    ) -> Result<(), ServerError> {
        let service = opts
            .name
            .clone()
            .unwrap_or_else(|| component.name().to_owned());

        if self.services.contains_key(&service) {
            return Err(ServerError::DuplicateService(service));
        }

        let mut set = HandlerSet::default();
        Arc::clone(&component).handlers(&mut set);
        if set.is_empty() {
            return Err(ServerError::NoHandlers(service));
        }

        let mut methods = BTreeMap::new();
        for method in set.into_methods() {
            let name = match opts.name_func {
                Some(f) => f(&method.name),
                None => method.name.clone(),
            };
            match methods.entry(name) {
                Entry::Occupied(e) => {
                    return Err(ServerError::DuplicateHandler(format!(
                        "{service}.{}",
                        e.key()
                    )));
                }
                Entry::Vacant(e) => {
                    e.insert(method);
                }
            }
        }

        // Routes are prefixed by a fresh service name, so every one needs a new alias.
        if methods.len() > self.dict.remaining() {
            return Err(ServerError::TooManyRoutes(service));
        }

        let mut routes = Vec::with_capacity(methods.len());
        for (name, method) in methods {
            let route = format!("{service}.{name}");
            self.dict.insert(&route)?;
            self.handlers.insert(
                route.clone(),
                HandlerDescriptor {
                    route: route.clone(),
                    service: service.clone(),
                    method: name,
                    arg: method.arg,
                    callable: method.callable,
                },
            );
            routes.push(route);
        }

        info!(service, handlers = routes.len(), "Service registered");
        self.services.insert(service, routes);
        Ok(())
    }

    pub fn get(&self, route: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(route)
    }

    /// Route alias dictionary shared with the message codec and the handshake.
    pub fn dict(&self) -> &RouteDict {
        &self.dict
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Log every registered route.
    pub fn dump_services(&self) {
        for (route, code) in self.dict.iter() {
            if let Some(h) = self.handlers.get(route) {
                info!(route, code, kind = ?h.kind(), arg = ?h.arg(), "Registered handler");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::handler::HandlerResult;

    #[derive(Deserialize)]
    struct Move {
        #[allow(dead_code)]
        x: i32,
    }

    async fn noop() -> HandlerResult {
        Ok(())
    }

    struct Lobby {
        name: &'static str,
    }

    impl Component for Lobby {
        fn name(&self) -> &str {
            self.name
        }

        fn handlers(self: Arc<Self>, set: &mut HandlerSet) {
            set.notify("Move", |_s, _m: Move| noop())
                .request_raw("Ping", |_s, _b, _r| noop());
        }
    }

    struct Twice;

    impl Component for Twice {
        fn name(&self) -> &str {
            "twice"
        }

        fn handlers(self: Arc<Self>, set: &mut HandlerSet) {
            set.notify_raw("a", |_s, _b| noop())
                .notify_raw("A", |_s, _b| noop());
        }
    }

    struct Empty;

    impl Component for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        fn handlers(self: Arc<Self>, _set: &mut HandlerSet) {}
    }

    fn lobby(name: &'static str) -> Arc<dyn Component> {
        Arc::new(Lobby { name })
    }

    #[test]
    fn aliases_follow_route_order_across_services() {
        let mut reg = HandlerRegistry::new();
        let opts = ServiceOptions::default();
        reg.register(lobby("lobby"), &opts).unwrap();
        reg.register(lobby("arena"), &opts).unwrap();

        let dict = reg.dict();
        assert_eq!(dict.code("lobby.Move"), Some(1));
        assert_eq!(dict.code("lobby.Ping"), Some(2));
        assert_eq!(dict.code("arena.Move"), Some(3));
        assert_eq!(dict.code("arena.Ping"), Some(4));

        let ping = reg.get("arena.Ping").unwrap();
        assert_eq!(ping.kind(), HandlerKind::Request);
        assert_eq!(ping.arg(), ArgKind::Raw);
        assert_eq!(ping.service(), "arena");
        assert!(matches!(reg.get("lobby.Move").unwrap().arg(), ArgKind::Typed(t) if t.ends_with("Move")));
    }

    #[test]
    fn duplicate_service_leaves_registry_unchanged() {
        let mut reg = HandlerRegistry::new();
        reg.register(lobby("lobby"), &ServiceOptions::default()).unwrap();

        let err = reg
            .register(lobby("lobby"), &ServiceOptions::default())
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateService(ref s) if s == "lobby"));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.dict().len(), 2);
        assert_eq!(reg.services().count(), 1);
    }

    #[test]
    fn name_option_overrides_component_name() {
        let mut reg = HandlerRegistry::new();
        reg.register(lobby("lobby"), &ServiceOptions::default().with_name("hall"))
            .unwrap();
        assert!(reg.get("hall.Move").is_some());
        assert!(reg.get("lobby.Move").is_none());
    }

    #[test]
    fn name_func_maps_method_names() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            lobby("lobby"),
            &ServiceOptions::default().with_name_func(|m| m.to_lowercase()),
        )
        .unwrap();
        assert!(reg.get("lobby.move").is_some());
        assert!(reg.get("lobby.ping").is_some());
    }

    #[test]
    fn colliding_methods_register_nothing() {
        let mut reg = HandlerRegistry::new();
        let err = reg
            .register(
                Arc::new(Twice),
                &ServiceOptions::default().with_name_func(|m| m.to_lowercase()),
            )
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateHandler(ref r) if r == "twice.a"));
        assert!(reg.is_empty());
        assert!(reg.dict().is_empty());
        assert_eq!(reg.services().count(), 0);
    }

    #[test]
    fn component_without_handlers_is_rejected() {
        let mut reg = HandlerRegistry::new();
        let err = reg
            .register(Arc::new(Empty), &ServiceOptions::default())
            .unwrap_err();
        assert!(matches!(err, ServerError::NoHandlers(_)));
    }

    #[test]
    fn exhausted_aliases_register_nothing() {
        let mut reg = HandlerRegistry::new();
        for i in 0..RouteDict::MAX_ROUTES - 1 {
            reg.dict.insert(&format!("filler.m{i}")).unwrap();
        }

        let err = reg
            .register(lobby("lobby"), &ServiceOptions::default())
            .unwrap_err();
        assert!(matches!(err, ServerError::TooManyRoutes(ref s) if s == "lobby"));
        assert!(reg.is_empty());
        assert_eq!(reg.services().count(), 0);
        assert_eq!(reg.dict().len(), RouteDict::MAX_ROUTES - 1);
        assert_eq!(reg.dict().code("lobby.Move"), None);
    }
}
