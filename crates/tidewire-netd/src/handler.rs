//! Business components and the handler table built from them.
//!
//! A [`Component`] declares its handlers into a [`HandlerSet`]; the registry
//! turns each declaration into a [`registry::HandlerDescriptor`] keyed by
//! `service.method`. Argument decoding is fixed at declaration time, so
//! dispatch never inspects types at runtime.

use std::any::type_name;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::context::ServerContext;
use crate::serialize::{SerializeError, Serializer};
use crate::session::{Responder, Session};

pub mod registry;
pub(crate) mod router;

/// Result returned by every handler. Errors are logged, never sent to the client.
pub type HandlerResult = anyhow::Result<()>;

/// A handler call with all of its arguments bound, not yet polled.
pub type Invocation = BoxFuture<'static, HandlerResult>;

type NotifyFn =
    Arc<dyn Fn(Serializer, Arc<Session>, Bytes) -> Result<Invocation, SerializeError> + Send + Sync>;
type RequestFn = Arc<
    dyn Fn(Serializer, Arc<Session>, Bytes, Responder) -> Result<Invocation, SerializeError>
        + Send
        + Sync,
>;

/// How a handler receives its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// The (pipeline-transformed) payload bytes are passed through untouched.
    Raw,
    /// The payload is deserialized into the named type.
    Typed(&'static str),
}

/// Which message type a handler answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Fire-and-forget; the handler gets no [`Responder`].
    Notify,
    /// Reply expected; the handler gets a [`Responder`] bound to the request id.
    Request,
}

#[derive(Clone)]
pub(crate) enum Callable {
    Notify(NotifyFn),
    Request(RequestFn),
}

impl Callable {
    pub(crate) fn kind(&self) -> HandlerKind {
        match self {
            Self::Notify(_) => HandlerKind::Notify,
            Self::Request(_) => HandlerKind::Request,
        }
    }
}

pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) arg: ArgKind,
    pub(crate) callable: Callable,
}

/// Collects the handlers a component exposes.
#[derive(Default)]
pub struct HandlerSet {
    methods: Vec<Method>,
}

impl HandlerSet {
    /// Declare a notify handler taking a deserialized argument.
    pub fn notify<T, F, Fut>(&mut self, method: &str, f: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Session>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        let callable: NotifyFn = Arc::new(
            move |serializer: Serializer,
                  session: Arc<Session>,
                  payload: Bytes|
                  -> Result<Invocation, SerializeError> {
                let arg: T = serializer.unmarshal(&payload)?;
                let f = Arc::clone(&f);
                // Deferred so the whole handler body runs under pcall.
                let invocation: Invocation = Box::pin(async move { (*f)(session, arg).await });
                Ok(invocation)
            },
        );
        self.push(method, ArgKind::Typed(type_name::<T>()), Callable::Notify(callable))
    }

    /// Declare a notify handler taking the raw payload.
    pub fn notify_raw<F, Fut>(&mut self, method: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        let callable: NotifyFn = Arc::new(
            move |_: Serializer,
                  session: Arc<Session>,
                  payload: Bytes|
                  -> Result<Invocation, SerializeError> {
                let f = Arc::clone(&f);
                let invocation: Invocation = Box::pin(async move { (*f)(session, payload).await });
                Ok(invocation)
            },
        );
        self.push(method, ArgKind::Raw, Callable::Notify(callable))
    }

    /// Declare a request handler taking a deserialized argument.
    pub fn request<T, F, Fut>(&mut self, method: &str, f: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Session>, T, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        let callable: RequestFn = Arc::new(
            move |serializer: Serializer,
                  session: Arc<Session>,
                  payload: Bytes,
                  responder: Responder|
                  -> Result<Invocation, SerializeError> {
                let arg: T = serializer.unmarshal(&payload)?;
                let f = Arc::clone(&f);
                let invocation: Invocation =
                    Box::pin(async move { (*f)(session, arg, responder).await });
                Ok(invocation)
            },
        );
        self.push(method, ArgKind::Typed(type_name::<T>()), Callable::Request(callable))
    }

    /// Declare a request handler taking the raw payload.
    pub fn request_raw<F, Fut>(&mut self, method: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<Session>, Bytes, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        let callable: RequestFn = Arc::new(
            move |_: Serializer,
                  session: Arc<Session>,
                  payload: Bytes,
                  responder: Responder|
                  -> Result<Invocation, SerializeError> {
                let f = Arc::clone(&f);
                let invocation: Invocation =
                    Box::pin(async move { (*f)(session, payload, responder).await });
                Ok(invocation)
            },
        );
        self.push(method, ArgKind::Raw, Callable::Request(callable))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn push(&mut self, method: &str, arg: ArgKind, callable: Callable) -> &mut Self {
        self.methods.push(Method {
            name: method.to_owned(),
            arg,
            callable,
        });
        self
    }

    pub(crate) fn into_methods(self) -> Vec<Method> {
        self.methods
    }
}

/// A business component exposing handlers under one service name.
///
/// Lifecycle hooks run in registration order on startup and in reverse order
/// on shutdown.
pub trait Component: Send + Sync + 'static {
    /// Default service name, used unless [`ServiceOptions::with_name`] overrides it.
    fn name(&self) -> &str;

    /// Declare this component's handlers.
    fn handlers(self: Arc<Self>, set: &mut HandlerSet);

    fn init(&self, _ctx: &Arc<ServerContext>) {}

    fn after_init(&self) {}

    fn before_shutdown(&self) {}

    fn shutdown(&self) {}
}

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub(crate) name: Option<String>,
    pub(crate) name_func: Option<fn(&str) -> String>,
}

impl ServiceOptions {
    /// Override the component's service name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Map every declared method name, e.g. to lower-case them.
    pub fn with_name_func(mut self, f: fn(&str) -> String) -> Self {
        self.name_func = Some(f);
        self
    }
}
