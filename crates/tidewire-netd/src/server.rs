//! Server assembly and lifecycle.

use std::sync::Arc;

use tidewire_netproto::handshake::HandshakeRequest;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::context::{AuthFn, ContextParts, ServerContext, SessionCallback};
use crate::dispatch::{DispatchLoop, MaintenanceFn};
use crate::error::ServerError;
use crate::handler::registry::HandlerRegistry;
use crate::handler::{Component, ServiceOptions};
use crate::net::tcp::run_tcp_listener;
use crate::pipeline::Pipeline;
use crate::serialize::Serializer;
use crate::session::Session;
use crate::timer::TimerManager;

/// Collects components and hooks. Registration is only possible here, before
/// any connection is accepted.
pub struct ServerBuilder {
    config: ServerConfig,
    registry: HandlerRegistry,
    components: Vec<Arc<dyn Component>>,
    serializer: Serializer,
    pipeline: Pipeline,
    auth: Option<AuthFn>,
    callbacks: Vec<SessionCallback>,
    maintenance: Option<MaintenanceFn>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            components: Vec::new(),
            serializer: Serializer::default(),
            pipeline: Pipeline::new(),
            auth: None,
            callbacks: Vec::new(),
            maintenance: None,
        }
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Register a component's handlers as one service.
    pub fn register<C: Component>(
        &mut self,
        component: Arc<C>,
        opts: ServiceOptions,
    ) -> Result<&mut Self, ServerError> {
        let component: Arc<dyn Component> = component;
        self.registry.register(Arc::clone(&component), &opts)?;
        self.components.push(component);
        Ok(self)
    }

    /// Decide whether a handshaking client is accepted.
    pub fn auth<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Session, Option<&HandshakeRequest>) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(f));
        self
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn serializer(&mut self, serializer: Serializer) -> &mut Self {
        self.serializer = serializer;
        self
    }

    pub fn on_session_closed<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(f));
        self
    }

    /// Run `f` on the dispatch loop after the timers of every cron tick.
    pub fn maintenance<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut() + Send + 'static,
    {
        self.maintenance = Some(Box::new(f));
        self
    }

    /// Freeze the handler table and encode the shared frames.
    pub fn build(self) -> Result<Server, ServerError> {
        let backlog = self.config.packet_backlog.max(1);
        let (work_tx, work_rx) = mpsc::channel(backlog);
        let (close_tx, close_rx) = mpsc::channel(backlog);
        let (timers, timer_rx) = TimerManager::channel();

        let ctx = Arc::new(ServerContext::new(ContextParts {
            config: self.config,
            registry: self.registry,
            serializer: self.serializer,
            pipeline: self.pipeline,
            auth: self.auth,
            callbacks: self.callbacks,
            work_tx,
            close_tx,
            timers,
        })?);

        let shutdown = CancellationToken::new();
        let dispatch = DispatchLoop::new(
            Arc::clone(&ctx),
            work_rx,
            close_rx,
            timer_rx,
            self.maintenance,
            shutdown.clone(),
        );

        Ok(Server {
            ctx,
            dispatch,
            components: self.components,
            shutdown,
        })
    }
}

pub struct Server {
    ctx: Arc<ServerContext>,
    dispatch: DispatchLoop,
    components: Vec<Arc<dyn Component>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Cancelling this token stops the accept loop and the dispatch loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled or accepting fails.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let Self {
            ctx,
            dispatch,
            components,
            shutdown,
        } = self;

        for c in &components {
            c.init(&ctx);
        }
        for c in &components {
            c.after_init();
        }
        ctx.registry().dump_services();

        let dispatch = tokio::spawn(dispatch.run());
        info!(addr = ?listener.local_addr().ok(), "Server started");

        let res = tokio::select! {
            res = run_tcp_listener(listener, Arc::clone(&ctx), shutdown.clone()) => res,
            _ = shutdown.cancelled() => Ok(()),
        };
        shutdown.cancel();

        for c in components.iter().rev() {
            c.before_shutdown();
        }
        for c in components.iter().rev() {
            c.shutdown();
        }

        dispatch.await?;
        info!("Server stopped");
        res
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (Arc<ServerContext>, DispatchLoop) {
        (self.ctx, self.dispatch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::timeout;

    use super::*;
    use crate::handler::{HandlerResult, HandlerSet};

    async fn noop() -> HandlerResult {
        Ok(())
    }

    struct Tracked {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Tracked {
        fn record(&self, hook: &str) {
            self.log.lock().push(format!("{}.{hook}", self.name));
        }
    }

    impl Component for Tracked {
        fn name(&self) -> &str {
            self.name
        }

        fn handlers(self: Arc<Self>, set: &mut HandlerSet) {
            set.notify_raw("ping", |_s, _b| noop());
        }

        fn init(&self, _ctx: &Arc<ServerContext>) {
            self.record("init");
        }

        fn after_init(&self) {
            self.record("after_init");
        }

        fn before_shutdown(&self) {
            self.record("before_shutdown");
        }

        fn shutdown(&self) {
            self.record("shutdown");
        }
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_order_and_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = ServerBuilder::new(ServerConfig::default());
        for name in ["a", "b"] {
            builder
                .register(
                    Arc::new(Tracked {
                        name,
                        log: Arc::clone(&log),
                    }),
                    ServiceOptions::default(),
                )
                .unwrap();
        }
        let server = builder.build().unwrap();
        let shutdown = server.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(server.serve(listener));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(
            *log.lock(),
            [
                "a.init",
                "b.init",
                "a.after_init",
                "b.after_init",
                "b.before_shutdown",
                "a.before_shutdown",
                "b.shutdown",
                "a.shutdown",
            ]
        );
    }

    #[test]
    fn failed_registration_keeps_builder_usable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tracked = || {
            Arc::new(Tracked {
                name: "a",
                log: Arc::clone(&log),
            })
        };
        let mut builder = ServerBuilder::new(ServerConfig::default());
        builder.register(tracked(), ServiceOptions::default()).unwrap();
        assert!(builder.register(tracked(), ServiceOptions::default()).is_err());
        builder
            .register(tracked(), ServiceOptions::default().with_name("b"))
            .unwrap();

        let server = builder.build().unwrap();
        assert_eq!(server.context().registry().len(), 2);
        assert_eq!(server.context().registry().dict().code("b.ping"), Some(2));
    }

    #[tokio::test]
    async fn init_hook_can_register_close_callbacks() {
        struct Watcher(Arc<AtomicUsize>);

        impl Component for Watcher {
            fn name(&self) -> &str {
                "watcher"
            }

            fn handlers(self: Arc<Self>, set: &mut HandlerSet) {
                set.notify_raw("noop", |_s, _b| noop());
            }

            fn init(&self, ctx: &Arc<ServerContext>) {
                let hits = Arc::clone(&self.0);
                ctx.on_session_closed(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let mut builder = ServerBuilder::new(ServerConfig::default());
        builder
            .register(Arc::new(Watcher(Arc::clone(&hits))), ServiceOptions::default())
            .unwrap();
        let server = builder.build().unwrap();
        let ctx = Arc::clone(server.context());
        let shutdown = server.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(server.serve(listener));

        timeout(Duration::from_secs(1), async {
            while ctx.session_callbacks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (agent, _out) = crate::test_support::agent_pair(&ctx);
        agent.close().await;
        timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
