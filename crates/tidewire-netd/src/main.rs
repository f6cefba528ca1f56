use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use tidewire_netd::session::SessionId;
use tidewire_netd::timer::Timer;
use tidewire_netd::{
    Component, HandlerResult, HandlerSet, Responder, ServerBuilder, ServerConfig, ServerContext,
    ServiceOptions, Session,
};

/// Game connection server
#[derive(Parser, Debug)]
#[command(name = "tidewire-netd")]
#[command(about = "Game server connection and dispatch core, with a demo chat room", long_about = None)]
struct Args {
    /// TCP bind address (WebSocket clients use the same port)
    #[arg(short, long, default_value = "0.0.0.0:3250")]
    bind: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    /// Capacity of the pending-work queue
    #[arg(long, default_value_t = 1024)]
    packet_backlog: usize,

    /// Version string reported in the handshake response
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    version: String,
}

type Members = Arc<Mutex<BTreeMap<SessionId, Member>>>;

#[derive(Clone)]
struct Member {
    nickname: String,
    session: Arc<Session>,
}

#[derive(Deserialize)]
struct JoinRequest {
    nickname: String,
}

#[derive(Serialize)]
struct JoinResponse {
    code: i32,
    members: Vec<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Serialize)]
struct ChatBroadcast<'a> {
    from: &'a str,
    content: &'a str,
}

/// Single chat room: clients `join` with a nickname, then every `message`
/// is pushed to all members as `onMessage`.
#[derive(Default)]
struct Room {
    members: Members,
    stats_timer: Mutex<Option<Timer>>,
}

impl Room {
    async fn join(&self, session: Arc<Session>, req: JoinRequest, r: Responder) -> HandlerResult {
        session.bind(session.id());
        let members = {
            let mut members = self.members.lock();
            members.insert(
                session.id(),
                Member {
                    nickname: req.nickname.clone(),
                    session: Arc::clone(&session),
                },
            );
            members.values().map(|m| m.nickname.clone()).collect()
        };
        info!(session_id = session.id(), nickname = %req.nickname, "Member joined");
        r.respond(&JoinResponse { code: 0, members }).await?;
        Ok(())
    }

    async fn message(&self, session: Arc<Session>, msg: ChatMessage) -> HandlerResult {
        let (from, recipients) = {
            let members = self.members.lock();
            let Some(sender) = members.get(&session.id()) else {
                anyhow::bail!("session {} has not joined", session.id());
            };
            (
                sender.nickname.clone(),
                members.values().map(|m| Arc::clone(&m.session)).collect::<Vec<_>>(),
            )
        };

        let broadcast = ChatBroadcast {
            from: &from,
            content: &msg.content,
        };
        for member in recipients {
            if let Err(e) = member.push("room.onMessage", &broadcast).await {
                warn!(session_id = member.id(), error = %e, "Push failed");
            }
        }
        Ok(())
    }
}

impl Component for Room {
    fn name(&self) -> &str {
        "room"
    }

    fn handlers(self: Arc<Self>, set: &mut HandlerSet) {
        let room = Arc::clone(&self);
        set.request("join", move |s, req: JoinRequest, r| {
            let room = Arc::clone(&room);
            async move { room.join(s, req, r).await }
        });
        set.notify("message", move |s, msg: ChatMessage| {
            let room = Arc::clone(&self);
            async move { room.message(s, msg).await }
        });
    }

    fn init(&self, ctx: &Arc<ServerContext>) {
        let members = Arc::clone(&self.members);
        ctx.on_session_closed(move |session| {
            if let Some(m) = members.lock().remove(&session.id()) {
                info!(session_id = session.id(), nickname = %m.nickname, "Member left");
            }
        });

        let members = Arc::clone(&self.members);
        let timer = ctx.timers().new_timer(Duration::from_secs(60), move || {
            info!(members = members.lock().len(), "Room stats");
        });
        *self.stats_timer.lock() = Some(timer);
    }

    fn before_shutdown(&self) {
        if let Some(timer) = self.stats_timer.lock().take() {
            timer.stop();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig {
        heartbeat: Duration::from_secs(args.heartbeat.max(1)),
        packet_backlog: args.packet_backlog,
        version: args.version,
        ..ServerConfig::default()
    };

    let mut builder = ServerBuilder::new(config);
    builder.register(Arc::new(Room::default()), ServiceOptions::default())?;
    let server = builder.build()?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let listener = TcpListener::bind(args.bind).await?;
    info!("Server listening on {}", args.bind);
    info!("Log level: {}", args.log_level);

    server.serve(listener).await
}
