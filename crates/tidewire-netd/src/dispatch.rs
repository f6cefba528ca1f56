//! The single coordinating loop.
//!
//! Multiplexes pending handler work, session-close notifications, the cron
//! tick and timer registration, picking among ready branches at random so no
//! source can starve the others. Handler invocations are spawned, so a slow
//! handler never stalls the loop; close callbacks, timers and maintenance run
//! on the loop itself.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{Agent, AgentState};
use crate::context::ServerContext;
use crate::handler::Invocation;
use crate::pcall::{call_protected, pcall};
use crate::session::Session;
use crate::timer::{TimerChannels, TimerTable};

/// A routed message with its handler call fully bound.
pub(crate) struct WorkItem {
    pub(crate) agent: Arc<Agent>,
    /// Request id, 0 for notifies.
    pub(crate) mid: u64,
    pub(crate) route: String,
    pub(crate) invocation: Invocation,
}

pub type MaintenanceFn = Box<dyn FnMut() + Send>;

pub(crate) struct DispatchLoop {
    ctx: Arc<ServerContext>,
    pub(crate) work_rx: mpsc::Receiver<WorkItem>,
    pub(crate) close_rx: mpsc::Receiver<Arc<Session>>,
    timer_rx: TimerChannels,
    timers: TimerTable,
    maintenance: Option<MaintenanceFn>,
    shutdown: CancellationToken,
}

impl DispatchLoop {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        work_rx: mpsc::Receiver<WorkItem>,
        close_rx: mpsc::Receiver<Arc<Session>>,
        timer_rx: TimerChannels,
        maintenance: Option<MaintenanceFn>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            work_rx,
            close_rx,
            timer_rx,
            timers: TimerTable::default(),
            maintenance,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let precision = self.ctx.config().timer_precision;
        let mut ticker = interval_at(Instant::now() + precision, precision);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(?precision, "Dispatch loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(item) = self.work_rx.recv() => self.dispatch(item),

                Some(session) = self.close_rx.recv() => self.session_closed(&session),

                _ = ticker.tick() => self.cron(),

                Some(entry) = self.timer_rx.created_rx.recv() => self.timers.insert(entry),

                Some(id) = self.timer_rx.closing_rx.recv() => self.timers.remove(id),
            }
        }

        self.work_rx.close();
        self.close_rx.close();
        let mut dropped = 0usize;
        while self.work_rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(
            dropped_work = dropped,
            timers = self.timers.len(),
            "Dispatch loop stopped"
        );
    }

    fn dispatch(&self, item: WorkItem) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let WorkItem {
            agent,
            mid,
            route,
            invocation,
        } = item;

        if agent.state() == AgentState::Closed {
            debug!(conn_id = agent.conn_id(), %route, "Session closed, work dropped");
            return;
        }
        if mid > 0 {
            agent.set_last_mid(mid);
        }

        tokio::spawn(async move {
            pcall(&route, invocation).await;
            drop(agent);
        });
    }

    fn session_closed(&self, session: &Arc<Session>) {
        for cb in self.ctx.session_callbacks() {
            call_protected("session closed callback", || cb(session));
        }
    }

    fn cron(&mut self) {
        self.timers.fire_due(Instant::now());
        if let Some(f) = self.maintenance.as_mut() {
            call_protected("maintenance", || f());
        }
    }
}
