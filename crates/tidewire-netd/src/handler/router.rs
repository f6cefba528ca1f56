use std::sync::Arc;

use tidewire_netproto::message::{Message, MessageType};
use tracing::warn;

use crate::agent::Agent;
use crate::context::ServerContext;
use crate::dispatch::WorkItem;
use crate::error::ServerError;
use crate::session::Responder;

/// Route one client message to its handler and queue the bound call.
///
/// Problems with the message itself drop only that message. The only error
/// returned is [`ServerError::DispatchClosed`], which ends the connection.
/// Blocks while the work queue is full.
pub(crate) async fn process_message(
    ctx: &Arc<ServerContext>,
    agent: &Arc<Agent>,
    msg: Message,
) -> Result<(), ServerError> {
    let mid = match msg.kind {
        MessageType::Request => msg.id,
        MessageType::Notify => 0,
        other => {
            warn!(
                conn_id = agent.conn_id(),
                kind = ?other,
                "Invalid message type from client, dropped"
            );
            return Ok(());
        }
    };

    let Some(handler) = ctx.registry().get(&msg.route) else {
        warn!(conn_id = agent.conn_id(), route = %msg.route, "Handler not found");
        return Ok(());
    };

    let session = agent.session();
    let payload = match ctx.pipeline().run_inbound(session, msg.data) {
        Ok(p) => p,
        Err(e) => {
            warn!(route = %msg.route, error = %e, "Inbound pipeline failed, message dropped");
            return Ok(());
        }
    };

    let responder = (msg.kind == MessageType::Request).then(|| Responder::new(Arc::clone(session), mid));
    let invocation = match handler.bind(ctx.serializer(), Arc::clone(session), payload, responder) {
        Ok(i) => i,
        Err(e) => {
            warn!(route = %msg.route, error = %e, "Message dropped");
            return Ok(());
        }
    };
    session.touch();

    ctx.work_tx
        .send(WorkItem {
            agent: Arc::clone(agent),
            mid,
            route: msg.route,
            invocation,
        })
        .await
        .map_err(|_| ServerError::DispatchClosed)
}
