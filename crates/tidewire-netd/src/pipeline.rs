//! Payload transform chains applied around handler dispatch.
//!
//! Inbound stages see request/notify payloads before argument decoding;
//! outbound stages see response/push payloads before encoding. A failing stage
//! stops the chain.

use std::sync::Arc;

use bytes::Bytes;

use crate::session::Session;

pub type PipelineFn = Arc<dyn Fn(&Session, Bytes) -> anyhow::Result<Bytes> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Pipeline {
    inbound: Vec<PipelineFn>,
    outbound: Vec<PipelineFn>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Session, Bytes) -> anyhow::Result<Bytes> + Send + Sync + 'static,
    {
        self.inbound.push(Arc::new(f));
        self
    }

    pub fn push_outbound<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Session, Bytes) -> anyhow::Result<Bytes> + Send + Sync + 'static,
    {
        self.outbound.push(Arc::new(f));
        self
    }

    pub fn run_inbound(&self, session: &Session, data: Bytes) -> anyhow::Result<Bytes> {
        run(&self.inbound, session, data)
    }

    pub fn run_outbound(&self, session: &Session, data: Bytes) -> anyhow::Result<Bytes> {
        run(&self.outbound, session, data)
    }
}

fn run(stages: &[PipelineFn], session: &Session, data: Bytes) -> anyhow::Result<Bytes> {
    stages.iter().try_fold(data, |data, stage| stage(session, data))
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
