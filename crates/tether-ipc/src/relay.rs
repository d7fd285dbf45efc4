//! Forwarding topics across a second channel hop.
//!
//! A worker context that needs something only the main context can do sends the request to its
//! immediate peer, which forwards it unchanged over its own channel to the main context and
//! passes the response (or remote error) back.

use crate::channel::{Channel, Result};

#[derive(Debug, Clone)]
pub struct Relay {
    upstream: Channel,
}

impl Relay {
    /// Relay whose forwarded requests are sent on `upstream`.
    pub fn new(upstream: Channel) -> Self {
        Self { upstream }
    }

    /// Serve `topic` on `downstream` by forwarding every request upstream.
    ///
    /// Payloads and transferables are passed through untouched; upstream remote errors reach
    /// the original caller verbatim.
    pub fn forward(&self, downstream: &Channel, topic: &str) -> Result<()> {
        let upstream = self.upstream.clone();
        let upstream_topic = topic.to_owned();
        downstream.receive(topic, move |payload| {
            let response = upstream.send(&upstream_topic, payload);
            async move {
                response.await.map_err(|err| {
                    tracing::debug!(%err, "relayed call failed");
                    err.into_remote()
                })
            }
        })
    }

    pub fn forward_all(&self, downstream: &Channel, topics: &[&str]) -> Result<()> {
        topics
            .iter()
            .try_for_each(|topic| self.forward(downstream, topic))
    }
}
