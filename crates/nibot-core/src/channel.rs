//! Channel contract — the capability every messaging front-end implements.
//!
//! Concrete adapters live outside the core; the bus only needs `name` for
//! routing and `send` for outbound delivery. A channel's receive side
//! publishes inbound envelopes itself.

use async_trait::async_trait;

use crate::types::Envelope;

/// A messaging front-end.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel name, matching `Envelope.channel` and config keys.
    fn name(&self) -> &str;

    /// Begin receiving. Long-running work belongs in a spawned task; this
    /// returns once the channel is listening.
    async fn start(&self) -> anyhow::Result<()>;

    /// Graceful shutdown.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver an outbound envelope. Called by the bus dispatch loop via
    /// the channel's subscriber; errors are logged there and never
    /// propagate.
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;
}
