//! NATS JetStream backends for the engine's queue and storage contracts.

mod kv;
mod queue;

pub use kv::JetStreamDataLayer;
pub use queue::JetStreamQueue;

use anyhow::Result;
use async_nats::jetstream::{self, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Connect to NATS and open a JetStream context.
pub async fn connect(nats_url: &str) -> Result<Context> {
    let client = async_nats::connect(nats_url).await?;
    tracing::info!(nats_url = %nats_url, "Connected to NATS");
    Ok(jetstream::new(client))
}

/// Encode an arbitrary name as a single subject/key token.
///
/// Topic names, keyspaces and user keys may contain characters NATS reserves
/// (`.`, `*`, `>`, whitespace). The leading `_` keeps empty names non-empty.
pub(crate) fn token(name: &str) -> String {
    format!("_{}", URL_SAFE_NO_PAD.encode(name))
}
