use async_trait::async_trait;

/// Admission control for identify handshakes.
///
/// A shard must obtain a grant before sending an identify. This is the only
/// operation permitted to suspend indefinitely. Implementations decide the
/// policy: local concurrency buckets, a coordinator round trip from inside a
/// worker, or an embedder-supplied throttler.
#[async_trait]
pub trait IdentifyGate: Send + Sync {
    async fn wait_to_identify(&self, shard_id: u16);
}

/// Gate that grants immediately. Useful for tests and single-shard setups
/// with no concurrency limit to respect.
pub struct OpenGate;

#[async_trait]
impl IdentifyGate for OpenGate {
    async fn wait_to_identify(&self, _shard_id: u16) {}
}
