use async_trait::async_trait;

pub mod channel;
pub mod tcp;

/// A persistent, ordered byte pipe. Chunk boundaries carry no meaning; the
/// peer's [`ValueDecoder`](crate::codec::json::ValueDecoder) finds message
/// boundaries.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Next chunk from the peer. Fails once the peer has closed.
    async fn receive(&self) -> anyhow::Result<Vec<u8>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
