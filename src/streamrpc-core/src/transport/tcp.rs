use crate::transport::Transport;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 8 * 1024;

/// Raw TCP socket, no framing beyond the JSON values themselves.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("socket closed"));
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}
