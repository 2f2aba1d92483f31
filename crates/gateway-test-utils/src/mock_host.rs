// mock_host: a fake printer host for integration tests.
//
// Binds a Unix socket at a caller-chosen path, accepts exactly one
// connection (mirroring the gateway's own host-link listener), and exposes
// raw frame send/recv so a test can script `register_remote_method`,
// `set_klippy_ready`, status replies, and notifications without a real
// Klipper process.

use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use gateway_protocol::HostEnvelope;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const FRAME_TERMINATOR: u8 = 0x03;

pub struct MockHost {
    path: PathBuf,
    listener: UnixListener,
}

impl MockHost {
    /// Bind a fresh Unix socket at `path`, removing any stale file first.
    pub async fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the single peer the gateway's host link will connect as.
    pub async fn accept(&self) -> std::io::Result<MockHostConn> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(MockHostConn {
            stream,
            buf: BytesMut::new(),
        })
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct MockHostConn {
    stream: UnixStream,
    buf: BytesMut,
}

impl MockHostConn {
    pub async fn send(&mut self, value: impl Serialize) -> std::io::Result<()> {
        let mut payload = serde_json::to_vec(&value).expect("serializable frame");
        payload.push(FRAME_TERMINATOR);
        self.stream.write_all(&payload).await
    }

    /// Read one ETX-terminated frame and parse it as a loose host envelope.
    pub async fn recv(&mut self) -> std::io::Result<HostEnvelope> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == FRAME_TERMINATOR) {
                let frame = self.buf.split_to(pos);
                self.buf.advance(1);
                let env: HostEnvelope = serde_json::from_slice(&frame)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                return Ok(env);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "host link closed",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
