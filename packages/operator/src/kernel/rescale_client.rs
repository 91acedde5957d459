//! TCP client for the launcher's in-pod control endpoint.
//!
//! The launcher listens on a fixed port (`++server ++server-port <port>`)
//! and understands a single command, `set_bitmap`:
//!
//! ```text
//! "set_bitmap" | bitmap[old_procs] | new_procs (i32, little endian) | NUL
//! ```
//!
//! `bitmap[i] = 1` iff rank `i` survives the rescale. An expansion keeps
//! every existing rank; a shrink keeps the first `new_procs` ranks. Any
//! response byte within the deadline counts as success.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::traits::BaseRescaler;

/// ASCII command name sent ahead of the body. The body's bitmap bytes are
/// 0x00/0x01, so the receiver can split the frame on the first byte below
/// 0x20.
pub const SET_BITMAP_COMMAND: &[u8] = b"set_bitmap";

/// Encode the `set_bitmap` body: `old_procs` bitmap bytes, the new process
/// count as a little-endian i32, and a terminating NUL.
/// Total length is `old_procs + 5`.
pub fn encode_set_bitmap(old_procs: i32, new_procs: i32) -> Vec<u8> {
    let keep = if new_procs < old_procs {
        new_procs
    } else {
        old_procs
    };
    let mut body = Vec::with_capacity(old_procs as usize + 5);
    for rank in 0..old_procs {
        body.push(if rank < keep { 1 } else { 0 });
    }
    body.extend_from_slice(&new_procs.to_le_bytes());
    body.push(0);
    body
}

/// Rescale client speaking the `set_bitmap` protocol over TCP.
pub struct TcpRescaler {
    timeout: Duration,
}

impl TcpRescaler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl BaseRescaler for TcpRescaler {
    async fn rescale(&self, host: &str, port: u16, old_procs: i32, new_procs: i32) -> Result<()> {
        if old_procs == new_procs {
            return Ok(());
        }

        debug!(host, port, old_procs, new_procs, "issuing set_bitmap");

        let exchange = async {
            let mut stream = TcpStream::connect((host, port))
                .await
                .with_context(|| format!("connecting to launcher at {}:{}", host, port))?;
            stream
                .write_all(SET_BITMAP_COMMAND)
                .await
                .context("writing set_bitmap command")?;
            stream
                .write_all(&encode_set_bitmap(old_procs, new_procs))
                .await
                .context("writing set_bitmap body")?;

            let mut response = [0u8; 1];
            let n = stream
                .read(&mut response)
                .await
                .context("reading launcher response")?;
            if n == 0 {
                bail!("launcher closed the connection without responding");
            }
            Ok(())
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => bail!(
                "launcher at {}:{} did not respond within {:?}",
                host,
                port,
                self.timeout
            ),
        }
    }
}
