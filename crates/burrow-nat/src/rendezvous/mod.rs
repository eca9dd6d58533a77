//! Rendezvous peer infrastructure.
//!
//! A rendezvous peer is a mutually reachable third party used for self-port
//! discovery, prepare-to-punch coordination and relayed forwarding. This
//! module provides both sides of the exchange: [`RendezvousChannel`], the
//! correlated request/reply client every stage talks through, and
//! [`RendezvousServer`], the peer implementation behind the `rendezvousd`
//! binary and the integration tests.

pub mod channel;
pub mod server;

pub use channel::{ChannelInbound, RendezvousChannel, Subscription};
pub use server::{RendezvousServer, RendezvousServerConfig};

use crate::error::TraversalError;
use crate::message::RendezvousMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum size of one encoded message (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Write one length-prefixed message to a TCP stream.
pub(crate) async fn write_frame(
    stream: &mut TcpStream,
    msg: &RendezvousMessage,
) -> Result<(), TraversalError> {
    let bytes = msg.to_bytes()?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(TraversalError::ProtocolMismatch("oversized frame".into()));
    }
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Read one length-prefixed message from a TCP stream.
pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<RendezvousMessage, TraversalError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TraversalError::ProtocolMismatch("oversized frame".into()));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    RendezvousMessage::from_bytes(&buf)
}
