//! The three wire-facing services and their shared connection plumbing.
//!
//! Connection loops hold one task per accepted socket. Handlers answer
//! business failures with `ERROR` frames; a returned `Err` tears the
//! connection down (bad token, protocol violation, unknown command).

pub mod datanode;
pub mod namenode;
pub mod registry;

use bytes::Bytes;
use ferrio_core::{Command, FerrioError, FrameCodec, Packet, Result};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub(crate) type Wire = Framed<TcpStream, FrameCodec>;

pub(crate) async fn send_reply(
    wire: &mut Wire,
    command: Command,
    data: impl Into<Bytes>,
) -> Result<()> {
    wire.send(Packet::new(command, data)).await?;
    SinkExt::<Packet>::flush(wire).await
}

pub(crate) async fn send_error(wire: &mut Wire, reason: &str) -> Result<()> {
    send_reply(wire, Command::Error, Bytes::from(reason.to_string())).await
}

/// Validate the bearer token; a mismatch is answered with an `ERROR` frame
/// and surfaces as an error so the caller drops the connection.
pub(crate) async fn check_token(wire: &mut Wire, expected: &str, packet: &Packet) -> Result<()> {
    if packet.token.as_deref() == Some(expected) {
        return Ok(());
    }
    tracing::warn!("rejected frame with invalid token: {:?}", packet.command);
    send_error(wire, "Authentication Failed").await?;
    Err(FerrioError::Authentication)
}

pub(crate) async fn reject_unknown(wire: &mut Wire, packet: &Packet) -> Result<()> {
    send_error(wire, "unknown command").await?;
    Err(FerrioError::Protocol(format!(
        "unknown command {:?}",
        packet.command
    )))
}
