//! Media transports carrying call audio between Asterisk and the engine.
//!
//! Two interchangeable implementations share one engine-facing contract:
//! inbound audio arrives on a per-call channel registered at call setup,
//! outbound audio goes through [`MediaTransport::send`]. RTP rides the
//! external-media channel over UDP; AudioSocket is a framed TCP stream.

pub mod audiosocket;
pub mod rtp;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::audio::AudioEncoding;

pub use audiosocket::AudioSocketServer;
pub use rtp::{parse_rtp, RtpPacket, RtpPacketizer, RtpTransport};

/// Errors from media transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not bind the transport socket.
    #[error("Failed to bind socket: {0}")]
    Bind(std::io::Error),

    /// Socket read/write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No binding exists for the call.
    #[error("No transport binding for call {0}")]
    UnknownCall(String),

    /// The peer closed the connection.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Inbound packet could not be parsed.
    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),
}

/// Convenient Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// One inbound audio frame as delivered to a call's pump.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub payload: Bytes,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

/// Outbound half of the transport contract, shared by both implementations.
///
/// Registration is transport-specific (RTP binds a destination address,
/// AudioSocket binds a connection id) and lives on the concrete types.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Sends one outbound audio chunk for a call. Returns false when the
    /// call has no usable binding.
    async fn send(&self, call_id: &str, audio: &[u8]) -> bool;

    /// Drops the call's binding; all per-call transport activity stops.
    fn unregister(&self, call_id: &str);

    /// Encoding the transport expects on the outbound path.
    fn outbound_encoding(&self) -> AudioEncoding;
}
