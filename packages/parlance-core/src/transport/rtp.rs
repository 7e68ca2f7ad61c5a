//! RTP over UDP: packetizer, header parsing and the shared socket.
//!
//! One UDP socket serves every call. Outbound packets come from a per-call
//! packetizer with its own SSRC and random initial sequence/timestamp;
//! inbound packets are routed to calls by source address, learned when the
//! external-media channel is created.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InboundFrame, MediaTransport, TransportError, TransportResult};
use crate::audio::AudioEncoding;

/// RTP payload type for G.711 µ-law.
pub const PAYLOAD_TYPE_ULAW: u8 = 0;
/// RTP payload type for G.711 A-law.
pub const PAYLOAD_TYPE_ALAW: u8 = 8;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 2048;
/// Per-call inbound frame queue depth. Late audio is worthless; frames
/// beyond this are dropped, not queued.
const INBOUND_QUEUE: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Packetizer
// ─────────────────────────────────────────────────────────────────────────────

/// Builds outbound RTP packets for one call.
///
/// Sequence numbers advance by exactly 1 modulo 2^16 and timestamps by the
/// payload's sample count modulo 2^32.
#[derive(Debug)]
pub struct RtpPacketizer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpPacketizer {
    /// Creates a packetizer with a random SSRC and random initial
    /// sequence/timestamp.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            ssrc: rng.gen(),
            sequence: rng.gen(),
            timestamp: rng.gen(),
        }
    }

    /// Creates a packetizer with explicit state.
    pub fn with_state(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Wraps one payload in an RTP header and advances the stream state.
    ///
    /// `bytes_per_sample` is 1 for G.711, 2 for PCM16.
    pub fn packetize(&mut self, payload: &[u8], payload_type: u8, bytes_per_sample: usize) -> Vec<u8> {
        let mut packet = Vec::with_capacity(12 + payload.len());
        packet.push(0x80); // V=2, no padding, no extension, no CSRCs
        packet.push(payload_type & 0x7F);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        let samples = (payload.len() / bytes_per_sample.max(1)) as u32;
        self.timestamp = self.timestamp.wrapping_add(samples);

        packet
    }
}

impl Default for RtpPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed inbound RTP packet borrowing its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

/// Parses an RTP packet: 12-byte header plus optional CSRCs, header
/// extension and padding.
pub fn parse_rtp(data: &[u8]) -> TransportResult<RtpPacket<'_>> {
    if data.len() < 12 {
        return Err(TransportError::InvalidPacket("shorter than RTP header"));
    }
    if data[0] >> 6 != 2 {
        return Err(TransportError::InvalidPacket("unsupported RTP version"));
    }

    let has_padding = data[0] & 0x20 != 0;
    let has_extension = data[0] & 0x10 != 0;
    let csrc_count = (data[0] & 0x0F) as usize;

    let mut offset = 12 + csrc_count * 4;
    if data.len() < offset {
        return Err(TransportError::InvalidPacket("truncated CSRC list"));
    }

    if has_extension {
        if data.len() < offset + 4 {
            return Err(TransportError::InvalidPacket("truncated extension header"));
        }
        let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + words * 4;
        if data.len() < offset {
            return Err(TransportError::InvalidPacket("truncated extension body"));
        }
    }

    let mut end = data.len();
    if has_padding {
        let pad = data[end - 1] as usize;
        if pad == 0 || offset + pad > end {
            return Err(TransportError::InvalidPacket("invalid padding length"));
        }
        end -= pad;
    }

    Ok(RtpPacket {
        payload_type: data[1] & 0x7F,
        sequence: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        payload: &data[offset..end],
    })
}

fn encoding_for_payload_type(payload_type: u8) -> Option<AudioEncoding> {
    match payload_type {
        PAYLOAD_TYPE_ULAW => Some(AudioEncoding::Ulaw),
        PAYLOAD_TYPE_ALAW => Some(AudioEncoding::Alaw),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

struct RtpCallState {
    dest: SocketAddr,
    packetizer: Mutex<RtpPacketizer>,
    frame_tx: mpsc::Sender<InboundFrame>,
}

/// Shared UDP transport for all RTP calls.
pub struct RtpTransport {
    socket: Arc<UdpSocket>,
    local_port: u16,
    /// Inbound routing: Asterisk's RTP source address -> call_id.
    routes: DashMap<SocketAddr, String>,
    /// Per-call outbound state.
    calls: DashMap<String, RtpCallState>,
}

impl RtpTransport {
    /// Binds the engine-wide UDP socket on an ephemeral port and starts
    /// the receive loop.
    pub async fn bind(cancel: CancellationToken) -> TransportResult<Arc<Self>> {
        let addr: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
        let raw = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(TransportError::Bind)?;
        // Media bursts arrive faster than the pump drains under load.
        let _ = raw.set_recv_buffer_size(1 << 20);
        raw.set_nonblocking(true).map_err(TransportError::Bind)?;
        raw.bind(&addr.into()).map_err(TransportError::Bind)?;

        let socket = UdpSocket::from_std(raw.into()).map_err(TransportError::Bind)?;
        let local_port = socket.local_addr().map_err(TransportError::Bind)?.port();

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            local_port,
            routes: DashMap::new(),
            calls: DashMap::new(),
        });

        log::info!("[RTP] Transport bound on UDP port {}", local_port);
        tokio::spawn(Arc::clone(&transport).recv_loop(cancel));
        Ok(transport)
    }

    /// Port the engine receives RTP on (advertised to Asterisk as the
    /// external-media host port).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Registers a call: outbound packets go to `dest`, inbound packets
    /// from `dest` are delivered to `frame_tx`. Returns the SSRC chosen
    /// for the call.
    pub fn register(
        &self,
        call_id: &str,
        dest: SocketAddr,
        frame_tx: mpsc::Sender<InboundFrame>,
    ) -> u32 {
        let packetizer = RtpPacketizer::new();
        let ssrc = packetizer.ssrc();
        self.routes.insert(dest, call_id.to_string());
        self.calls.insert(
            call_id.to_string(),
            RtpCallState {
                dest,
                packetizer: Mutex::new(packetizer),
                frame_tx,
            },
        );
        log::info!(
            "[RTP] Registered call {} -> {} (ssrc {:#010x})",
            call_id,
            dest,
            ssrc
        );
        ssrc
    }

    async fn recv_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("[RTP] recv error: {}", e);
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], src);
                }
            }
        }
        log::info!("[RTP] Receive loop stopped");
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let Some(call_id) = self.routes.get(&src).map(|r| r.value().clone()) else {
            log::trace!("[RTP] Datagram from unknown source {}", src);
            return;
        };

        let packet = match parse_rtp(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("[RTP] Dropping malformed packet from {}: {}", src, e);
                return;
            }
        };

        let Some(encoding) = encoding_for_payload_type(packet.payload_type) else {
            log::trace!(
                "[RTP] Ignoring payload type {} from {}",
                packet.payload_type,
                src
            );
            return;
        };

        if let Some(call) = self.calls.get(&call_id) {
            let frame = InboundFrame {
                payload: Bytes::copy_from_slice(packet.payload),
                encoding,
                sample_rate: 8000,
            };
            // Never block the socket loop on a slow pump; stale audio is
            // worse than lost audio.
            if call.frame_tx.try_send(frame).is_err() {
                log::trace!("[RTP] Inbound queue full for {}, frame dropped", call_id);
            }
        }
    }
}

#[async_trait]
impl MediaTransport for RtpTransport {
    async fn send(&self, call_id: &str, audio: &[u8]) -> bool {
        let Some(call) = self.calls.get(call_id) else {
            log::warn!("[RTP] send for unregistered call {}", call_id);
            return false;
        };
        let packet = call
            .packetizer
            .lock()
            .packetize(audio, PAYLOAD_TYPE_ULAW, 1);
        let dest = call.dest;
        drop(call);

        match self.socket.send_to(&packet, dest).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[RTP] send to {} failed: {}", dest, e);
                false
            }
        }
    }

    fn unregister(&self, call_id: &str) {
        if let Some((_, state)) = self.calls.remove(call_id) {
            self.routes.remove_if(&state.dest, |_, owner| owner == call_id);
            log::info!("[RTP] Unregistered call {}", call_id);
        }
    }

    fn outbound_encoding(&self) -> AudioEncoding {
        AudioEncoding::Ulaw
    }
}

/// Queue depth used for per-call inbound frame channels.
pub fn inbound_channel() -> (mpsc::Sender<InboundFrame>, mpsc::Receiver<InboundFrame>) {
    mpsc::channel(INBOUND_QUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packetizer_sequence_and_timestamp_progress() {
        let mut p = RtpPacketizer::with_state(0x1234_5678, 100, 1000);
        let payload = vec![0u8; 160];

        let pkt = p.packetize(&payload, PAYLOAD_TYPE_ULAW, 1);
        assert_eq!(pkt.len(), 172);
        assert_eq!(pkt[0], 0x80);
        assert_eq!(pkt[1], PAYLOAD_TYPE_ULAW);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 100);
        assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 1000);
        assert_eq!(
            u32::from_be_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]),
            0x1234_5678
        );

        let pkt = p.packetize(&payload, PAYLOAD_TYPE_ULAW, 1);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 101);
        assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 1160);
    }

    #[test]
    fn packetizer_wraps_sequence_and_timestamp() {
        let mut p = RtpPacketizer::with_state(1, 65534, u32::MAX - 100);
        let payload = vec![0u8; 160];

        let sequences: Vec<u16> = (0..4)
            .map(|_| {
                let pkt = p.packetize(&payload, PAYLOAD_TYPE_ULAW, 1);
                u16::from_be_bytes([pkt[2], pkt[3]])
            })
            .collect();
        assert_eq!(sequences, vec![65534, 65535, 0, 1]);

        // Timestamp wrapped modulo 2^32: started at 2^32-101, advanced 640.
        let pkt = p.packetize(&payload, PAYLOAD_TYPE_ULAW, 1);
        let ts = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        assert_eq!(ts, (u32::MAX - 100).wrapping_add(640));
    }

    #[test]
    fn packetizer_timestamp_counts_samples_not_bytes() {
        let mut p = RtpPacketizer::with_state(1, 0, 0);
        let payload = vec![0u8; 320]; // 160 PCM16 samples

        p.packetize(&payload, PAYLOAD_TYPE_ULAW, 2);
        let pkt = p.packetize(&[], PAYLOAD_TYPE_ULAW, 2);
        assert_eq!(u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]), 160);
    }

    #[test]
    fn parse_roundtrip() {
        let mut p = RtpPacketizer::with_state(0xDEAD_BEEF, 42, 4242);
        let payload: Vec<u8> = (0..160).map(|i| i as u8).collect();
        let pkt = p.packetize(&payload, PAYLOAD_TYPE_ULAW, 1);

        let parsed = parse_rtp(&pkt).unwrap();
        assert_eq!(parsed.payload_type, PAYLOAD_TYPE_ULAW);
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.timestamp, 4242);
        assert_eq!(parsed.ssrc, 0xDEAD_BEEF);
        assert_eq!(parsed.payload, &payload[..]);
    }

    #[test]
    fn parse_rejects_short_and_wrong_version() {
        assert!(parse_rtp(&[0x80, 0, 0]).is_err());

        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x40; // version 1
        assert!(parse_rtp(&pkt).is_err());
    }

    #[test]
    fn parse_skips_csrcs_extension_and_padding() {
        // V=2, padding, extension, 1 CSRC.
        let mut pkt = vec![0x80 | 0x20 | 0x10 | 0x01, 0];
        pkt.extend_from_slice(&7u16.to_be_bytes());
        pkt.extend_from_slice(&9u32.to_be_bytes());
        pkt.extend_from_slice(&11u32.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes()); // CSRC
        pkt.extend_from_slice(&[0, 0]); // extension profile
        pkt.extend_from_slice(&1u16.to_be_bytes()); // extension length: 1 word
        pkt.extend_from_slice(&[1, 2, 3, 4]); // extension body
        pkt.extend_from_slice(&[0xAA, 0xBB]); // payload
        pkt.extend_from_slice(&[0, 0, 3]); // 3 bytes padding

        let parsed = parse_rtp(&pkt).unwrap();
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.payload, &[0xAA, 0xBB]);
    }
}
