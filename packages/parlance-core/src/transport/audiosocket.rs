//! AudioSocket transport: framed TCP audio from Asterisk.
//!
//! Asterisk dials our listener; each accepted connection begins with a
//! text protocol header terminated by a double line break, after which the
//! stream is raw audio. Correlation with a call happens externally: the
//! engine dials with a fresh UUID, then binds the next accepted
//! connection to the call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{InboundFrame, MediaTransport, TransportError, TransportResult};
use crate::audio::AudioEncoding;

/// Header scan limit. A stream with no delimiter within this many bytes
/// is treated entirely as audio.
const HEADER_MAX_BYTES: usize = 2048;
/// Per-connection inbound queue depth.
const INBOUND_QUEUE: usize = 64;
/// Read buffer size.
const READ_BUF: usize = 4096;

struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    frame_tx: mpsc::Sender<InboundFrame>,
    /// Set when the engine binds this connection to a call.
    call_id: parking_lot::RwLock<Option<String>>,
}

/// TCP server accepting AudioSocket connections from Asterisk.
pub struct AudioSocketServer {
    local_addr: SocketAddr,
    conns: DashMap<String, Arc<Connection>>,
    /// call_id -> conn_id for the outbound path.
    call_index: DashMap<String, String>,
    /// Frame receivers for accepted-but-unbound connections.
    unbound_frames: DashMap<String, mpsc::Receiver<InboundFrame>>,
    /// Accepted-but-unbound connection ids, in arrival order.
    pending_rx: Mutex<mpsc::Receiver<String>>,
    pending_tx: mpsc::Sender<String>,
    /// Engine notification: a bound connection went away (call_id).
    disconnect_tx: mpsc::Sender<String>,
    /// Inbound audio format. Asterisk AudioSocket defaults to µ-law 8 kHz.
    inbound_encoding: AudioEncoding,
    inbound_sample_rate: u32,
}

impl AudioSocketServer {
    /// Binds the listener and starts accepting connections.
    ///
    /// `disconnect_tx` receives the call_id whenever a bound connection
    /// closes, so the engine can tear the call down.
    pub async fn start(
        bind_addr: &str,
        disconnect_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> TransportResult<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        log::info!("[AudioSocket] Listening on {}", local_addr);

        let (pending_tx, pending_rx) = mpsc::channel(16);
        let server = Arc::new(Self {
            local_addr,
            conns: DashMap::new(),
            call_index: DashMap::new(),
            unbound_frames: DashMap::new(),
            pending_rx: Mutex::new(pending_rx),
            pending_tx,
            disconnect_tx,
            inbound_encoding: AudioEncoding::Ulaw,
            inbound_sample_rate: 8000,
        });

        tokio::spawn(Arc::clone(&server).accept_loop(listener, cancel));
        Ok(server)
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = Uuid::new_v4().simple().to_string();
                            log::info!(
                                "[AudioSocket] Connection {} accepted from {}",
                                conn_id,
                                peer
                            );
                            self.clone().spawn_connection(conn_id, stream, cancel.clone());
                        }
                        Err(e) => {
                            log::warn!("[AudioSocket] accept failed: {}", e);
                        }
                    }
                }
            }
        }
        log::info!("[AudioSocket] Accept loop stopped");
    }

    fn spawn_connection(
        self: Arc<Self>,
        conn_id: String,
        stream: TcpStream,
        cancel: CancellationToken,
    ) {
        let (reader, writer) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_QUEUE);

        let conn = Arc::new(Connection {
            writer: Mutex::new(writer),
            frame_tx,
            call_id: parking_lot::RwLock::new(None),
        });
        self.conns.insert(conn_id.clone(), Arc::clone(&conn));
        // Parked until the engine binds the connection to a call.
        self.unbound_frames.insert(conn_id.clone(), frame_rx);

        if self.pending_tx.try_send(conn_id.clone()).is_err() {
            log::warn!(
                "[AudioSocket] Pending queue full; connection {} may not be assignable",
                conn_id
            );
        }

        tokio::spawn(self.read_loop(conn_id, reader, conn, cancel));
    }

    async fn read_loop(
        self: Arc<Self>,
        conn_id: String,
        mut reader: OwnedReadHalf,
        conn: Arc<Connection>,
        cancel: CancellationToken,
    ) {
        let mut header_buf: Vec<u8> = Vec::new();
        let mut header_pending = true;
        let mut buf = vec![0u8; READ_BUF];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("[AudioSocket] {} read error: {}", conn_id, e);
                        break;
                    }
                }
            };

            let data = &buf[..n];
            if header_pending {
                header_buf.extend_from_slice(data);
                if let Some(end) = find_header_end(&header_buf) {
                    header_pending = false;
                    let audio = header_buf.split_off(end);
                    header_buf = Vec::new();
                    if !audio.is_empty() {
                        self.deliver(&conn, &conn_id, Bytes::from(audio));
                    }
                } else if header_buf.len() > HEADER_MAX_BYTES {
                    // No delimiter within the bound: the whole stream is audio.
                    header_pending = false;
                    let audio = std::mem::take(&mut header_buf);
                    self.deliver(&conn, &conn_id, Bytes::from(audio));
                }
            } else {
                self.deliver(&conn, &conn_id, Bytes::copy_from_slice(data));
            }
        }

        self.drop_connection(&conn_id).await;
    }

    fn deliver(&self, conn: &Connection, conn_id: &str, payload: Bytes) {
        let frame = InboundFrame {
            payload,
            encoding: self.inbound_encoding,
            sample_rate: self.inbound_sample_rate,
        };
        // Never block the read loop on a slow pump; stale audio is worse
        // than lost audio.
        if conn.frame_tx.try_send(frame).is_err() {
            log::trace!("[AudioSocket] Inbound queue full for {}, dropped", conn_id);
        }
    }

    async fn drop_connection(&self, conn_id: &str) {
        let Some((_, conn)) = self.conns.remove(conn_id) else {
            return;
        };
        self.unbound_frames.remove(conn_id);

        let call_id = conn.call_id.read().clone();
        if let Some(call_id) = call_id {
            self.call_index.remove(&call_id);
            log::info!(
                "[AudioSocket] Connection {} for call {} closed",
                conn_id,
                call_id
            );
            let _ = self.disconnect_tx.send(call_id).await;
        } else {
            log::info!("[AudioSocket] Unbound connection {} closed", conn_id);
        }
    }

    /// Waits for the next accepted, unbound connection.
    pub async fn await_connection(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.pending_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Binds an accepted connection to a call, returning the receiver the
    /// call's pump consumes inbound frames from.
    pub fn bind_call(
        &self,
        conn_id: &str,
        call_id: &str,
    ) -> TransportResult<mpsc::Receiver<InboundFrame>> {
        let Some(conn) = self.conns.get(conn_id) else {
            return Err(TransportError::ConnectionClosed(conn_id.to_string()));
        };
        let Some((_, frame_rx)) = self.unbound_frames.remove(conn_id) else {
            return Err(TransportError::ConnectionClosed(conn_id.to_string()));
        };

        *conn.call_id.write() = Some(call_id.to_string());
        self.call_index
            .insert(call_id.to_string(), conn_id.to_string());
        log::info!(
            "[AudioSocket] Bound connection {} to call {}",
            conn_id,
            call_id
        );
        Ok(frame_rx)
    }

    /// Half-closes a connection's write side, prompting the peer to hang up.
    pub async fn close_connection(&self, conn_id: &str) {
        if let Some(conn) = self.conns.get(conn_id).map(|r| Arc::clone(r.value())) {
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

#[async_trait]
impl MediaTransport for AudioSocketServer {
    async fn send(&self, call_id: &str, audio: &[u8]) -> bool {
        let Some(conn_id) = self.call_index.get(call_id).map(|r| r.value().clone()) else {
            log::warn!("[AudioSocket] send for unbound call {}", call_id);
            return false;
        };
        let Some(conn) = self.conns.get(&conn_id).map(|r| Arc::clone(r.value())) else {
            return false;
        };

        let mut writer = conn.writer.lock().await;
        match writer.write_all(audio).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[AudioSocket] write failed for call {}: {}", call_id, e);
                false
            }
        }
    }

    fn unregister(&self, call_id: &str) {
        if let Some((_, conn_id)) = self.call_index.remove(call_id) {
            if let Some(conn) = self.conns.get(&conn_id) {
                *conn.call_id.write() = None;
            }
            log::info!("[AudioSocket] Unregistered call {}", call_id);
        }
    }

    /// AudioSocket wants PCM16 on the downstream path.
    fn outbound_encoding(&self) -> AudioEncoding {
        AudioEncoding::Pcm16
    }
}

/// Finds the end of the protocol header: the byte offset just past
/// `\r\n\r\n` or `\n\n`, whichever appears first.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_finds_crlf_delimiter() {
        let buf = b"AudioSocket v1\r\nFormat: ulaw\r\n\r\n\x01\x02";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[end..], &[0x01, 0x02]);
    }

    #[test]
    fn header_end_finds_bare_lf_delimiter() {
        let buf = b"hello\n\naudio";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[end..], b"audio");
    }

    #[test]
    fn header_end_prefers_earliest_delimiter() {
        let buf = b"a\n\nb\r\n\r\nc";
        assert_eq!(find_header_end(buf), Some(3));
    }

    #[test]
    fn header_end_none_without_delimiter() {
        assert_eq!(find_header_end(b"no delimiter here"), None);
    }

    #[test]
    fn header_end_at_the_last_possible_byte() {
        // Delimiter ends exactly at the 2048-byte bound.
        let mut buf = vec![b'x'; HEADER_MAX_BYTES - 4];
        buf.extend_from_slice(b"\r\n\r\n");
        assert_eq!(find_header_end(&buf), Some(HEADER_MAX_BYTES));
    }

    async fn start_test_server() -> (Arc<AudioSocketServer>, mpsc::Receiver<String>, CancellationToken)
    {
        let (disc_tx, disc_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let server = AudioSocketServer::start("127.0.0.1:0", disc_tx, cancel.clone())
            .await
            .expect("bind test server");
        (server, disc_rx, cancel)
    }

    #[tokio::test]
    async fn header_is_stripped_and_audio_delivered() {
        let (server, _disc, cancel) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(b"AudioSocket\r\n\r\n\x10\x20\x30")
            .await
            .unwrap();

        let conn_id = server
            .await_connection(Duration::from_secs(1))
            .await
            .expect("connection announced");
        let mut frames = server.bind_call(&conn_id, "call-1").unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame.payload[..], &[0x10, 0x20, 0x30]);
        assert_eq!(frame.encoding, AudioEncoding::Ulaw);

        cancel.cancel();
    }

    #[tokio::test]
    async fn outbound_send_reaches_the_peer() {
        let (server, _disc, cancel) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"hdr\n\n").await.unwrap();

        let conn_id = server
            .await_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let _frames = server.bind_call(&conn_id, "call-1").unwrap();

        assert!(server.send("call-1", &[1, 2, 3, 4]).await);

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn closed_connection_notifies_disconnect_with_call_id() {
        let (server, mut disc, cancel) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"hdr\n\n").await.unwrap();

        let conn_id = server
            .await_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let _frames = server.bind_call(&conn_id, "call-9").unwrap();

        drop(client);

        let gone = tokio::time::timeout(Duration::from_secs(1), disc.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gone, "call-9");
        assert!(!server.send("call-9", &[0]).await, "binding dropped");

        cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_header_is_treated_as_audio() {
        let (server, _disc, cancel) = start_test_server().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let blob = vec![0x42u8; HEADER_MAX_BYTES + 100];
        client.write_all(&blob).await.unwrap();

        let conn_id = server
            .await_connection(Duration::from_secs(1))
            .await
            .unwrap();
        let mut frames = server.bind_call(&conn_id, "call-1").unwrap();

        let mut received = 0usize;
        while received < blob.len() {
            let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(frame.payload.iter().all(|&b| b == 0x42));
            received += frame.payload.len();
        }
        assert_eq!(received, blob.len());

        cancel.cancel();
    }
}
