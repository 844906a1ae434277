//! Async client for knxd's framed host protocol
//!
//! [`KnxClient::connect`] dials `tcp://host:port` or `unix:///path`, enters
//! group-socket mode with an `EIB_OPEN_GROUPCON` handshake, and spawns a
//! single receive task. Received group packets are parsed and handed to the
//! registered handler on a fresh task; a panicking handler is logged and
//! swallowed, never taking the receive loop down.
//!
//! Writes are serialised by a connection-wide mutex. Counters are lock-free
//! atomics so `stats()` never contends with the hot path.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::KnxConfig;
use crate::error::{Error, Result};
use crate::knx::telegram::{
    encode_close, encode_open_groupcon, Telegram, EIB_GROUP_PACKET, EIB_OPEN_GROUPCON,
    MAX_FRAME_LEN,
};
use crate::knx::GroupAddress;
use crate::util::panic_message;

/// Callback invoked for every received group telegram
///
/// Handlers run on their own task and must not block; callers wanting queue
/// semantics build one on top.
pub type TelegramHandler = Arc<dyn Fn(Telegram) + Send + Sync>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Point-in-time connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnxStats {
    /// Telegrams successfully written
    pub telegrams_tx: u64,
    /// Telegrams successfully parsed off the wire
    pub telegrams_rx: u64,
    /// Frames that failed to parse
    pub errors_total: u64,
    /// Instant of the last send or receive
    pub last_activity: Option<DateTime<Utc>>,
    /// Whether the connection is currently up
    pub connected: bool,
}

struct Inner {
    writer: Mutex<Option<BoxWriter>>,
    handler: RwLock<Option<TelegramHandler>>,
    connected: AtomicBool,
    telegrams_tx: AtomicU64,
    telegrams_rx: AtomicU64,
    errors_total: AtomicU64,
    last_activity_ms: AtomicI64,
    shutdown: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl Inner {
    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Client for a single knxd group-socket connection
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct KnxClient {
    inner: Arc<Inner>,
}

impl KnxClient {
    /// Dial knxd and enter group-socket mode
    ///
    /// Fails with [`Error::ConnectionFailed`] when the dial, the handshake
    /// write, or the ack read exceed the configured connect timeout, or when
    /// the daemon answers with anything but an `EIB_OPEN_GROUPCON` ack.
    pub async fn connect(config: &KnxConfig) -> Result<Self> {
        let connect_timeout = config.connect_timeout();
        let (mut reader, mut writer) = dial(&config.url, connect_timeout).await?;

        let ack = tokio::time::timeout(connect_timeout, async {
            writer.write_all(&encode_open_groupcon()).await?;
            writer.flush().await?;
            read_frame(&mut reader, None).await
        })
        .await
        .map_err(|_| Error::ConnectionFailed("open-groupcon handshake timed out".to_string()))?
        .map_err(|e| Error::ConnectionFailed(format!("open-groupcon handshake: {}", e)))?;

        let ack_type = u16::from_be_bytes([ack[2], ack[3]]);
        if ack_type != EIB_OPEN_GROUPCON {
            return Err(Error::ConnectionFailed(format!(
                "unexpected open-groupcon ack type {:#06x}",
                ack_type
            )));
        }

        let inner = Arc::new(Inner {
            writer: Mutex::new(Some(writer)),
            handler: RwLock::new(None),
            connected: AtomicBool::new(true),
            telegrams_tx: AtomicU64::new(0),
            telegrams_rx: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            recv_task: Mutex::new(None),
            write_timeout: connect_timeout,
        });
        inner.touch();

        let handle = tokio::spawn(recv_loop(inner.clone(), reader, config.read_timeout()));
        *inner.recv_task.lock().await = Some(handle);

        tracing::info!(url = %config.url, "knxd connection established");
        Ok(Self { inner })
    }

    /// Register (or replace) the telegram handler
    pub fn set_on_telegram<F>(&self, handler: F)
    where
        F: Fn(Telegram) + Send + Sync + 'static,
    {
        *self.inner.handler.write().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    /// Send a GroupValue_Write
    pub async fn send(&self, destination: GroupAddress, payload: Vec<u8>) -> Result<()> {
        self.send_telegram(Telegram::write(destination, payload))
            .await
    }

    /// Send a GroupValue_Read
    pub async fn send_read(&self, destination: GroupAddress) -> Result<()> {
        self.send_telegram(Telegram::read(destination)).await
    }

    /// Send an arbitrary telegram
    pub async fn send_telegram(&self, telegram: Telegram) -> Result<()> {
        let frame = telegram.encode()?;

        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        tokio::time::timeout(self.inner.write_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| Error::ConnectionFailed("telegram write timed out".to_string()))??;

        self.inner.telegrams_tx.fetch_add(1, Ordering::Relaxed);
        self.inner.touch();
        Ok(())
    }

    /// Whether the connection is currently up
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Read-only liveness probe
    pub fn health_check(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Snapshot the connection counters
    pub fn stats(&self) -> KnxStats {
        let ms = self.inner.last_activity_ms.load(Ordering::Relaxed);
        KnxStats {
            telegrams_tx: self.inner.telegrams_tx.load(Ordering::Relaxed),
            telegrams_rx: self.inner.telegrams_rx.load(Ordering::Relaxed),
            errors_total: self.inner.errors_total.load(Ordering::Relaxed),
            last_activity: (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms).single())
                .flatten(),
            connected: self.inner.connected.load(Ordering::Acquire),
        }
    }

    /// Close the connection and wait for the receive task to drain
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        {
            let mut guard = self.inner.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = tokio::time::timeout(Duration::from_secs(1), async {
                    writer.write_all(&encode_close()).await?;
                    writer.shutdown().await
                })
                .await;
            }
            *guard = None;
        }

        self.inner.connected.store(false, Ordering::Release);

        if let Some(handle) = self.inner.recv_task.lock().await.take() {
            let _ = handle.await;
        }

        tracing::info!("knxd connection closed");
    }
}

async fn dial(url: &str, timeout: Duration) -> Result<(BoxReader, BoxWriter)> {
    if let Some(addr) = url.strip_prefix("tcp://") {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionFailed(format!("dial {} timed out", url)))?
            .map_err(|e| Error::ConnectionFailed(format!("dial {}: {}", url, e)))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    } else if let Some(path) = url.strip_prefix("unix://") {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| Error::ConnectionFailed(format!("dial {} timed out", url)))?
            .map_err(|e| Error::ConnectionFailed(format!("dial {}: {}", url, e)))?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    } else {
        Err(Error::ConnectionFailed(format!(
            "unsupported transport URL: {}",
            url
        )))
    }
}

/// Read one length-prefixed frame
///
/// The wait for the length word is unbounded (a quiet bus is not an error);
/// `body_timeout`, when given, bounds the read of the remainder so a stalled
/// peer cannot wedge the loop mid-frame.
async fn read_frame(
    reader: &mut BoxReader,
    body_timeout: Option<Duration>,
) -> std::io::Result<Vec<u8>> {
    use std::io::{Error as IoError, ErrorKind};

    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let total = u16::from_be_bytes(len_buf) as usize;

    if total < 4 || total > MAX_FRAME_LEN {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame length {} out of bounds", total),
        ));
    }

    let mut frame = vec![0u8; total];
    frame[..2].copy_from_slice(&len_buf);

    let body = reader.read_exact(&mut frame[2..]);
    match body_timeout {
        Some(bound) => {
            tokio::time::timeout(bound, body)
                .await
                .map_err(|_| IoError::new(ErrorKind::TimedOut, "frame body read timed out"))??;
        }
        None => {
            body.await?;
        }
    }

    Ok(frame)
}

async fn recv_loop(inner: Arc<Inner>, mut reader: BoxReader, read_timeout: Duration) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = read_frame(&mut reader, Some(read_timeout)) => match result {
                Ok(frame) => dispatch_frame(&inner, frame),
                Err(e) => {
                    if !inner.shutdown.is_cancelled() {
                        tracing::warn!(error = %e, "knxd receive loop terminated");
                    }
                    break;
                }
            }
        }
    }

    inner.connected.store(false, Ordering::Release);
}

fn dispatch_frame(inner: &Arc<Inner>, frame: Vec<u8>) {
    let msg_type = u16::from_be_bytes([frame[2], frame[3]]);
    if msg_type != EIB_GROUP_PACKET {
        // Acks and administrative frames are not telegrams
        return;
    }

    match Telegram::decode(&frame) {
        Ok(telegram) => {
            inner.telegrams_rx.fetch_add(1, Ordering::Relaxed);
            inner.touch();

            let handler = inner
                .handler
                .read()
                .expect("handler lock poisoned")
                .clone();
            if let Some(handler) = handler {
                tokio::spawn(async move {
                    if let Err(payload) = std::panic::catch_unwind(
                        std::panic::AssertUnwindSafe(|| handler(telegram)),
                    ) {
                        tracing::error!(
                            panic = %panic_message(payload),
                            "telegram handler panicked"
                        );
                    }
                });
            }
        }
        Err(e) => {
            inner.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "dropping unparseable frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knx::telegram::encode_frame;
    use crate::knx::Apci;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> KnxConfig {
        KnxConfig {
            url: format!("tcp://127.0.0.1:{}", port),
            connect_timeout_secs: 2,
            read_timeout_secs: 2,
        }
    }

    /// Accept one client, perform the group-socket handshake, and return the
    /// server side of the socket.
    async fn fake_knxd(listener: TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.expect("accept");

        let mut len_buf = [0u8; 2];
        socket.read_exact(&mut len_buf).await.expect("open len");
        let total = u16::from_be_bytes(len_buf) as usize;
        let mut rest = vec![0u8; total - 2];
        socket.read_exact(&mut rest).await.expect("open body");
        assert_eq!(u16::from_be_bytes([rest[0], rest[1]]), EIB_OPEN_GROUPCON);

        socket
            .write_all(&encode_open_groupcon())
            .await
            .expect("ack");
        socket
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut socket = fake_knxd(listener).await;
            let frame = Telegram::write(GroupAddress::new(1, 0, 1).unwrap(), vec![0x01])
                .encode()
                .unwrap();
            socket.write_all(&frame).await.unwrap();
            socket
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_on_telegram(move |telegram| {
            let _ = tx.send(telegram);
        });

        let telegram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("telegram within deadline")
            .expect("channel open");
        assert_eq!(telegram.destination, GroupAddress::new(1, 0, 1).unwrap());
        assert_eq!(telegram.apci, Apci::Write);
        assert_eq!(telegram.payload, vec![0x01]);

        let stats = client.stats();
        assert_eq!(stats.telegrams_rx, 1);
        assert!(stats.connected);

        client.close().await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut socket = fake_knxd(listener).await;
            let mut len_buf = [0u8; 2];
            socket.read_exact(&mut len_buf).await.expect("frame len");
            let total = u16::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; total];
            frame[..2].copy_from_slice(&len_buf);
            socket.read_exact(&mut frame[2..]).await.expect("frame body");
            frame
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");
        client
            .send(GroupAddress::new(1, 0, 1).unwrap(), vec![0x01])
            .await
            .expect("send");

        let frame = server.await.unwrap();
        assert_eq!(
            frame,
            vec![0x00, 0x0A, 0x00, 0x27, 0x00, 0x00, 0x08, 0x01, 0x00, 0x81]
        );
        assert_eq!(client.stats().telegrams_tx, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn test_send_after_close_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _socket = fake_knxd(listener).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");
        client.close().await;

        let result = client.send_read(GroupAddress::new(1, 0, 1).unwrap()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(client.health_check().is_err());
    }

    #[tokio::test]
    async fn test_remote_eof_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let socket = fake_knxd(listener).await;
            drop(socket); // remote hangs up
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");
        let _ = server.await;

        // Receive loop notices EOF and clears the flag
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("disconnect observed");
    }

    #[tokio::test]
    async fn test_parse_errors_counted_and_loop_continues() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut socket = fake_knxd(listener).await;
            // Group packet with reserved APCI bits: parses as invalid
            let bad = encode_frame(EIB_GROUP_PACKET, &[0, 0, 0x08, 0x01, 0x00, 0xC0]);
            socket.write_all(&bad).await.unwrap();
            // Followed by a valid one
            let good = Telegram::write(GroupAddress::new(1, 0, 1).unwrap(), vec![0x05])
                .encode()
                .unwrap();
            socket.write_all(&good).await.unwrap();
            socket
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_on_telegram(move |telegram| {
            let _ = tx.send(telegram);
        });

        let telegram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("deadline")
            .expect("open");
        assert_eq!(telegram.payload, vec![0x05]);

        let stats = client.stats();
        assert_eq!(stats.errors_total, 1);
        assert_eq!(stats.telegrams_rx, 1);

        client.close().await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut socket = fake_knxd(listener).await;
            for value in [0x01u8, 0x02] {
                let frame = Telegram::write(GroupAddress::new(1, 0, 1).unwrap(), vec![value])
                    .encode()
                    .unwrap();
                socket.write_all(&frame).await.unwrap();
            }
            socket
        });

        let client = KnxClient::connect(&test_config(port)).await.expect("connect");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_on_telegram(move |telegram| {
            if telegram.payload == vec![0x01] {
                panic!("handler exploded");
            }
            let _ = tx.send(telegram);
        });

        // The second telegram still arrives after the first handler panicked
        let telegram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("deadline")
            .expect("open");
        assert_eq!(telegram.payload, vec![0x02]);
        assert_eq!(client.stats().telegrams_rx, 2);

        client.close().await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_connect_wrong_ack_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 10];
            let _ = socket.read_exact(&mut buf).await;
            // Reply with a close instead of the groupcon ack
            let _ = socket.write_all(&encode_close()).await;
        });

        let result = KnxClient::connect(&test_config(port)).await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port from a listener we immediately drop
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = KnxClient::connect(&test_config(port)).await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }
}
