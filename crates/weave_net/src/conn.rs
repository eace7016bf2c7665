//! Connection: one authenticated duplex stream and its two I/O loops.
//!
//! After the handshake, a connection runs a write loop that drains a bounded
//! outbound queue (the only writer on the socket, which gives per-connection
//! send ordering) and a read loop that hands every non-control frame to a
//! [`ConnHandler`]. Heartbeats are consumed inside the loops.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ConnConfig;
use crate::error::NetError;
use crate::frame::{ControlKind, Frame, FrameKind};
use crate::identity::{ConnId, Identity};
use crate::route::RouteEnvelope;
use crate::transport::{BoxReader, BoxWriter, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Initing = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Closed = 4,
}

impl ConnStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initing,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            _ => Self::Closed,
        }
    }
}

/// Which end of the handshake this process played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnSide {
    /// Accepted the socket; answers heartbeats.
    Acceptor,
    /// Dialed the socket; originates heartbeats.
    Initiator,
}

/// Receives the inbound traffic of a connection.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// Called from the read loop for every data frame, in arrival order.
    async fn on_packet(&self, conn: &Arc<Connection>, frame: Frame);

    /// Called exactly once, after the connection has been closed.
    fn on_closed(&self, conn: &Arc<Connection>);
}

/// Opaque state attached to a connection by its owner.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Static facts about a connection fixed at handshake completion.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub conn_id: ConnId,
    pub identity: Identity,
    pub side: ConnSide,
    pub transport: TransportKind,
    pub remote_addr: SocketAddr,
}

pub struct Connection {
    params: ConnParams,
    config: ConnConfig,
    status: AtomicU8,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
    user_data: Mutex<Option<UserData>>,
    created_at: DateTime<Utc>,
    epoch: Instant,
    // Milliseconds since `epoch`.
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    dropped_frames: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.params.conn_id)
            .field("identity", &self.params.identity)
            .field("side", &self.params.side)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    /// Wrap handshaken transport halves in a connection and start its loops.
    pub fn spawn(
        params: ConnParams,
        config: ConnConfig,
        reader: BoxReader,
        writer: BoxWriter,
        handler: Arc<dyn ConnHandler>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.send_queue_depth.max(1));
        let conn = Arc::new(Self {
            params,
            config,
            status: AtomicU8::new(ConnStatus::Connected as u8),
            outbound: tx,
            closed: watch::Sender::new(false),
            user_data: Mutex::new(None),
            created_at: Utc::now(),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        });

        debug!(
            conn_id = conn.conn_id(),
            identity = %conn.identity(),
            remote = %conn.remote_addr(),
            "Connection established"
        );

        tokio::spawn(write_loop(Arc::clone(&conn), writer, rx));
        tokio::spawn(read_loop(Arc::clone(&conn), reader, handler));
        conn
    }

    pub fn conn_id(&self) -> ConnId {
        self.params.conn_id
    }

    pub fn identity(&self) -> Identity {
        self.params.identity
    }

    pub fn user_id(&self) -> u32 {
        self.params.identity.user_id
    }

    pub fn role(&self) -> crate::identity::Role {
        self.params.identity.role
    }

    pub fn side(&self) -> ConnSide {
        self.params.side
    }

    pub fn transport(&self) -> TransportKind {
        self.params.transport
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.params.remote_addr
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True iff the connection is `Connected`.
    pub fn enable(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    /// Enqueue a frame without blocking.
    pub fn send(&self, frame: Frame) -> Result<(), NetError> {
        if !self.enable() {
            return Err(self.refuse(NetError::Disconnected));
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(self.refuse(NetError::QueueFull)),
            Err(TrySendError::Closed(_)) => Err(self.refuse(NetError::Disconnected)),
        }
    }

    fn refuse(&self, reason: NetError) -> NetError {
        let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            conn_id = self.conn_id(),
            identity = %self.identity(),
            dropped,
            "Frame dropped: {reason}"
        );
        reason
    }

    pub fn send_route(&self, env: &RouteEnvelope) -> Result<(), NetError> {
        self.send(env.to_frame())
    }

    /// Close the connection. Returns true only for the call that closed it;
    /// later calls have no effect.
    pub fn close(&self) -> bool {
        let prev = self.status.swap(ConnStatus::Closed as u8, Ordering::AcqRel);
        if prev == ConnStatus::Closed as u8 {
            return false;
        }
        debug!(conn_id = self.conn_id(), identity = %self.identity(), "Connection closed");
        self.closed.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnStatus::Closed
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let done = *rx.borrow_and_update();
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.user_data.lock() = data;
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    pub fn take_user_data(&self) -> Option<UserData> {
        self.user_data.lock().take()
    }

    /// Number of frames refused because the outbound queue was full or the
    /// connection was closing.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wall-clock time of the last frame written.
    pub fn last_send_at(&self) -> DateTime<Utc> {
        self.wall_clock(self.last_send_ms.load(Ordering::Relaxed))
    }

    /// Wall-clock time of the last frame read.
    pub fn last_recv_at(&self) -> DateTime<Utc> {
        self.wall_clock(self.last_recv_ms.load(Ordering::Relaxed))
    }

    fn wall_clock(&self, offset_ms: u64) -> DateTime<Utc> {
        self.created_at + chrono::Duration::milliseconds(offset_ms as i64)
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch_send(&self) {
        self.last_send_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn touch_recv(&self) {
        self.last_recv_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Time since the last frame was written. Inbound traffic does not
    /// count: the peer's idle deadline only sees what we send.
    fn send_idle_for(&self) -> Duration {
        let last = self.last_send_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    fn mark_disconnected(&self) {
        let _ = self.status.compare_exchange(
            ConnStatus::Connected as u8,
            ConnStatus::Disconnected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn on_control(&self, kind: ControlKind) {
        match kind {
            ControlKind::Heartbeat => {
                trace!(conn_id = self.conn_id(), "Heartbeat");
                if self.side() == ConnSide::Acceptor {
                    let _ = self.send(Frame::heartbeat());
                }
            }
            other => {
                debug!(conn_id = self.conn_id(), ?other, "Ignoring handshake frame after connect");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// I/O loops
// ---------------------------------------------------------------------------

async fn read_loop(conn: Arc<Connection>, mut reader: BoxReader, handler: Arc<dyn ConnHandler>) {
    let idle_timeout = conn.config.idle_timeout();
    loop {
        let result = tokio::select! {
            _ = conn.closed() => break,
            r = tokio::time::timeout(idle_timeout, reader.read_frame()) => r,
        };
        match result {
            Err(_) => {
                debug!(conn_id = conn.conn_id(), "No traffic within {idle_timeout:?}, closing");
                conn.mark_disconnected();
                break;
            }
            Ok(Err(e)) => {
                debug!(conn_id = conn.conn_id(), "Read ended: {e}");
                conn.mark_disconnected();
                break;
            }
            Ok(Ok(frame)) => {
                conn.touch_recv();
                match frame.kind {
                    FrameKind::Control(kind) => conn.on_control(kind),
                    FrameKind::Data(_) => handler.on_packet(&conn, frame).await,
                }
            }
        }
    }
    conn.close();
    handler.on_closed(&conn);
}

async fn write_loop(conn: Arc<Connection>, mut writer: BoxWriter, mut rx: mpsc::Receiver<Frame>) {
    let heartbeat = conn.config.heartbeat_interval;
    let write_timeout = conn.config.idle_timeout();
    let initiator = conn.side() == ConnSide::Initiator;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = conn.closed() => break,
            _ = ticker.tick(), if initiator => {
                if conn.send_idle_for() < heartbeat {
                    continue;
                }
                Frame::heartbeat()
            }
        };
        if let Err(e) = write_with_timeout(&mut writer, &frame, write_timeout).await {
            debug!(conn_id = conn.conn_id(), "Write failed: {e}");
            conn.mark_disconnected();
            conn.close();
            writer.shutdown().await;
            return;
        }
        conn.touch_send();
    }

    // Flush what was queued before the close.
    while let Ok(frame) = rx.try_recv() {
        if write_with_timeout(&mut writer, &frame, write_timeout).await.is_err() {
            break;
        }
    }
    writer.shutdown().await;
    conn.close();
}

async fn write_with_timeout(
    writer: &mut BoxWriter,
    frame: &Frame,
    timeout: Duration,
) -> Result<(), NetError> {
    tokio::time::timeout(timeout, writer.write_frame(frame))
        .await
        .map_err(|_| NetError::Timeout(timeout))?
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedSender;

    struct Recorder {
        packets: UnboundedSender<Frame>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl ConnHandler for Recorder {
        async fn on_packet(&self, _conn: &Arc<Connection>, frame: Frame) {
            let _ = self.packets.send(frame);
        }

        fn on_closed(&self, _conn: &Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_is_ordered() {
        let (conn, mut far_reader, _far_writer) =
            pipe_conn(Identity::client(1), ConnSide::Acceptor, Arc::new(NullHandler));
        for i in 0..5u8 {
            conn.send(Frame::route(vec![i])).unwrap();
        }
        for i in 0..5u8 {
            let frame = far_reader.read_frame().await.unwrap();
            assert_eq!(&frame.body[..], &[i]);
        }
        assert!(conn.last_send_at() >= conn.created_at());
    }

    #[tokio::test]
    async fn test_packets_reach_handler_and_heartbeats_do_not() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            packets: tx,
            closed: AtomicUsize::new(0),
        });
        let (conn, mut far_reader, mut far_writer) =
            pipe_conn(Identity::client(2), ConnSide::Acceptor, recorder.clone());

        far_writer.write_frame(&Frame::heartbeat()).await.unwrap();
        far_writer
            .write_frame(&Frame::route(Bytes::from_static(b"data")))
            .await
            .unwrap();

        // The acceptor answers the heartbeat.
        let reply = far_reader.read_frame().await.unwrap();
        assert_eq!(reply.kind, FrameKind::Control(ControlKind::Heartbeat));

        let packet = rx.recv().await.unwrap();
        assert_eq!(&packet.body[..], b"data");
        assert!(conn.enable());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            packets: tx,
            closed: AtomicUsize::new(0),
        });
        let (conn, _r, _w) = pipe_conn(Identity::client(3), ConnSide::Acceptor, recorder.clone());

        assert!(conn.close());
        for _ in 0..10 {
            assert!(!conn.close());
        }
        conn.closed().await;
        assert_eq!(conn.status(), ConnStatus::Closed);
        assert!(matches!(
            conn.send(Frame::heartbeat()),
            Err(NetError::Disconnected)
        ));
        assert_eq!(conn.dropped_frames(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_once() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            packets: tx,
            closed: AtomicUsize::new(0),
        });
        let (conn, far_reader, far_writer) =
            pipe_conn(Identity::client(4), ConnSide::Acceptor, recorder.clone());
        drop(far_reader);
        drop(far_writer);

        conn.closed().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_closed());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let (conn, _far_reader, _far_writer) =
            pipe_conn(Identity::client(5), ConnSide::Acceptor, Arc::new(NullHandler));
        tokio::time::sleep(ConnConfig::default().idle_timeout() + Duration::from_secs(1)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_sends_heartbeat_when_idle() {
        let (_conn, mut far_reader, _far_writer) =
            pipe_conn(Identity::client(6), ConnSide::Initiator, Arc::new(NullHandler));
        let frame = far_reader.read_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Control(ControlKind::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_heartbeats_while_only_receiving() {
        let (_conn, mut far_reader, mut far_writer) =
            pipe_conn(Identity::client(9), ConnSide::Initiator, Arc::new(NullHandler));

        // The far end pushes data every 5s and never sends anything else.
        let pusher = tokio::spawn(async move {
            loop {
                if far_writer
                    .write_frame(&Frame::route(Bytes::from_static(b"push")))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let idle = ConnConfig::default().idle_timeout();
        let frame = tokio::time::timeout(idle, far_reader.read_frame())
            .await
            .expect("heartbeat within the peer's idle window")
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Control(ControlKind::Heartbeat));
        pusher.abort();
    }

    #[tokio::test]
    async fn test_full_queue_counts_drops() {
        let (conn, _far_reader, _far_writer) =
            pipe_conn(Identity::client(7), ConnSide::Acceptor, Arc::new(NullHandler));
        // Nobody reads the far end; once the pipe buffer and queue fill up,
        // sends are refused rather than blocking.
        let big = Bytes::from(vec![0u8; 60_000]);
        let mut refused = 0;
        for _ in 0..64 {
            if matches!(conn.send(Frame::route(big.clone())), Err(NetError::QueueFull)) {
                refused += 1;
            }
        }
        assert!(refused > 0);
        assert_eq!(conn.dropped_frames(), refused);
    }

    #[tokio::test]
    async fn test_user_data() {
        let conn = null_conn(Identity::client(8));
        assert!(conn.user_data().is_none());
        conn.set_user_data(Some(Arc::new(42u32)));
        let data = conn.user_data().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&42));
        assert!(conn.take_user_data().is_some());
        assert!(conn.user_data().is_none());
    }
}
