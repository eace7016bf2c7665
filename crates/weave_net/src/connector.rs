//! Dialing side of a connection, with fixed-delay reconnect.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConnConfig;
use crate::conn::{ConnHandler, ConnParams, ConnSide, ConnStatus, Connection};
use crate::error::NetError;
use crate::frame::Frame;
use crate::handshake::ClientHandshake;
use crate::identity::Identity;
use crate::transport::{self, TransportKind};

/// Produces the handshake token for each dial, so reconnects can present a
/// fresh one.
pub type TokenSource = Arc<dyn Fn() -> Bytes + Send + Sync>;

/// Where and as whom to dial.
#[derive(Clone)]
pub struct ConnectorParams {
    pub addr: String,
    pub transport: TransportKind,
    /// The identity the acceptor will bind to this connection.
    pub identity: Identity,
    pub token: TokenSource,
    pub config: ConnConfig,
}

impl ConnectorParams {
    pub fn new(addr: impl Into<String>, identity: Identity, token: impl Into<Bytes>) -> Self {
        let token: Bytes = token.into();
        Self {
            addr: addr.into(),
            transport: TransportKind::Tcp,
            identity,
            token: Arc::new(move || token.clone()),
            config: ConnConfig::default(),
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_token_source(mut self, token: TokenSource) -> Self {
        self.token = token;
        self
    }

    pub fn with_config(mut self, config: ConnConfig) -> Self {
        self.config = config;
        self
    }
}

struct ConnectorInner {
    params: ConnectorParams,
    handler: Arc<dyn ConnHandler>,
    status: watch::Sender<ConnStatus>,
    current: Mutex<Option<Arc<Connection>>>,
    closed: watch::Sender<bool>,
}

impl ConnectorInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn set_status(&self, status: ConnStatus) {
        if !self.is_closed() || status == ConnStatus::Closed {
            self.status.send_replace(status);
        }
    }
}

/// Owns the current outbound connection to one address.
///
/// Status moves `Initing -> Connecting -> Connected`, and on a drop to
/// `Disconnected`, from which a reconnect is attempted every
/// `reconnect_delay` (a zero delay disables it). [`close`](Self::close)
/// ends the cycle; dropping the connector closes it too.
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn new(params: ConnectorParams, handler: Arc<dyn ConnHandler>) -> Self {
        let (status, _) = watch::channel(ConnStatus::Initing);
        Self {
            inner: Arc::new(ConnectorInner {
                params,
                handler,
                status,
                current: Mutex::new(None),
                closed: watch::Sender::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.params.addr
    }

    pub fn status(&self) -> ConnStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnStatus> {
        self.inner.status.subscribe()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner
            .current
            .lock()
            .as_ref()
            .filter(|conn| conn.enable())
            .cloned()
    }

    /// Dial once. On failure a reconnect is scheduled when enabled, unless
    /// the acceptor rejected our credentials. The error is still returned.
    pub async fn connect(&self) -> Result<Arc<Connection>, NetError> {
        match dial_once(&self.inner).await {
            Ok(conn) => Ok(conn),
            Err(e) if is_rejection(&e) => {
                error!(addr = %self.inner.params.addr, "Connect rejected, not retrying: {e}");
                self.inner.set_status(ConnStatus::Disconnected);
                Err(e)
            }
            Err(e) => {
                warn!(addr = %self.inner.params.addr, "Connect failed: {e}");
                if !self.inner.is_closed() {
                    self.inner.set_status(ConnStatus::Disconnected);
                    if self.inner.params.config.reconnect_enabled() {
                        schedule_reconnect(Arc::clone(&self.inner));
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the current connection and cancel any pending reconnect.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        if let Some(conn) = self.inner.current.lock().take() {
            conn.close();
        }
        self.inner.set_status(ConnStatus::Closed);
        debug!(addr = %self.inner.params.addr, "Connector closed");
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

/// Errors a redial with the same credentials cannot fix.
fn is_rejection(e: &NetError) -> bool {
    matches!(e, NetError::Auth(_) | NetError::AuthActionNotFound(_))
}

async fn dial_once(inner: &Arc<ConnectorInner>) -> Result<Arc<Connection>, NetError> {
    if inner.is_closed() {
        return Err(NetError::Disconnected);
    }
    inner.set_status(ConnStatus::Connecting);
    let params = &inner.params;
    let config = &params.config;

    let (mut reader, mut writer, remote) = transport::dial(
        params.transport,
        &params.addr,
        config.max_body(),
        config.handshake_timeout,
    )
    .await?;
    let token = (params.token)();
    let conn_id = match ClientHandshake::new(token, config.handshake_timeout)
        .run(&mut reader, &mut writer)
        .await
    {
        Ok(conn_id) => conn_id,
        Err(e) => {
            writer.shutdown().await;
            return Err(e);
        }
    };

    let handler = Arc::new(ReconnectingHandler {
        connector: Arc::downgrade(inner),
        inner: Arc::clone(&inner.handler),
    });

    // Hold the slot while spawning so an immediate close observes the
    // stored connection.
    let mut current = inner.current.lock();
    let conn = Connection::spawn(
        ConnParams {
            conn_id,
            identity: params.identity,
            side: ConnSide::Initiator,
            transport: params.transport,
            remote_addr: remote,
        },
        config.clone(),
        reader,
        writer,
        handler,
    );
    if inner.is_closed() {
        conn.close();
        return Err(NetError::Disconnected);
    }
    *current = Some(Arc::clone(&conn));
    inner.set_status(ConnStatus::Connected);
    drop(current);

    info!(addr = %params.addr, conn_id, identity = %params.identity, "Connected");
    Ok(conn)
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

fn schedule_reconnect(inner: Arc<ConnectorInner>) {
    let delay = inner.params.config.reconnect_delay;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_closed(inner.closed.subscribe()) => return,
            }
            debug!(addr = %inner.params.addr, "Reconnecting");
            match dial_once(&inner).await {
                Ok(_) => return,
                Err(_) if inner.is_closed() => return,
                Err(e) if is_rejection(&e) => {
                    error!(addr = %inner.params.addr, "Reconnect rejected, giving up: {e}");
                    inner.set_status(ConnStatus::Disconnected);
                    return;
                }
                Err(e) => {
                    warn!(addr = %inner.params.addr, "Reconnect failed: {e}");
                    inner.set_status(ConnStatus::Disconnected);
                }
            }
        }
    });
}

/// Forwards to the owner's handler and reconnects after a drop.
struct ReconnectingHandler {
    connector: Weak<ConnectorInner>,
    inner: Arc<dyn ConnHandler>,
}

#[async_trait]
impl ConnHandler for ReconnectingHandler {
    async fn on_packet(&self, conn: &Arc<Connection>, frame: Frame) {
        self.inner.on_packet(conn, frame).await;
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        self.inner.on_closed(conn);
        let Some(connector) = self.connector.upgrade() else {
            return;
        };
        let was_current = {
            let mut current = connector.current.lock();
            match current.as_ref() {
                Some(stored) if Arc::ptr_eq(stored, conn) => {
                    *current = None;
                    true
                }
                _ => false,
            }
        };
        if !was_current || connector.is_closed() {
            return;
        }
        warn!(addr = %connector.params.addr, conn_id = conn.conn_id(), "Connection lost");
        connector.set_status(ConnStatus::Disconnected);
        if connector.params.config.reconnect_enabled() {
            schedule_reconnect(connector);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::conn::testing::NullHandler;
    use crate::handshake::ServerHandshake;
    use crate::identity::Role;
    use crate::transport::{BoxReader, BoxWriter};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const NODE: Identity = Identity {
        user_id: 3,
        role: Role(16),
    };

    /// Accepts handshakes with token "t" and hands out the server halves.
    async fn acceptor() -> (String, mpsc::Receiver<(BoxReader, BoxWriter)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let auth = StaticAuthenticator::new().with_token("t", NODE);
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let (mut r, mut w) = transport::split_tcp(stream, 1024);
                if ServerHandshake::new(&auth, Duration::from_secs(2))
                    .run(&mut r, &mut w)
                    .await
                    .is_ok()
                {
                    let _ = tx.send((r, w)).await;
                }
            }
        });
        (addr, rx)
    }

    fn config(reconnect_ms: u64) -> ConnConfig {
        ConnConfig {
            reconnect_delay: Duration::from_millis(reconnect_ms),
            handshake_timeout: Duration::from_secs(2),
            ..ConnConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (addr, mut accepted) = acceptor().await;
        let connector = Connector::new(
            ConnectorParams::new(addr, NODE, "t").with_config(config(0)),
            Arc::new(NullHandler),
        );
        assert_eq!(connector.status(), ConnStatus::Initing);
        let conn = connector.connect().await.unwrap();
        assert_eq!(connector.status(), ConnStatus::Connected);
        assert_eq!(conn.side(), ConnSide::Initiator);
        assert_eq!(conn.identity(), NODE);
        assert!(accepted.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_bad_token_fails_without_reconnect() {
        let (addr, _accepted) = acceptor().await;
        let connector = Connector::new(
            ConnectorParams::new(addr, NODE, "wrong").with_config(config(0)),
            Arc::new(NullHandler),
        );
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.status(), ConnStatus::Disconnected);
        assert!(connector.connection().is_none());
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        tokio::spawn(async move {
            let auth = StaticAuthenticator::new().with_token("t", NODE);
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let (mut r, mut w) = transport::split_tcp(stream, 1024);
                let _ = ServerHandshake::new(&auth, Duration::from_secs(2))
                    .run(&mut r, &mut w)
                    .await;
            }
        });

        let connector = Connector::new(
            ConnectorParams::new(addr, NODE, "wrong").with_config(config(20)),
            Arc::new(NullHandler),
        );
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, NetError::Auth(_)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(connector.status(), ConnStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let (addr, mut accepted) = acceptor().await;
        let connector = Connector::new(
            ConnectorParams::new(addr, NODE, "t").with_config(config(50)),
            Arc::new(NullHandler),
        );
        let first = connector.connect().await.unwrap();
        let (r, mut w) = accepted.recv().await.unwrap();
        let mut status = connector.subscribe_status();

        // The acceptor hangs up.
        w.shutdown().await;
        drop(r);
        drop(w);

        tokio::time::timeout(Duration::from_secs(5), async {
            status.wait_for(|s| *s == ConnStatus::Disconnected).await.unwrap();
            status.wait_for(|s| *s == ConnStatus::Connected).await.unwrap();
        })
        .await
        .unwrap();

        let second = connector.connection().unwrap();
        assert!(first.is_closed());
        assert_ne!(first.conn_id(), second.conn_id());
        assert!(accepted.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_close_cancels_reconnect() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = Connector::new(
            ConnectorParams::new(addr, NODE, "t").with_config(config(20)),
            Arc::new(NullHandler),
        );
        assert!(connector.connect().await.is_err());
        connector.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.status(), ConnStatus::Closed);
    }
}
