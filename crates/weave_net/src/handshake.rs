//! Server-driven handshake run on a raw transport before a [`Connection`]
//! exists.
//!
//! ```text
//! acceptor                          dialer
//!   handshake-start   ------------>
//!   cmd "auth"        ------------>
//!                     <------------  cmd-result <token>
//!   authenticate(token)
//!   handshake-finish <conn id u64 LE> ->
//! ```
//!
//! A rejected token closes the socket without a finish frame. Every step is
//! bounded by the configured handshake timeout.
//!
//! [`Connection`]: crate::conn::Connection

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::error::NetError;
use crate::frame::{ControlKind, Frame, FrameKind};
use crate::identity::{ConnId, Identity, next_conn_id};
use crate::transport::{BoxReader, BoxWriter};

/// The handshake command that asks the dialer for its token.
pub const ACTION_AUTH: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    WaitingAuthCmd,
    WaitingAuthResult,
    Finished,
    Failed,
}

/// Outcome of a successful acceptor-side handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub identity: Identity,
    pub conn_id: ConnId,
}

async fn read_step(
    reader: &mut BoxReader,
    timeout: Duration,
) -> Result<(ControlKind, Bytes), NetError> {
    let frame = tokio::time::timeout(timeout, reader.read_frame())
        .await
        .map_err(|_| NetError::Timeout(timeout))??;
    match frame.kind {
        FrameKind::Control(kind) => Ok((kind, frame.body)),
        FrameKind::Data(_) => Err(NetError::Protocol(
            "data frame before handshake finished".into(),
        )),
    }
}

async fn write_step(writer: &mut BoxWriter, frame: Frame, timeout: Duration) -> Result<(), NetError> {
    tokio::time::timeout(timeout, writer.write_frame(&frame))
        .await
        .map_err(|_| NetError::Timeout(timeout))?
}

fn unexpected(kind: ControlKind, state: HandshakeState) -> NetError {
    NetError::Protocol(format!("unexpected {kind:?} in handshake state {state:?}"))
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

pub struct ServerHandshake<'a> {
    authenticator: &'a dyn Authenticator,
    step_timeout: Duration,
    state: HandshakeState,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(authenticator: &'a dyn Authenticator, step_timeout: Duration) -> Self {
        Self {
            authenticator,
            step_timeout,
            state: HandshakeState::Start,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Finished
    }

    /// Drive the acceptor side to completion. On error the caller must drop
    /// the transport without writing anything else.
    pub async fn run(
        &mut self,
        reader: &mut BoxReader,
        writer: &mut BoxWriter,
    ) -> Result<Accepted, NetError> {
        let result = self.steps(reader, writer).await;
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    async fn steps(
        &mut self,
        reader: &mut BoxReader,
        writer: &mut BoxWriter,
    ) -> Result<Accepted, NetError> {
        let timeout = self.step_timeout;

        write_step(writer, Frame::control(ControlKind::HandshakeStart, Bytes::new()), timeout).await?;
        self.state = HandshakeState::WaitingAuthCmd;

        write_step(
            writer,
            Frame::control(ControlKind::Cmd, Bytes::from_static(ACTION_AUTH.as_bytes())),
            timeout,
        )
        .await?;
        self.state = HandshakeState::WaitingAuthResult;

        let (kind, token) = read_step(reader, timeout).await?;
        if kind != ControlKind::CmdResult {
            return Err(unexpected(kind, self.state));
        }
        let identity = self.authenticator.authenticate(&token)?;

        let conn_id = next_conn_id();
        write_step(
            writer,
            Frame::control(
                ControlKind::HandshakeFinish,
                Bytes::copy_from_slice(&conn_id.to_le_bytes()),
            ),
            timeout,
        )
        .await?;
        self.state = HandshakeState::Finished;
        debug!(%identity, conn_id, "Handshake accepted");
        Ok(Accepted { identity, conn_id })
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Dialer side. Answers named commands from a table; `auth` answers with
/// the token.
pub struct ClientHandshake {
    actions: HashMap<String, Bytes>,
    step_timeout: Duration,
    state: HandshakeState,
}

impl ClientHandshake {
    pub fn new(token: impl Into<Bytes>, step_timeout: Duration) -> Self {
        let mut actions = HashMap::new();
        actions.insert(ACTION_AUTH.to_string(), token.into());
        Self {
            actions,
            step_timeout,
            state: HandshakeState::Start,
        }
    }

    /// Answer an additional named command with a fixed result.
    pub fn with_action(mut self, name: impl Into<String>, result: impl Into<Bytes>) -> Self {
        self.actions.insert(name.into(), result.into());
        self
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Finished
    }

    /// Drive the dialer side to completion and return the assigned conn id.
    pub async fn run(
        &mut self,
        reader: &mut BoxReader,
        writer: &mut BoxWriter,
    ) -> Result<ConnId, NetError> {
        let result = self.steps(reader, writer).await;
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    async fn steps(
        &mut self,
        reader: &mut BoxReader,
        writer: &mut BoxWriter,
    ) -> Result<ConnId, NetError> {
        let timeout = self.step_timeout;

        let (kind, _) = read_step(reader, timeout).await?;
        if kind != ControlKind::HandshakeStart {
            return Err(unexpected(kind, self.state));
        }
        self.state = HandshakeState::WaitingAuthCmd;

        loop {
            let (kind, body) = match read_step(reader, timeout).await {
                Ok(step) => step,
                // The acceptor hangs up without a finish frame on bad tokens.
                Err(NetError::Disconnected | NetError::ShortRead)
                    if self.state == HandshakeState::WaitingAuthResult =>
                {
                    return Err(NetError::Auth("rejected by acceptor".into()));
                }
                Err(e) => return Err(e),
            };

            match kind {
                ControlKind::Cmd => {
                    let action = String::from_utf8_lossy(&body).into_owned();
                    let Some(result) = self.actions.get(&action).cloned() else {
                        warn!(action, "Handshake command not supported");
                        return Err(NetError::AuthActionNotFound(action));
                    };
                    write_step(writer, Frame::control(ControlKind::CmdResult, result), timeout)
                        .await?;
                    self.state = HandshakeState::WaitingAuthResult;
                }
                ControlKind::HandshakeFinish if self.state == HandshakeState::WaitingAuthResult => {
                    if body.is_empty() {
                        return Err(NetError::AckResultFailed);
                    }
                    let raw: [u8; 8] = body[..].try_into().map_err(|_| {
                        NetError::Protocol(format!("finish body of {} bytes", body.len()))
                    })?;
                    self.state = HandshakeState::Finished;
                    return Ok(u64::from_le_bytes(raw));
                }
                other => return Err(unexpected(other, self.state)),
            }
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
    use crate::frame::MAX_BODY_LEN;
    use crate::transport::split_stream;

    const STEP: Duration = Duration::from_secs(5);

    fn pipe() -> ((BoxReader, BoxWriter), (BoxReader, BoxWriter)) {
        let (a, b) = tokio::io::duplex(4096);
        (split_stream(a, MAX_BODY_LEN), split_stream(b, MAX_BODY_LEN))
    }

    fn authenticator() -> StaticAuthenticator {
        StaticAuthenticator::new().with_token("good", Identity::client(77))
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pipe();
        let auth = authenticator();

        let server = async {
            let mut hs = ServerHandshake::new(&auth, STEP);
            let accepted = hs.run(&mut sr, &mut sw).await;
            (accepted, hs.state())
        };
        let client = async {
            let mut hs = ClientHandshake::new("good", STEP);
            let conn_id = hs.run(&mut cr, &mut cw).await;
            (conn_id, hs.is_completed())
        };
        let ((accepted, server_state), (conn_id, client_done)) = tokio::join!(server, client);

        let accepted = accepted.unwrap();
        assert_eq!(accepted.identity, Identity::client(77));
        assert_eq!(conn_id.unwrap(), accepted.conn_id);
        assert_eq!(server_state, HandshakeState::Finished);
        assert!(client_done);
    }

    #[tokio::test]
    async fn test_bad_token_closes_without_finish() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pipe();
        let auth = authenticator();

        let server = async {
            let mut hs = ServerHandshake::new(&auth, STEP);
            let result = hs.run(&mut sr, &mut sw).await;
            assert_eq!(hs.state(), HandshakeState::Failed);
            // Hang up as the listener would.
            sw.shutdown().await;
            drop(sw);
            drop(sr);
            result
        };
        let client = async {
            let mut hs = ClientHandshake::new("bad", STEP);
            hs.run(&mut cr, &mut cw).await
        };
        let (server_result, client_result) = tokio::join!(server, client);
        assert!(matches!(server_result, Err(NetError::Auth(_))));
        assert!(matches!(client_result, Err(NetError::Auth(_))));
    }

    #[tokio::test]
    async fn test_unsupported_action() {
        let ((_sr, mut sw), (mut cr, mut cw)) = pipe();
        sw.write_frame(&Frame::control(ControlKind::HandshakeStart, Bytes::new()))
            .await
            .unwrap();
        sw.write_frame(&Frame::control(ControlKind::Cmd, Bytes::from_static(b"captcha")))
            .await
            .unwrap();

        let mut hs = ClientHandshake::new("good", STEP);
        let err = hs.run(&mut cr, &mut cw).await.unwrap_err();
        assert!(matches!(err, NetError::AuthActionNotFound(a) if a == "captcha"));
        assert_eq!(hs.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_extra_action_is_answered() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pipe();
        sw.write_frame(&Frame::control(ControlKind::HandshakeStart, Bytes::new()))
            .await
            .unwrap();
        sw.write_frame(&Frame::control(ControlKind::Cmd, Bytes::from_static(b"version")))
            .await
            .unwrap();

        let client = tokio::spawn(async move {
            let mut hs = ClientHandshake::new("good", STEP).with_action("version", "1.2");
            hs.run(&mut cr, &mut cw).await
        });

        let frame = sr.read_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Control(ControlKind::CmdResult));
        assert_eq!(&frame.body[..], b"1.2");
        sw.write_frame(&Frame::control(ControlKind::HandshakeFinish, 9u64.to_le_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(client.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_empty_finish_fails_ack() {
        let ((mut sr, mut sw), (mut cr, mut cw)) = pipe();
        let client = tokio::spawn(async move {
            let mut hs = ClientHandshake::new("good", STEP);
            hs.run(&mut cr, &mut cw).await
        });

        sw.write_frame(&Frame::control(ControlKind::HandshakeStart, Bytes::new()))
            .await
            .unwrap();
        sw.write_frame(&Frame::control(ControlKind::Cmd, Bytes::from_static(b"auth")))
            .await
            .unwrap();
        let _token = sr.read_frame().await.unwrap();
        sw.write_frame(&Frame::control(ControlKind::HandshakeFinish, Bytes::new()))
            .await
            .unwrap();

        assert!(matches!(
            client.await.unwrap(),
            Err(NetError::AckResultFailed)
        ));
    }

    #[tokio::test]
    async fn test_data_frame_during_handshake_is_protocol_error() {
        let ((mut sr, mut sw), (_cr, mut cw)) = pipe();
        cw.write_frame(&Frame::route(Bytes::from_static(b"early")))
            .await
            .unwrap();
        let auth = authenticator();
        let mut hs = ServerHandshake::new(&auth, STEP);
        let err = hs.run(&mut sr, &mut sw).await.unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_dialer_times_out() {
        let ((mut sr, mut sw), (_cr, _cw)) = pipe();
        let auth = authenticator();
        let mut hs = ServerHandshake::new(&auth, Duration::from_secs(3));
        let err = hs.run(&mut sr, &mut sw).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }
}
