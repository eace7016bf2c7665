//! Message router: dispatches route envelopes to handlers keyed by
//! `(sender role, msg id)` and responses to the correlator.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::codec::Message;
use crate::conn::Connection;
use crate::correlator::Correlator;
use crate::error::NetError;
use crate::identity::{Identity, Role};
use crate::route::{ErrCode, MSG_CLIENT_OFFLINE, MSG_CLIENT_ONLINE, MsgType, RouteEnvelope, RouteHeader};

/// A handler invoked with the request context and the raw envelope.
pub type MessageHandler = Arc<dyn Fn(Context, RouteEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-envelope handler context.
///
/// Cloning is cheap; all clones share the single-response guard.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    conn: Arc<Connection>,
    header: RouteHeader,
    local: Identity,
    responded: AtomicBool,
}

impl Context {
    pub fn new(conn: Arc<Connection>, header: RouteHeader, local: Identity) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                conn,
                header,
                local,
                responded: AtomicBool::new(false),
            }),
        }
    }

    pub fn header(&self) -> &RouteHeader {
        &self.inner.header
    }

    /// Identity of the envelope's sender.
    pub fn sender(&self) -> Identity {
        self.inner.header.from()
    }

    /// The connection the envelope arrived on.
    pub fn conn(&self) -> &Arc<Connection> {
        &self.inner.conn
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Answer the request with a success payload.
    pub fn response<M: Message>(&self, msg: &M) -> Result<(), NetError> {
        self.respond(ErrCode::OK, msg)
    }

    /// Answer the request with an error code and no payload.
    pub fn response_error(&self, code: ErrCode) -> Result<(), NetError> {
        self.respond(code, &())
    }

    /// Answer the request. Only the first call sends; later calls log and
    /// return [`NetError::DoubleResponse`].
    pub fn respond<M: Message>(&self, code: ErrCode, msg: &M) -> Result<(), NetError> {
        let header = &self.inner.header;
        if header.msg_type != MsgType::Request {
            return Err(NetError::Protocol(format!(
                "response to {:?} message {}",
                header.msg_type, header.msg_id
            )));
        }
        if self.inner.responded.swap(true, Ordering::AcqRel) {
            error!(
                msg_id = header.msg_id,
                syn = header.syn,
                sender = %header.from(),
                "Handler responded twice, second response dropped"
            );
            return Err(NetError::DoubleResponse);
        }
        let env = RouteEnvelope::response_to(header, code, msg)?;
        self.inner.conn.send_route(&env)
    }

    /// Send a fire-and-forget message back to the sender.
    pub fn send_async<M: Message>(&self, msg_id: u32, msg: &M) -> Result<(), NetError> {
        let env = RouteEnvelope::new_async(self.inner.local, self.sender(), msg_id, msg)?;
        self.inner.conn.send_route(&env)
    }
}

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler was started.
    Handled,
    /// A response completed a pending request.
    Delivered,
    /// A request found no handler; the caller should answer with a route error.
    NoHandler,
    /// Dropped: async without handler, or a late response.
    Dropped,
}

/// Handler table plus the correlator for responses.
pub struct MessageRouter {
    local: Identity,
    handlers: RwLock<HashMap<(Role, u32), MessageHandler>>,
    correlator: Arc<Correlator>,
}

impl MessageRouter {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            handlers: RwLock::new(HashMap::new()),
            correlator: Correlator::new(),
        }
    }

    pub fn local(&self) -> Identity {
        self.local
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Register a raw handler for messages from `role` with `msg_id`.
    pub fn register_raw(&self, role: Role, msg_id: u32, handler: MessageHandler) {
        debug!(%role, msg_id, "Registering handler");
        if self.handlers.write().insert((role, msg_id), handler).is_some() {
            warn!(%role, msg_id, "Handler replaced");
        }
    }

    /// Register a typed handler. The payload is decoded as `M` first; a
    /// request with an undecodable payload is answered with
    /// [`ErrCode::BAD_PAYLOAD`].
    pub fn register<M, F, Fut>(&self, role: Role, msg_id: u32, f: F)
    where
        M: Message,
        F: Fn(Context, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: MessageHandler = Arc::new(move |ctx: Context, env: RouteEnvelope| {
            let f = Arc::clone(&f);
            async move {
                match env.message::<M>() {
                    Ok(msg) => f(ctx, msg).await,
                    Err(e) => {
                        warn!(msg_id = env.header.msg_id, sender = %env.header.from(), "Undecodable payload: {e}");
                        if env.header.msg_type == MsgType::Request {
                            let _ = ctx.response_error(ErrCode::BAD_PAYLOAD);
                        }
                    }
                }
            }
            .boxed()
        });
        self.register_raw(role, msg_id, handler);
    }

    pub fn has_handler(&self, role: Role, msg_id: u32) -> bool {
        self.handlers.read().contains_key(&(role, msg_id))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Dispatch an envelope that arrived on `conn`.
    ///
    /// Handlers run on their own task so a handler awaiting another request
    /// never stalls the connection's read loop. Handler execution is
    /// therefore not ordered, even for envelopes from one connection.
    /// A panicking handler is contained; if it had not answered a request,
    /// the sender receives [`ErrCode::HANDLER_PANIC`].
    pub fn dispatch(&self, conn: &Arc<Connection>, env: RouteEnvelope) -> DispatchOutcome {
        let header = env.header;
        if header.msg_type == MsgType::Response {
            return if self.correlator.deliver(env) {
                DispatchOutcome::Delivered
            } else {
                DispatchOutcome::Dropped
            };
        }

        let handler = self.handlers.read().get(&(header.from_role, header.msg_id)).cloned();
        let Some(handler) = handler else {
            return match header.msg_type {
                MsgType::Request => {
                    debug!(msg_id = header.msg_id, sender = %header.from(), "No handler for request");
                    DispatchOutcome::NoHandler
                }
                _ => {
                    if matches!(header.msg_id, MSG_CLIENT_ONLINE | MSG_CLIENT_OFFLINE) {
                        debug!(msg_id = header.msg_id, "Presence notice ignored");
                    } else {
                        warn!(msg_id = header.msg_id, sender = %header.from(), "No handler, message dropped");
                    }
                    DispatchOutcome::Dropped
                }
            };
        };

        let ctx = Context::new(Arc::clone(conn), header, self.local);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler(ctx.clone(), env)).catch_unwind().await;
            if result.is_err() {
                error!(
                    msg_id = header.msg_id,
                    sender = %header.from(),
                    "Handler panicked"
                );
                if header.msg_type == MsgType::Request && !ctx.has_responded() {
                    let _ = ctx.response_error(ErrCode::HANDLER_PANIC);
                }
            }
        });
        DispatchOutcome::Handled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
