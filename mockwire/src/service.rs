//! The mock RPC service: method dispatch, authorization gating, the command
//! registry, and event notification.
//!
//! One [`MockService`] instance serves every connection.  The service holds
//! no per-connection state; everything mutable lives in the [`Session`]
//! owned by the connection task and passed `&mut` into every dispatch.
use crate::jsonrpc::{self, ClientMessage, ErrorCode, EventParams, Id, Request};
use crate::observe::{Observation, ObservationSink};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::*;

/// Handle through which handlers talk back to their connection.
///
/// Answers and events are queued on the connection's outbound channel and
/// written in order by the connection task.  Sends are infallible: when the
/// connection is gone the message is logged and discarded.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionContext {
    sender: mpsc::Sender<String>,
    close: Arc<AtomicBool>,
}

impl ConnectionContext {
    pub(crate) fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            sender,
            close: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn send(&self, frame: String) {
        if self.sender.send(frame).await.is_err() {
            debug!("connection gone; outbound frame discarded");
        }
    }

    /// Answer a call.  Calls without an id get no answer.
    pub(crate) async fn answer(&self, id: Option<Id<'static>>, result: Value) {
        let Some(id) = id else { return };
        self.send(jsonrpc::encode_answer(id, result)).await;
    }

    /// Answer a call with a JSON-RPC error.  Calls without an id get no
    /// answer.
    pub(crate) async fn error(&self, id: Option<Id<'static>>, code: i32, message: &str) {
        let Some(id) = id else { return };
        self.send(jsonrpc::encode_error(id, code, message)).await;
    }

    /// Send an unsolicited `event` notification.
    pub(crate) async fn fire_event(
        &self,
        evt_type: &str,
        self_id: i64,
        evt: Value,
        ctx: Option<Value>,
    ) {
        let params = EventParams {
            evt_type: evt_type.to_owned(),
            self_id,
            evt,
            ctx,
        };
        self.send(jsonrpc::encode_event(&params)).await;
    }

    /// Ask the connection task to close once everything queued so far has
    /// been written.  Idempotent.
    pub(crate) fn shutdown(&self) {
        self.close.store(true, Ordering::Release);
    }

    /// Whether a handler has requested the connection be closed.
    pub(crate) fn close_requested(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }
}

/// Per-connection mutable state.
#[derive(Debug, Default)]
pub(crate) struct Session {
    /// Monotonic within a connection: set once by a successful `auth`,
    /// never cleared by any handler.
    authorized: bool,

    /// Event type name to the context captured at bind time.
    event_contexts: HashMap<String, Value>,

    /// Commands minted at runtime, keyed by their generated token.
    dynamic_commands: HashMap<String, DynamicCommand>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn authorized(&self) -> bool {
        self.authorized
    }
}

/// Handler variants a session can register under a generated token.
#[derive(Clone, Copy, Debug)]
enum DynamicCommand {
    /// Answers an acknowledgment, then fires the follow-up `testEvent`
    /// notification with a null payload.
    EventFollowUp,
}

/// Resolution of a `perform` command name against the registry.
enum Command {
    Mock,
    TestEvent,
    Dynamic(DynamicCommand),
}

/// The shared method set consulted by every connection.
#[derive(Debug)]
pub(crate) struct MockService {
    token: String,
    observer: ObservationSink,
}

impl MockService {
    pub(crate) fn new(token: String, observer: ObservationSink) -> Self {
        Self { token, observer }
    }

    /// Decode and fully process one frame: handler invoked and every answer
    /// or event queued before this returns.
    pub(crate) async fn handle_frame(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        frame: &[u8],
    ) {
        let raw = match std::str::from_utf8(frame) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "dropping non-UTF-8 frame");
                self.observer.emit(Observation::ParseError {
                    raw: String::from_utf8_lossy(frame).into_owned(),
                    error: e.to_string(),
                });
                return;
            }
        };

        match ClientMessage::decode(raw) {
            Ok(ClientMessage::Call(call)) => {
                let Request {
                    id, method, params, ..
                } = call;
                let params = params.as_deref().and_then(|p| serde_json::from_str(p.get()).ok());
                self.dispatch(session, ctx, Some(id.into_owned()), method.as_ref(), params)
                    .await;
            }
            Ok(ClientMessage::Fire(fire)) => {
                let params = fire.params.and_then(|p| serde_json::from_str(p.get()).ok());
                self.dispatch(session, ctx, None, fire.method.as_ref(), params)
                    .await;
            }
            Ok(ClientMessage::Reply(reply)) => {
                debug!(id = %reply.id, "reply received from client");
                self.observer.emit(Observation::ReplyReceived {
                    id: reply.id,
                    result: reply.result,
                    error: reply.error,
                });
            }
            Ok(ClientMessage::Invalid(invalid)) => {
                let id = invalid.id.into_owned();
                warn!(%id, "invalid request envelope");
                let code = ErrorCode::InvalidRequest;
                ctx.error(Some(id), code.code(), code.message()).await;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.observer.emit(Observation::ParseError {
                    raw: e.raw,
                    error: e.source.to_string(),
                });
            }
        }
    }

    /// Route one call through the authorization gate to its handler.
    ///
    /// Unauthenticated connections resolve against the restricted set
    /// (`ping`, `version`, `auth`); authorized connections gain `bindEvent`,
    /// `unbindEvent` and `perform`.  Anything else falls back to the
    /// unknown-method handler, which still answers.
    async fn dispatch(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
        method: &str,
        params: Option<Value>,
    ) {
        debug!(method, authorized = session.authorized, "dispatch");
        self.observer.emit(Observation::Dispatch {
            method: method.to_owned(),
            authorized: session.authorized,
        });

        match (session.authorized, method) {
            (_, "ping") => self.ping(ctx, id).await,
            (_, "version") => self.version(ctx, id).await,
            (false, "auth") => self.auth(session, ctx, id, params).await,
            (true, "bindEvent") => self.bind_event(session, ctx, id, params).await,
            (true, "unbindEvent") => self.unbind_event(ctx, id).await,
            (true, "perform") => self.perform(session, ctx, id, params).await,
            _ => self.unknown(ctx, id, method).await,
        }
    }

    async fn ping(&self, ctx: &ConnectionContext, id: Option<Id<'static>>) {
        ctx.answer(id, json!([null, true, "pong"])).await;
    }

    async fn version(&self, ctx: &ConnectionContext, id: Option<Id<'static>>) {
        ctx.answer(
            id,
            json!([null, {
                "server": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "platform": std::env::consts::OS,
            }]),
        )
        .await;
    }

    /// The authorization handshake.  Success is terminal: the session stays
    /// authorized for the remainder of the connection.  Failure answers a
    /// 401 error and closes the connection.
    async fn auth(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
        params: Option<Value>,
    ) {
        let supplied = positional(&params, 0).and_then(Value::as_str);
        if supplied == Some(self.token.as_str()) {
            session.authorized = true;
            info!("connection authorized");
            ctx.answer(id, json!([null, true, "authorized"])).await;
        } else {
            warn!("authorization failed");
            ctx.error(id, 401, "Unauthorized").await;
            ctx.shutdown();
        }
    }

    /// `bindEvent(selfId, evtType, res, ctx)`: capture the context to attach
    /// to later events of this type.
    async fn bind_event(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
        params: Option<Value>,
    ) {
        if let Some(evt_type) = positional(&params, 1).and_then(Value::as_str) {
            let bound = positional(&params, 3).cloned().unwrap_or(Value::Null);
            session.event_contexts.insert(evt_type.to_owned(), bound);
        }
        ctx.answer(id, json!([null, true])).await;
    }

    /// `unbindEvent(selfId, evtType)`: acknowledged, but the stored context
    /// stays in place; only a later `bindEvent` for the same type replaces
    /// it.
    async fn unbind_event(&self, ctx: &ConnectionContext, id: Option<Id<'static>>) {
        ctx.answer(id, json!([null, true])).await;
    }

    /// `perform(selfId, commandName, args)`: generic named-command dispatch
    /// through the registry.
    async fn perform(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
        params: Option<Value>,
    ) {
        let name = positional(&params, 1).and_then(Value::as_str).unwrap_or_default();
        match resolve_command(session, name) {
            Command::TestEvent => self.cmd_test_event(session, ctx, id).await,
            Command::Dynamic(DynamicCommand::EventFollowUp) => {
                self.cmd_event_follow_up(session, ctx, id).await
            }
            Command::Mock => ctx.answer(id, json!([null, {"a mock": "result"}])).await,
        }
    }

    /// The `testEvent` command: acknowledge, mint a dynamic command token,
    /// announce it to the client through a `testEvent` event.
    async fn cmd_test_event(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
    ) {
        ctx.answer(id, json!([null, true, "firingTestEvent"])).await;

        let token = mint_token();
        session
            .dynamic_commands
            .insert(token.clone(), DynamicCommand::EventFollowUp);
        debug!(token = token.as_str(), "registered dynamic command");

        let bound = session.event_contexts.get("testEvent").cloned();
        ctx.fire_event("testEvent", 0, Value::String(token), bound).await;
    }

    /// A previously minted token invoked via `perform`.  The token stays
    /// registered, so repeated invocations succeed again.
    async fn cmd_event_follow_up(
        &self,
        session: &mut Session,
        ctx: &ConnectionContext,
        id: Option<Id<'static>>,
    ) {
        ctx.answer(id, json!([null, true, "awesome"])).await;

        let bound = session.event_contexts.get("testEvent").cloned();
        ctx.fire_event("testEvent", 0, Value::Null, bound).await;
    }

    /// Fallback for any method name outside the applicable set.  Answers a
    /// non-fatal placeholder so every id-bearing request gets exactly one
    /// reply.
    async fn unknown(&self, ctx: &ConnectionContext, id: Option<Id<'static>>, method: &str) {
        debug!(method, "unknown method");
        ctx.answer(id, json!(["unknown method ", null])).await;
    }
}

/// Resolve a `perform` command name: built-ins first, then the session's
/// dynamic commands, then the mock fallback.
fn resolve_command(session: &Session, name: &str) -> Command {
    match name {
        "testEvent" => Command::TestEvent,
        _ => match session.dynamic_commands.get(name) {
            Some(command) => Command::Dynamic(*command),
            None => Command::Mock,
        },
    }
}

/// Positional access into array params.  The wire protocol sends positional
/// argument lists; absent or differently shaped params read as absent
/// arguments rather than as errors.
fn positional<'p>(params: &'p Option<Value>, index: usize) -> Option<&'p Value> {
    params.as_ref()?.as_array()?.get(index)
}

/// Generated command names: `dyn_` plus eight random alphanumerics, unique
/// per connection.
fn mint_token() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("dyn_{suffix}")
}
