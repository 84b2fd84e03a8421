//! JSON-RPC 2.0 envelopes and the wire codec.
//!
//! Re-uses the heavy lifting done in `jsonrpsee-types`, pretending as if
//! these are our own types.  Inbound traffic is discriminated by the
//! presence of a `method` field: envelopes that carry one are calls,
//! envelopes that don't are the client answering something this peer sent.
use jsonrpsee_types as rpc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;

pub use rpc::{
    ErrorCode, ErrorObjectOwned, Id, InvalidRequest, Request, Response, ResponsePayload,
    TwoPointZero,
};

/// Convenient alias for notifications with generic raw JSON payloads.
///
/// `serde_json::value::RawValue` is a special case type that contains valid
/// JSON but is just a reference to the slice of the input containing it,
/// which defers parsing until the handler knows what shape it expects.
pub type Notification<'a> = rpc::Notification<'a, Option<&'a serde_json::value::RawValue>>;

/// The response type with a generic JSON payload; the actual payload type is
/// method-specific and not known at this layer.
pub type GenericResponse = Response<'static, Value>;

/// Possible kinds of messages received from the connected client.
#[derive(Debug)]
pub enum ClientMessage<'a> {
    /// A method call carrying an id; exactly one answer is owed.
    Call(Request<'a>),

    /// A method call without an id; the handler runs but no answer may be
    /// sent.
    Fire(Notification<'a>),

    /// The client answering a request this peer sent earlier.
    Reply(ClientReply),

    /// A JSON-RPC shaped envelope that fits none of the above but still has
    /// an id we can reference when reporting the error.
    Invalid(InvalidRequest<'a>),
}

impl<'a> ClientMessage<'a> {
    /// Decode one frame.
    ///
    /// The cascade mirrors how jsonrpsee-server triages incoming payloads:
    /// request, then notification, then anything an id can still be
    /// extracted from.  A reply arm sits in between because this protocol
    /// is bidirectional and response envelopes from the client are legal.
    pub fn decode(raw: &'a str) -> Result<Self, ParseError> {
        if let Ok(call) = serde_json::from_str::<Request>(raw) {
            return Ok(ClientMessage::Call(call));
        }
        if let Ok(fire) = serde_json::from_str::<Notification>(raw) {
            return Ok(ClientMessage::Fire(fire));
        }
        if let Ok(reply) = serde_json::from_str::<ClientReply>(raw) {
            if reply.result.is_some() || reply.error.is_some() {
                return Ok(ClientMessage::Reply(reply));
            }
        }
        serde_json::from_str::<InvalidRequest>(raw)
            .map(ClientMessage::Invalid)
            .map_err(|source| ParseError {
                raw: raw.to_owned(),
                source,
            })
    }
}

/// A response envelope received from the client: `result` or `error`,
/// correlated by `id`.
#[derive(Debug, Deserialize)]
pub struct ClientReply {
    pub jsonrpc: TwoPointZero,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// A frame that could not be decoded as any JSON-RPC message shape.
///
/// Keeps the original raw text so the failure can be reported with full
/// context; the frame itself is dropped and the connection stays open.
#[derive(Debug, Snafu)]
#[snafu(display("undecodable frame {:?}: {}", raw, source))]
pub struct ParseError {
    pub raw: String,
    pub source: serde_json::Error,
}

/// Params carried by an unsolicited `event` notification.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventParams {
    pub evt_type: String,
    pub self_id: i64,
    pub evt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<Value>,
}

/// Serialize a success answer for the given call id.
pub(crate) fn encode_answer(id: Id<'static>, result: Value) -> String {
    let response: GenericResponse = Response::new(ResponsePayload::success(result), id);
    to_frame(&response)
}

/// Serialize an error answer for the given call id.
pub(crate) fn encode_error(id: Id<'static>, code: i32, message: &str) -> String {
    let payload = ResponsePayload::error(ErrorObjectOwned::owned::<()>(code, message, None));
    let response: GenericResponse = Response::new(payload, id);
    to_frame(&response)
}

/// Serialize an unsolicited `event` notification.  No id is attached, so no
/// reply is expected or correlated.
pub(crate) fn encode_event(params: &EventParams) -> String {
    #[derive(Serialize)]
    struct ServerNotification<'a> {
        jsonrpc: TwoPointZero,
        method: &'a str,
        params: &'a EventParams,
    }

    to_frame(&ServerNotification {
        jsonrpc: TwoPointZero,
        method: "event",
        params,
    })
}

fn to_frame<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        format!(
            "{{\"error\":\"JSON serialization error while attempting to serialize response: {}\"}}",
            e
        )
    })
}
