//! Wire envelopes and the codec that produces them
//!
//! Every message on the bus is a versioned JSON envelope. Requests and
//! notifications share one shape (notifications carry no `id`); responses
//! echo the request id and carry either `result` or `error`.
//!
//! ```text
//! {"jsonrpc":"2.0","method":"TurnOn","params":{...},"id":17,"time":1700000000000}
//! {"jsonrpc":"2.0","result":null,"id":17,"time":1700000000004}
//! ```

use crate::config::Clock;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Protocol version tag carried in the `jsonrpc` field
pub const PROTOCOL_VERSION: &str = "2.0";

/// Event name used for the one-time capability announcement
pub const ANNOUNCE_EVENT: &str = "announce";

/// Canonical error kinds carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    /// Payload is not valid JSON
    ParseError,
    /// Version mismatch or malformed envelope
    InvalidRequest,
    MethodNotFound,
    /// Params do not fit the method's argument type
    InvalidParams,
    /// Handler returned an error
    ServerError,
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::ServerError => -32000,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32000 => ErrorCode::ServerError,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error object carried in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    /// Diagnostic data, e.g. the offending request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display, raw: &[u8]) -> Self {
        Self::new(ErrorCode::ParseError, format!("Parse error: {detail}"))
            .with_data(Value::String(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn invalid_request(detail: impl Into<String>, raw: &[u8]) -> Self {
        Self::new(ErrorCode::InvalidRequest, detail)
            .with_data(Value::String(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method '{method}' not found"),
        )
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidParams, format!("Invalid params: {detail}"))
    }

    pub fn server_error(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, detail)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.code())
    }
}

impl std::error::Error for RpcError {}

/// Decoded request or notification
///
/// `method` holds the library-facing name (`turnOn`); the wire form is
/// produced by [`to_wire_method`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<u32>,
    pub time: u64,
}

impl Request {
    /// Notifications carry no correlation id and are never answered
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decode params into `T`, treating absent params as `T`'s zero value
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_params(self.params.clone()).map_err(Error::Remote)
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'a str,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    time: u64,
}

/// Failure to decode an inbound request
///
/// `id` is recovered whenever the payload was valid JSON so the error can
/// still be correlated by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestError {
    pub id: Option<u32>,
    pub error: RpcError,
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, alias = "response", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub time: u64,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Cheap view of a response: the result stays unparsed
#[derive(Debug, Deserialize)]
pub struct ResponseHead {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default, alias = "response")]
    pub result: Option<Box<RawValue>>,
}

impl ResponseHead {
    /// Parse only enough of the payload to correlate it
    pub fn peek(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::serialization("Malformed response envelope", e))
    }

    pub fn version_matches(&self) -> bool {
        self.jsonrpc == PROTOCOL_VERSION
    }
}

/// One-time capability advertisement published on export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAnnouncement {
    #[serde(rename = "schema")]
    pub schema_uri: String,
    pub topic: String,
    pub supported_methods: Vec<String>,
    pub supported_events: Vec<String>,
}

/// Upper-case the first character for dispatch on the wire
pub fn to_wire_method(method: &str) -> String {
    let mut chars = method.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lower-case the first character of a wire method name
pub fn from_wire_method(method: &str) -> String {
    let mut chars = method.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Apply the single-argument rule to raw params
///
/// More than one array element is rejected, a single element is unwrapped,
/// an empty array or `null` means no params.
pub fn normalize_params(params: Option<Value>) -> std::result::Result<Option<Value>, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(mut items)) => match items.len() {
            0 => Ok(None),
            1 => Ok(items.pop()),
            n => Err(RpcError::invalid_params(format!(
                "expected exactly one structured argument, got {n}"
            ))),
        },
        Some(other) => Ok(Some(other)),
    }
}

/// Decode params into the argument type
///
/// Absent params decode as `null`, falling back to `{}` so unit types and
/// field-less or fully defaulted structs both accept an empty call.
pub fn decode_params<T: DeserializeOwned>(
    params: Option<Value>,
) -> std::result::Result<T, RpcError> {
    match params {
        Some(value) => serde_json::from_value(value).map_err(RpcError::invalid_params),
        None => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Default::default())))
            .map_err(RpcError::invalid_params),
    }
}

/// Serialize call arguments into params; `null` becomes "no params"
pub fn encode_params<T: Serialize>(args: &T) -> Result<Option<Value>> {
    Ok(params_from_value(serde_json::to_value(args)?))
}

/// Wire params for one argument value
///
/// A sequence is wrapped in a one-element array so [`normalize_params`]
/// hands it back intact instead of reading it as positional arguments.
pub fn params_from_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(Value::Array(vec![Value::Array(items)])),
        other => Some(other),
    }
}

/// Decode an inbound request or notification
pub fn decode_request(payload: &[u8]) -> std::result::Result<Request, RequestError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| RequestError {
        id: None,
        error: RpcError::parse_error(e, payload),
    })?;

    let Value::Object(mut envelope) = value else {
        return Err(RequestError {
            id: None,
            error: RpcError::invalid_request("Envelope must be a JSON object", payload),
        });
    };

    let id = envelope
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok());
    let fail = |message: String| RequestError {
        id,
        error: RpcError::invalid_request(message, payload),
    };

    match envelope.get("jsonrpc").and_then(Value::as_str) {
        Some(PROTOCOL_VERSION) => {}
        other => {
            return Err(fail(format!(
                "Unsupported protocol version {other:?}, expected {PROTOCOL_VERSION:?}"
            )))
        }
    }

    if let Some(raw_id) = envelope.get("id") {
        if !raw_id.is_null() && id.is_none() {
            return Err(fail(format!("Correlation id {raw_id} is not a 32-bit unsigned integer")));
        }
    }

    let method = match envelope.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => from_wire_method(method),
        _ => return Err(fail("Missing method".to_string())),
    };

    let params = normalize_params(envelope.remove("params"))
        .map_err(|error| RequestError { id, error })?;
    let time = envelope.get("time").and_then(Value::as_u64).unwrap_or(0);

    Ok(Request {
        method,
        params,
        id,
        time,
    })
}

/// Decode a full response envelope
pub fn decode_response(payload: &[u8]) -> std::result::Result<Response, RpcError> {
    let response: Response =
        serde_json::from_slice(payload).map_err(|e| RpcError::parse_error(e, payload))?;
    if response.jsonrpc != PROTOCOL_VERSION {
        return Err(RpcError::invalid_request(
            format!(
                "Unsupported protocol version {:?}, expected {PROTOCOL_VERSION:?}",
                response.jsonrpc
            ),
            payload,
        ));
    }
    Ok(response)
}

/// Encodes envelopes stamped with the injected clock
#[derive(Clone)]
pub struct Codec {
    clock: Arc<dyn Clock>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Arc::new(crate::config::SystemClock))
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl Codec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Encode a request; `id: None` produces a notification
    pub fn encode_request(
        &self,
        method: &str,
        params: Option<&Value>,
        id: Option<u32>,
    ) -> Result<Vec<u8>> {
        let wire = WireRequest {
            jsonrpc: PROTOCOL_VERSION,
            method: to_wire_method(method),
            params,
            id,
            time: self.now(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Encode a notification carrying an event payload
    pub fn encode_notification(&self, name: &str, params: Option<&Value>) -> Result<Vec<u8>> {
        self.encode_request(name, params, None)
    }

    /// Build a response from a dispatch outcome
    pub fn response(
        &self,
        id: Option<u32>,
        outcome: std::result::Result<Value, RpcError>,
    ) -> Response {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Response {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            result,
            error,
            id,
            time: self.now(),
        }
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }
}
