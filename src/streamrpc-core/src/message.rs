use crate::error::{MessageError, ProtocolError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Positional call arguments.
pub type Params = Vec<Value>;

/// Caller-chosen correlation id. Never null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

/// `null`, `false`, `0` and `""` count as absent.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Params,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Params) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// Parses a raw request body. Any parse failure or a missing/invalid
    /// `id`, `method` or `params` is a malformed request.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body).map_err(ProtocolError::malformed)?;
        Self::try_from(value).map_err(ProtocolError::malformed)
    }
}

impl TryFrom<Value> for Request {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut obj) = value else {
            return Err(MessageError::NotAnObject);
        };

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.is_empty() => m,
            Some(Value::Null) | None => return Err(MessageError::MissingField("method")),
            Some(_) => return Err(MessageError::InvalidField("method")),
        };
        let params = match obj.remove("params") {
            Some(Value::Array(p)) => p,
            Some(Value::Null) | None => return Err(MessageError::MissingField("params")),
            Some(_) => return Err(MessageError::InvalidField("params")),
        };
        let id = match obj.get("id") {
            Some(v) if is_falsy(v) => return Err(MessageError::MissingField("id")),
            Some(v) => RequestId::from_value(v).ok_or(MessageError::InvalidField("id"))?,
            None => return Err(MessageError::MissingField("id")),
        };

        Ok(Self { id, method, params })
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Request::try_from(value).map_err(D::Error::custom)
    }
}

/// Answer to exactly one [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, Value>,
}

#[derive(Serialize)]
struct ResponseWire<'a> {
    id: &'a RequestId,
    result: &'a Value,
    error: &'a Value,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: Value) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn into_result(self) -> Result<Value, Value> {
        self.outcome
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (result, error) = match &self.outcome {
            Ok(result) => (result, &Value::Null),
            Err(error) => (&Value::Null, error),
        };
        ResponseWire {
            id: &self.id,
            result,
            error,
        }
        .serialize(serializer)
    }
}

impl TryFrom<Value> for Response {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut obj) = value else {
            return Err(MessageError::NotAnObject);
        };

        let id = match obj.get("id") {
            Some(v) if is_falsy(v) => return Err(MessageError::MissingField("id")),
            Some(v) => RequestId::from_value(v).ok_or(MessageError::InvalidField("id"))?,
            None => return Err(MessageError::MissingField("id")),
        };
        let result = obj
            .remove("result")
            .ok_or(MessageError::MissingField("result"))?;
        let error = obj
            .remove("error")
            .ok_or(MessageError::MissingField("error"))?;

        let outcome = match (result, error) {
            (result, Value::Null) => Ok(result),
            (Value::Null, error) => Err(error),
            _ => return Err(MessageError::ResultAndError),
        };
        Ok(Self { id, outcome })
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Response::try_from(value).map_err(D::Error::custom)
    }
}

/// Server-pushed message on an open connection. Serialized with `"id": null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub method: String,
    pub params: Params,
}

#[derive(Serialize)]
struct EventWire<'a> {
    id: (),
    method: &'a str,
    params: &'a Params,
}

impl Event {
    /// Builds an event; a non-array `params` is wrapped into a one-element
    /// sequence.
    pub fn new(method: &str, params: Value) -> Self {
        let params = match params {
            Value::Array(items) => items,
            other => vec![other],
        };
        Self {
            method: method.to_string(),
            params,
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EventWire {
            id: (),
            method: &self.method,
            params: &self.params,
        }
        .serialize(serializer)
    }
}

/// A top-level value read off a client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Event(Event),
    Response(Response),
}

impl Incoming {
    /// Anything carrying `method` is an event; everything else must be a
    /// well-formed response.
    pub fn classify(value: Value) -> Result<Self, MessageError> {
        let Value::Object(obj) = value else {
            return Err(MessageError::NotAnObject);
        };
        if obj.contains_key("method") {
            return event_from_map(obj).map(Incoming::Event);
        }
        Response::try_from(Value::Object(obj)).map(Incoming::Response)
    }
}

fn event_from_map(mut obj: Map<String, Value>) -> Result<Event, MessageError> {
    let method = match obj.remove("method") {
        Some(Value::String(m)) => m,
        _ => return Err(MessageError::InvalidField("method")),
    };
    let params = match obj.remove("params") {
        Some(Value::Array(p)) => p,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    };
    Ok(Event { method, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_requires_every_field() {
        assert!(Request::parse(br#"{"method":"echo"}"#).is_err());
        assert!(Request::parse(br#"{"params":["x"],"id":1}"#).is_err());
        assert!(Request::parse(br#"{"method":"echo","id":1}"#).is_err());
        assert!(Request::parse(br#"{"method":"echo","params":["x"]}"#).is_err());
        assert!(Request::parse(br#"{"method":"echo","params":["x"],"id":null}"#).is_err());
        assert!(Request::parse(b"not json").is_err());
    }

    #[test]
    fn falsy_ids_count_as_missing() {
        for body in [
            &br#"{"method":"echo","params":["x"],"id":0}"#[..],
            br#"{"method":"echo","params":["x"],"id":""}"#,
            br#"{"method":"echo","params":["x"],"id":false}"#,
        ] {
            let value: Value = serde_json::from_slice(body).unwrap();
            assert!(matches!(
                Request::try_from(value),
                Err(MessageError::MissingField("id"))
            ));
        }
    }

    #[test]
    fn request_parses_string_and_numeric_ids() {
        let req = Request::parse(br#"{"method":"echo","params":["x"],"id":"abc"}"#).unwrap();
        assert_eq!(req.id, RequestId::from("abc"));
        assert_eq!(req.params, vec![json!("x")]);

        let req = Request::parse(br#"{"method":"echo","params":[],"id":7}"#).unwrap();
        assert_eq!(req.id, RequestId::Number(7));
    }

    #[test]
    fn response_wire_shape() {
        let ok = serde_json::to_value(Response::ok(RequestId::Number(1), json!(3))).unwrap();
        assert_eq!(ok, json!({"id": 1, "result": 3, "error": null}));

        let err = serde_json::to_value(Response::error(RequestId::Number(1), json!("bad"))).unwrap();
        assert_eq!(err, json!({"id": 1, "result": null, "error": "bad"}));
        assert!(Response::error(RequestId::Number(1), json!("bad")).is_error());
        assert!(!Response::ok(RequestId::Number(1), json!(3)).is_error());
    }

    #[test]
    fn response_decode_is_strict() {
        let both = json!({"id": 1, "result": 1, "error": "x"});
        assert!(matches!(
            Response::try_from(both),
            Err(MessageError::ResultAndError)
        ));

        let missing_error = json!({"id": 1, "result": 1});
        assert!(Response::try_from(missing_error).is_err());

        let null_result = Response::try_from(json!({"id": 1, "result": null, "error": null}));
        assert_eq!(null_result.unwrap().outcome, Ok(Value::Null));
    }

    #[test]
    fn event_wraps_scalar_params() {
        let evt = Event::new("tick", json!(4));
        assert_eq!(
            serde_json::to_value(&evt).unwrap(),
            json!({"id": null, "method": "tick", "params": [4]})
        );
    }

    #[test]
    fn classify_separates_events_from_responses() {
        let evt = Incoming::classify(json!({"id": null, "method": "event", "params": [0]}));
        assert_eq!(
            evt.unwrap(),
            Incoming::Event(Event {
                method: "event".to_string(),
                params: vec![json!(0)],
            })
        );

        let res = Incoming::classify(json!({"id": 1, "result": "ok", "error": null}));
        assert!(matches!(res.unwrap(), Incoming::Response(r) if r.is_ok()));

        assert!(Incoming::classify(json!([1, 2])).is_err());
    }
}
