//! Line framing for the device daemon protocol
//!
//! Every message on the wire is a single JSON object wrapped in a one-element
//! array and terminated by a newline: `[{...}]\n`. Anything else the tool
//! prints (banners, progress text) is incidental output.

use serde::Serialize;
use serde_json::{Map, Value};

use devwatch_core::prelude::*;
use devwatch_core::DaemonMessage;

/// Strip the outer `[` `]` from a protocol line.
///
/// Returns the inner object text only when the trimmed line starts with `[{`
/// and ends with `}]`.
pub(crate) fn strip_brackets(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.starts_with("[{") && trimmed.ends_with("}]") {
        Some(&trimmed[1..trimmed.len() - 1])
    } else {
        None
    }
}

/// True if the line looks like protocol traffic rather than incidental output
/// such as banners or progress text.
pub fn is_protocol_line(line: &str) -> bool {
    strip_brackets(line).is_some()
}

/// A validated inbound message, before event payloads are decoded
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to a command we sent
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
        trace: Option<Value>,
    },
    /// Unsolicited notification
    Event { event: String, params: Value },
}

/// Outcome of looking at one stdout line
#[derive(Debug)]
pub enum ParsedLine {
    Message(InboundMessage),
    /// Not shaped like `[{...}]`; ignored
    Incidental,
    /// Shaped like a message but unusable; logged and dropped
    Malformed(Error),
}

/// Parse a stdout line and check it has the shape of a response or an event.
///
/// A response needs an integer `id`. An event needs a string `event` and an
/// object `params`.
pub fn parse_and_validate(line: &str) -> ParsedLine {
    let Some(inner) = strip_brackets(line) else {
        return ParsedLine::Incidental;
    };

    let mut object: Map<String, Value> = match serde_json::from_str(inner) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return ParsedLine::Malformed(Error::protocol("expected a JSON object")),
        Err(e) => return ParsedLine::Malformed(Error::protocol(format!("invalid JSON: {e}"))),
    };

    if let Some(id) = object.get("id") {
        let Some(id) = id.as_u64() else {
            return ParsedLine::Malformed(Error::protocol(format!(
                "response id is not a non-negative integer: {id}"
            )));
        };
        return ParsedLine::Message(InboundMessage::Response {
            id,
            result: object.remove("result"),
            error: object.remove("error"),
            trace: object.remove("trace"),
        });
    }

    let event = match object.remove("event") {
        Some(Value::String(name)) => name,
        _ => return ParsedLine::Malformed(Error::protocol("event name missing or not a string")),
    };
    match object.remove("params") {
        Some(params @ Value::Object(_)) => {
            ParsedLine::Message(InboundMessage::Event { event, params })
        }
        _ => ParsedLine::Malformed(Error::protocol(format!(
            "event {event} has missing or non-object params"
        ))),
    }
}

/// Decode an event by name.
///
/// Returns `None` for names outside the fixed vocabulary, so newer tools keep
/// working. A known name with an undecodable payload is a protocol error.
pub fn decode_event(event: &str, params: Value) -> Option<Result<DaemonMessage>> {
    let decoded = match event {
        DaemonMessage::DEVICE_ADDED => {
            serde_json::from_value(params).map(DaemonMessage::DeviceAdded)
        }
        DaemonMessage::DEVICE_REMOVED => {
            serde_json::from_value(params).map(DaemonMessage::DeviceRemoved)
        }
        DaemonMessage::LOG_MESSAGE => {
            serde_json::from_value(params).map(DaemonMessage::LogMessage)
        }
        _ => return None,
    };
    Some(decoded.map_err(|e| Error::protocol(format!("bad {event} payload: {e}"))))
}

#[derive(Serialize)]
struct OutboundCommand<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
}

/// Serialize a command as one framed line, without the trailing newline.
pub fn encode_command(id: u64, method: &str, params: &Value) -> Result<String> {
    let json = serde_json::to_string(&OutboundCommand { id, method, params })?;
    Ok(format!("[{json}]"))
}

/// Render a remote `error` value (and optional `trace`) as message text.
pub(crate) fn remote_error_text(error: &Value, trace: Option<&Value>) -> String {
    let mut text = match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if let Some(trace) = trace {
        text.push('\n');
        match trace {
            Value::String(s) => text.push_str(s),
            other => text.push_str(&other.to_string()),
        }
    }
    text
}
