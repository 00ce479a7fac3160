use purplepages_core::{Event, EventId, Filter};
use serde_json::{json, Value};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum FrameError {
    #[snafu(display("Not valid JSON: {message}"))]
    Json { message: String },
    #[snafu(display("Frame is not an array"))]
    NotArray,
    #[snafu(display("Unknown frame type `{frame_type}`"))]
    UnknownType { frame_type: String },
    #[snafu(display("Malformed `{frame_type}` frame"))]
    Malformed { frame_type: String },
}

/// A relay-to-client frame.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Event {
        sub_id: String,
        event: Box<Event>,
    },
    Eose {
        sub_id: String,
    },
    Notice {
        message: String,
    },
    Closed {
        sub_id: String,
        reason: String,
    },
    Ok {
        event_id: Option<EventId>,
        accepted: bool,
        reason: String,
    },
}

/// Build a `["REQ", sub_id, filter...]` client frame.
pub fn req_frame(sub_id: &str, filters: &[Filter]) -> String {
    let mut frame = vec![json!("REQ"), json!(sub_id)];
    for filter in filters {
        frame.push(serde_json::to_value(filter).expect("Can't fail: filters are plain maps"));
    }
    Value::Array(frame).to_string()
}

/// Build a `["CLOSE", sub_id]` client frame.
pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

/// Parse one relay-to-client frame.
pub fn parse_relay_frame(text: &str) -> Result<RelayFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|err| FrameError::Json {
        message: err.to_string(),
    })?;
    let Value::Array(parts) = value else {
        return Err(FrameError::NotArray);
    };

    let frame_type = parts
        .first()
        .and_then(Value::as_str)
        .ok_or(FrameError::NotArray)?
        .to_owned();

    let malformed = || FrameError::Malformed {
        frame_type: frame_type.clone(),
    };

    match frame_type.as_str() {
        "EVENT" => {
            let sub_id = parts.get(1).and_then(Value::as_str).ok_or_else(malformed)?;
            let event: Event = serde_json::from_value(
                parts.get(2).cloned().ok_or_else(malformed)?,
            )
            .map_err(|_| malformed())?;
            Ok(RelayFrame::Event {
                sub_id: sub_id.to_owned(),
                event: Box::new(event),
            })
        }
        "EOSE" => {
            let sub_id = parts.get(1).and_then(Value::as_str).ok_or_else(malformed)?;
            Ok(RelayFrame::Eose {
                sub_id: sub_id.to_owned(),
            })
        }
        "NOTICE" => {
            let message = parts.get(1).and_then(Value::as_str).unwrap_or_default();
            Ok(RelayFrame::Notice {
                message: message.to_owned(),
            })
        }
        "CLOSED" => {
            let sub_id = parts.get(1).and_then(Value::as_str).ok_or_else(malformed)?;
            let reason = parts.get(2).and_then(Value::as_str).unwrap_or_default();
            Ok(RelayFrame::Closed {
                sub_id: sub_id.to_owned(),
                reason: reason.to_owned(),
            })
        }
        "OK" => {
            let event_id = parts
                .get(1)
                .and_then(Value::as_str)
                .and_then(|id| id.parse().ok());
            let accepted = parts.get(2).and_then(Value::as_bool).unwrap_or(false);
            let reason = parts.get(3).and_then(Value::as_str).unwrap_or_default();
            Ok(RelayFrame::Ok {
                event_id,
                accepted,
                reason: reason.to_owned(),
            })
        }
        _ => Err(FrameError::UnknownType { frame_type }),
    }
}
