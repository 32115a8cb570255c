use lib_asyncbuf::{Checkpoint, IncomingMessage, IncomingRecord, StreamDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of relay input.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InputLine {
    Record { stream: StreamDescriptor, data: Value },
    State { stream: StreamDescriptor, data: Value },
}

impl InputLine {
    /// Parses one JSON line. A record is accounted at the length of its line.
    pub fn parse(line: &str) -> Result<IncomingMessage, serde_json::Error> {
        let message = match serde_json::from_str::<InputLine>(line)? {
            InputLine::Record { stream, data } => IncomingMessage::Record {
                stream,
                record: IncomingRecord::new(data, line.len() as u64),
            },
            InputLine::State { stream, data } => IncomingMessage::State {
                stream,
                state: data,
            },
        };
        Ok(message)
    }
}

/// A committed checkpoint as written to stdout.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OutputState<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub stream: &'a StreamDescriptor,
    pub data: &'a Value,
    pub bound_token: u64,
}

impl<'a> From<&'a Checkpoint> for OutputState<'a> {
    fn from(checkpoint: &'a Checkpoint) -> Self {
        Self {
            msg_type: "STATE",
            stream: &checkpoint.stream,
            data: &checkpoint.state,
            bound_token: checkpoint.bound_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_lines_carry_their_size() {
        let line = r#"{"type":"RECORD","stream":{"namespace":"public","name":"users"},"data":{"id":1}}"#;
        match InputLine::parse(line).unwrap() {
            IncomingMessage::Record { stream, record } => {
                assert_eq!(stream, StreamDescriptor::with_namespace("public", "users"));
                assert_eq!(record.payload, json!({ "id": 1 }));
                assert_eq!(record.size_bytes, line.len() as u64);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn state_lines_without_namespace() {
        let line = r#"{"type":"STATE","stream":{"name":"users"},"data":{"cursor":"2024-01-01"}}"#;
        assert_eq!(
            InputLine::parse(line).unwrap(),
            IncomingMessage::State {
                stream: StreamDescriptor::new("users"),
                state: json!({ "cursor": "2024-01-01" }),
            }
        );
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(InputLine::parse(r#"{"type":"LOG","stream":{"name":"x"},"data":1}"#).is_err());
        assert!(InputLine::parse("not json").is_err());
    }

    #[test]
    fn checkpoint_output_shape() {
        let checkpoint = Checkpoint {
            stream: StreamDescriptor::new("users"),
            bound_token: 42,
            state: json!({ "cursor": 9 }),
            sequence: 0,
        };
        let line = serde_json::to_value(OutputState::from(&checkpoint)).unwrap();
        assert_eq!(
            line,
            json!({
                "type": "STATE",
                "stream": { "namespace": null, "name": "users" },
                "data": { "cursor": 9 },
                "boundToken": 42
            })
        );
    }
}
