// Generation event stream pushed to clients.
//
// Each event is one JSON object framed as an SSE `data:` line:
//   {"text": "..."} | {"error": "..."} | {"cancelled": true}
//   {"auto_renamed": true, "new_name": "..."} | {"done": true}

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One event in a generation stream. `Error`, `Cancelled` and `Done` are
/// terminal; nothing follows them for the same generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Text(String),
    Error(String),
    Cancelled,
    AutoRenamed { new_name: String },
    Done,
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Cancelled | Self::Done)
    }
}

impl Serialize for GenerationEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            Self::Error(error) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", error)?;
                map.end()
            }
            Self::Cancelled => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("cancelled", &true)?;
                map.end()
            }
            Self::AutoRenamed { new_name } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("auto_renamed", &true)?;
                map.serialize_entry("new_name", new_name)?;
                map.end()
            }
            Self::Done => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("done", &true)?;
                map.end()
            }
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    text: Option<String>,
    error: Option<String>,
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    auto_renamed: bool,
    new_name: Option<String>,
    #[serde(default)]
    done: bool,
}

impl<'de> Deserialize<'de> for GenerationEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEvent::deserialize(deserializer)?;
        if let Some(text) = raw.text {
            return Ok(Self::Text(text));
        }
        if let Some(error) = raw.error {
            return Ok(Self::Error(error));
        }
        if raw.cancelled {
            return Ok(Self::Cancelled);
        }
        if raw.auto_renamed {
            let new_name = raw.new_name.ok_or_else(|| D::Error::missing_field("new_name"))?;
            return Ok(Self::AutoRenamed { new_name });
        }
        if raw.done {
            return Ok(Self::Done);
        }
        Err(D::Error::custom("unrecognized generation event"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_to_wire_shapes() {
        assert_eq!(serde_json::to_value(GenerationEvent::Text("hi".into())).unwrap(), json!({"text": "hi"}));
        assert_eq!(
            serde_json::to_value(GenerationEvent::Error("boom".into())).unwrap(),
            json!({"error": "boom"})
        );
        assert_eq!(serde_json::to_value(GenerationEvent::Cancelled).unwrap(), json!({"cancelled": true}));
        assert_eq!(
            serde_json::to_value(GenerationEvent::AutoRenamed { new_name: "Ocean Storm".into() })
                .unwrap(),
            json!({"auto_renamed": true, "new_name": "Ocean Storm"})
        );
        assert_eq!(serde_json::to_value(GenerationEvent::Done).unwrap(), json!({"done": true}));
    }

    #[test]
    fn events_parse_from_wire_shapes() {
        let parsed: GenerationEvent =
            serde_json::from_value(json!({"auto_renamed": true, "new_name": "Lighthouse"})).unwrap();
        assert_eq!(parsed, GenerationEvent::AutoRenamed { new_name: "Lighthouse".into() });

        let parsed: GenerationEvent = serde_json::from_value(json!({"cancelled": true})).unwrap();
        assert_eq!(parsed, GenerationEvent::Cancelled);

        assert!(serde_json::from_value::<GenerationEvent>(json!({"unknown": 1})).is_err());
    }

    #[test]
    fn only_error_cancelled_and_done_are_terminal() {
        assert!(!GenerationEvent::Text("x".into()).is_terminal());
        assert!(!GenerationEvent::AutoRenamed { new_name: "x".into() }.is_terminal());
        assert!(GenerationEvent::Error("x".into()).is_terminal());
        assert!(GenerationEvent::Cancelled.is_terminal());
        assert!(GenerationEvent::Done.is_terminal());
    }
}
