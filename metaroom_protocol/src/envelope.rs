// Tagged JSON envelopes.
//
// Every frame on the wire is one JSON object carrying a string tag that names
// its message kind. Two tag dialects coexist: the front-end relay's clients
// tag frames with `MR_Message`, the object-sync relay's clients with `type`.
// `Envelope` parses either dialect, remembers which key was used so replies
// can mirror the request, and keeps every other field as an untyped JSON map.
// Typed views of the body live in `message.rs` and are extracted on demand
// with `Envelope::payload`.
//
// `MessageKind` is the closed vocabulary the relay dispatches on. Anything it
// does not recognize becomes `MessageKind::Other` rather than an error, since
// unknown kinds are logged and ignored by the relay instead of rejected.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Tag key used by front-end clients.
pub const MR_MESSAGE_KEY: &str = "MR_Message";
/// Tag key used by object-sync clients.
pub const TYPE_KEY: &str = "type";

/// Which tag key a frame carried. Parsing checks `MR_Message` first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagKey {
    MrMessage,
    Type,
}

impl TagKey {
    pub fn as_str(self) -> &'static str {
        match self {
            TagKey::MrMessage => MR_MESSAGE_KEY,
            TagKey::Type => TYPE_KEY,
        }
    }
}

/// Errors from decoding or encoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `{MR_MESSAGE_KEY}` or `{TYPE_KEY}` tag")]
    MissingTag,
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The message kinds the relay and clients understand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    LoadWorld,
    UserState,
    UserLeave,
    Echo,
    WriteFiles,
    WatchFiles,
    UnwatchFiles,
    UpdateFile,
    Lock,
    Release,
    Initialize,
    Join,
    Leave,
    Tick,
    Avatar,
    Object,
    Spawn,
    Delete,
    Other(String),
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "Init" => MessageKind::Init,
            "Load_World" => MessageKind::LoadWorld,
            "User_State" => MessageKind::UserState,
            "User_Leave" => MessageKind::UserLeave,
            "Echo" => MessageKind::Echo,
            "Write_Files" => MessageKind::WriteFiles,
            "Watch_Files" => MessageKind::WatchFiles,
            "Unwatch_Files" => MessageKind::UnwatchFiles,
            "Update_File" => MessageKind::UpdateFile,
            "lock" => MessageKind::Lock,
            "release" => MessageKind::Release,
            "initialize" => MessageKind::Initialize,
            "join" => MessageKind::Join,
            "leave" => MessageKind::Leave,
            "tick" => MessageKind::Tick,
            "avatar" => MessageKind::Avatar,
            "object" => MessageKind::Object,
            "spawn" => MessageKind::Spawn,
            "delete" => MessageKind::Delete,
            other => MessageKind::Other(other.to_string()),
        }
    }

    /// The tag string as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Init => "Init",
            MessageKind::LoadWorld => "Load_World",
            MessageKind::UserState => "User_State",
            MessageKind::UserLeave => "User_Leave",
            MessageKind::Echo => "Echo",
            MessageKind::WriteFiles => "Write_Files",
            MessageKind::WatchFiles => "Watch_Files",
            MessageKind::UnwatchFiles => "Unwatch_Files",
            MessageKind::UpdateFile => "Update_File",
            MessageKind::Lock => "lock",
            MessageKind::Release => "release",
            MessageKind::Initialize => "initialize",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Tick => "tick",
            MessageKind::Avatar => "avatar",
            MessageKind::Object => "object",
            MessageKind::Spawn => "spawn",
            MessageKind::Delete => "delete",
            MessageKind::Other(tag) => tag,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame: tag dialect, kind string, and the remaining fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    tag_key: TagKey,
    kind: String,
    body: Map<String, Value>,
}

impl Envelope {
    /// An envelope with an empty body.
    pub fn new(tag_key: TagKey, kind: impl Into<String>) -> Self {
        Envelope {
            tag_key,
            kind: kind.into(),
            body: Map::new(),
        }
    }

    /// Decode a text frame. The tag field is removed from the body.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Value::Object(mut body) = serde_json::from_str::<Value>(text)? else {
            return Err(ProtocolError::NotAnObject);
        };
        for tag_key in [TagKey::MrMessage, TagKey::Type] {
            if let Some(Value::String(kind)) = body.get(tag_key.as_str()) {
                let kind = kind.clone();
                body.remove(tag_key.as_str());
                return Ok(Envelope {
                    tag_key,
                    kind,
                    body,
                });
            }
        }
        Err(ProtocolError::MissingTag)
    }

    /// Build an envelope whose body is the serialized `payload`, which must
    /// serialize to a JSON object.
    pub fn from_payload<T: Serialize>(
        tag_key: TagKey,
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let Value::Object(body) = serde_json::to_value(payload)? else {
            return Err(ProtocolError::NotAnObject);
        };
        Ok(Envelope {
            tag_key,
            kind: kind.into(),
            body,
        })
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// Decode the body as a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.body.clone())).map_err(|source| {
            ProtocolError::Payload {
                kind: self.kind.clone(),
                source,
            }
        })
    }

    pub fn tag_key(&self) -> TagKey {
        self.tag_key
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from_tag(&self.kind)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// The full frame as a JSON value, tag included.
    pub fn to_value(&self) -> Value {
        let mut map = self.body.clone();
        map.insert(
            self.tag_key.as_str().to_string(),
            Value::String(self.kind.clone()),
        );
        Value::Object(map)
    }

    /// The full frame as wire text.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_front_end_dialect() {
        let env = Envelope::parse(r#"{"MR_Message":"Load_World","key":2}"#).unwrap();
        assert_eq!(env.tag_key(), TagKey::MrMessage);
        assert_eq!(env.message_kind(), MessageKind::LoadWorld);
        assert_eq!(env.get("key"), Some(&json!(2)));
        assert!(env.get(MR_MESSAGE_KEY).is_none());
    }

    #[test]
    fn parse_object_sync_dialect() {
        let env = Envelope::parse(r#"{"type":"lock","uid":4,"lockid":1}"#).unwrap();
        assert_eq!(env.tag_key(), TagKey::Type);
        assert_eq!(env.message_kind(), MessageKind::Lock);
    }

    #[test]
    fn mr_message_wins_over_type() {
        let env = Envelope::parse(r#"{"MR_Message":"User_State","type":"avatar"}"#).unwrap();
        assert_eq!(env.message_kind(), MessageKind::UserState);
        // The other key stays in the body untouched.
        assert_eq!(env.get("type"), Some(&json!("avatar")));
    }

    #[test]
    fn non_string_mr_message_falls_back_to_type() {
        let env = Envelope::parse(r#"{"MR_Message":5,"type":"tick"}"#).unwrap();
        assert_eq!(env.tag_key(), TagKey::Type);
        assert_eq!(env.message_kind(), MessageKind::Tick);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Envelope::parse("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"key":1}"#),
            Err(ProtocolError::MissingTag)
        ));
    }

    #[test]
    fn unknown_kind_is_other() {
        let env = Envelope::parse(r#"{"MR_Message":"Dance"}"#).unwrap();
        assert_eq!(env.message_kind(), MessageKind::Other("Dance".into()));
        assert_eq!(env.message_kind().as_str(), "Dance");
    }

    #[test]
    fn to_text_restores_the_tag() {
        let env = Envelope::new(TagKey::Type, "leave").with("user", 3);
        let value: Value = serde_json::from_str(&env.to_text()).unwrap();
        assert_eq!(value, json!({"type": "leave", "user": 3}));
    }

    #[test]
    fn payload_errors_name_the_kind() {
        let env = Envelope::parse(r#"{"type":"lock"}"#).unwrap();
        let err = env.payload::<crate::message::LockRequest>().unwrap_err();
        assert!(err.to_string().contains("lock"), "{err}");
    }

    #[test]
    fn every_known_tag_maps_back_to_itself() {
        for tag in [
            "Init",
            "Load_World",
            "User_State",
            "User_Leave",
            "Echo",
            "Write_Files",
            "Watch_Files",
            "Unwatch_Files",
            "Update_File",
            "lock",
            "release",
            "initialize",
            "join",
            "leave",
            "tick",
            "avatar",
            "object",
            "spawn",
            "delete",
        ] {
            let kind = MessageKind::from_tag(tag);
            assert!(!matches!(kind, MessageKind::Other(_)), "{tag}");
            assert_eq!(kind.as_str(), tag);
        }
    }
}
