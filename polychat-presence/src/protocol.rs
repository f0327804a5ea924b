//! Wire envelope for room traffic.
//!
//! Two kinds of message share a room's stream:
//!
//! ```text
//! Application   opaque client bytes, forwarded verbatim after normalization
//! Presence      {"type":"presenceUpdate","members":[{"id","username","status"}, …]}
//! ```
//!
//! Several envelopes may be packed into one WebSocket frame by the send
//! loop, separated by [`RECORD_DELIMITER`]. Normalization guarantees no
//! application message carries that byte itself.

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Separator between batched messages inside one outbound frame.
pub const RECORD_DELIMITER: u8 = b'\n';

/// Presence status of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum UserStatus {
    Online = 0,
    Away = 1,
    Offline = 2,
}

impl UserStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unknown values decode as `Offline`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Online,
            1 => Self::Away,
            _ => Self::Offline,
        }
    }
}

/// One row of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: String,
    /// Display name
    pub username: String,
    pub status: UserStatus,
}

impl MemberInfo {
    pub fn new(id: impl Into<String>, username: impl Into<String>, status: UserStatus) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            status,
        }
    }
}

/// A message travelling through a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Client payload; the hub never looks inside.
    Application(Vec<u8>),
    /// Current member roster of a room.
    PresenceUpdate(Vec<MemberInfo>),
}

#[derive(Serialize)]
struct PresenceFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    members: &'a [MemberInfo],
}

#[derive(Deserialize)]
struct EnvelopeProbe {
    #[serde(rename = "type")]
    kind: Option<String>,
    members: Option<Vec<MemberInfo>>,
}

const PRESENCE_TYPE: &str = "presenceUpdate";

impl Envelope {
    pub fn presence(members: Vec<MemberInfo>) -> Self {
        Self::PresenceUpdate(members)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, HubError> {
        match self {
            Self::Application(bytes) => Ok(bytes.clone()),
            Self::PresenceUpdate(members) => {
                let frame = PresenceFrame {
                    kind: PRESENCE_TYPE,
                    members,
                };
                Ok(serde_json::to_vec(&frame)?)
            }
        }
    }

    /// Classify wire bytes. Anything that is not a well-formed presence
    /// update is an application message.
    pub fn decode(bytes: &[u8]) -> Self {
        if let Ok(probe) = serde_json::from_slice::<EnvelopeProbe>(bytes) {
            if probe.kind.as_deref() == Some(PRESENCE_TYPE) {
                if let Some(members) = probe.members {
                    return Self::PresenceUpdate(members);
                }
            }
        }
        Self::Application(bytes.to_vec())
    }

    /// Split a batched frame back into its envelopes.
    pub fn decode_batch(frame: &[u8]) -> Vec<Self> {
        frame
            .split(|b| *b == RECORD_DELIMITER)
            .filter(|part| !part.is_empty())
            .map(Self::decode)
            .collect()
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, Self::PresenceUpdate(_))
    }
}

/// Clean an inbound application frame: embedded newlines become single
/// spaces and surrounding whitespace is dropped.
pub fn normalize(frame: &[u8]) -> Vec<u8> {
    let replaced: Vec<u8> = frame
        .iter()
        .map(|&b| if b == RECORD_DELIMITER { b' ' } else { b })
        .collect();
    replaced.trim_ascii().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_replaces_newlines() {
        assert_eq!(normalize(b"hello\nworld"), b"hello world");
        assert_eq!(normalize(b"a\n\nb"), b"a  b");
    }

    #[test]
    fn test_normalize_trims() {
        assert_eq!(normalize(b"  hello \r\n"), b"hello");
        assert_eq!(normalize(b"hello\n"), b"hello");
        assert_eq!(normalize(b"\n\n"), b"");
    }

    #[test]
    fn test_normalize_leaves_clean_frames_alone() {
        let frame = br#"{"type":"chatMessage","message":{"content":"hi"}}"#;
        assert_eq!(normalize(frame), frame.to_vec());
    }

    #[test]
    fn test_presence_encoding_shape() {
        let env = Envelope::presence(vec![
            MemberInfo::new("u1", "alice", UserStatus::Online),
            MemberInfo::new("u2", "bob", UserStatus::Away),
        ]);
        let bytes = env.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "presenceUpdate");
        assert_eq!(value["members"][0]["id"], "u1");
        assert_eq!(value["members"][0]["username"], "alice");
        assert_eq!(value["members"][0]["status"], "online");
        assert_eq!(value["members"][1]["status"], "away");
    }

    #[test]
    fn test_presence_encoding_has_no_delimiter() {
        let env = Envelope::presence(vec![MemberInfo::new("u\n1", "x", UserStatus::Online)]);
        let bytes = env.encode().unwrap();
        // serde_json escapes control characters inside strings
        assert!(!bytes.contains(&RECORD_DELIMITER));
    }

    #[test]
    fn test_application_passthrough() {
        let env = Envelope::Application(b"raw bytes".to_vec());
        assert_eq!(env.encode().unwrap(), b"raw bytes");
        assert!(!env.is_presence());
    }

    #[test]
    fn test_decode_classifies() {
        let presence = br#"{"type":"presenceUpdate","members":[{"id":"a","username":"a","status":"offline"}]}"#;
        match Envelope::decode(presence) {
            Envelope::PresenceUpdate(members) => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].status, UserStatus::Offline);
            }
            other => panic!("expected presence, got {other:?}"),
        }

        let chat = br#"{"type":"chatMessage","message":{}}"#;
        assert_eq!(Envelope::decode(chat), Envelope::Application(chat.to_vec()));
        assert_eq!(
            Envelope::decode(b"not json"),
            Envelope::Application(b"not json".to_vec())
        );
    }

    #[test]
    fn test_decode_batch() {
        let presence = Envelope::presence(vec![]).encode().unwrap();
        let mut frame = b"hello".to_vec();
        frame.push(RECORD_DELIMITER);
        frame.extend_from_slice(&presence);

        let parts = Envelope::decode_batch(&frame);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], Envelope::Application(b"hello".to_vec()));
        assert_eq!(parts[1], Envelope::PresenceUpdate(vec![]));
    }

    #[test]
    fn test_status_u8_mapping() {
        for status in [UserStatus::Online, UserStatus::Away, UserStatus::Offline] {
            assert_eq!(UserStatus::from_u8(status.as_u8()), status);
        }
        assert_eq!(UserStatus::from_u8(200), UserStatus::Offline);
    }
}
