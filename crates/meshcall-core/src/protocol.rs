//! Relay wire schema.
//!
//! Every relay frame is a JSON object tagged by `type`. The relay forwards
//! `signal` payloads untouched, so negotiation data travels as a JSON string
//! embedded in the envelope's `data` field.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::MeshError;

/// Longest chat body the relay accepts, in bytes.
pub const MAX_CHAT_BODY_LEN: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Welcome {
        from: String,
    },
    Peers {
        #[serde(default, deserialize_with = "null_as_empty")]
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        from: String,
    },
    PeerLeft {
        from: String,
    },
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        data: String,
    },
    Chat {
        /// Outgoing body, string-encoded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// Incoming message as stored by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<ChatMessage>,
    },
    ChatHistory {
        #[serde(default, deserialize_with = "null_as_empty")]
        messages: Vec<ChatMessage>,
    },
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, MeshError> {
        serde_json::from_str(text).map_err(|e| MeshError::Protocol(format!("malformed envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::Protocol(e.to_string()))
    }

    /// Wrap a negotiation payload addressed to `to`.
    pub fn signal(to: &str, payload: &SignalPayload) -> Result<Self, MeshError> {
        Ok(Envelope::Signal {
            from: None,
            to: Some(to.to_string()),
            data: payload.to_json()?,
        })
    }

    pub fn chat(body: &str) -> Self {
        Envelope::Chat {
            data: Some(body.to_string()),
            msg: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Welcome { .. } => "welcome",
            Envelope::Peers { .. } => "peers",
            Envelope::PeerJoined { .. } => "peer-joined",
            Envelope::PeerLeft { .. } => "peer-left",
            Envelope::Signal { .. } => "signal",
            Envelope::Chat { .. } => "chat",
            Envelope::ChatHistory { .. } => "chat-history",
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Roster entry in a `peers` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl PeerInfo {
    /// Display name with the empty string treated as absent.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// Candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Decoded `data` of a `signal` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn parse(data: &str) -> Result<Self, MeshError> {
        serde_json::from_str(data).map_err(|e| MeshError::Protocol(format!("malformed signal payload: {e}")))
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub body: String,
    /// RFC 3339 creation time assigned by the relay.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ChatMessage {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
    }

    /// Who to show next to the message: name, short id, or a placeholder.
    pub fn sender_label(&self) -> String {
        if let Some(name) = self.sender_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if !self.sender.is_empty() {
            return self.sender.chars().take(6).collect();
        }
        "peer".to_string()
    }

    /// `"<sender> · HH:MM:SS"` in local time; falls back to now when the
    /// relay sent no usable timestamp.
    pub fn meta_line(&self) -> String {
        let at = self.timestamp().unwrap_or_else(Utc::now);
        let local: DateTime<Local> = at.with_timezone(&Local);
        format!("{} · {}", self.sender_label(), local.format("%H:%M:%S"))
    }
}
