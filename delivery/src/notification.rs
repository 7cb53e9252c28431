//! The provider-independent notification model.

use crate::errors::ConversionError;
use std::collections::BTreeMap;

/// A push as submitted by a caller, before conversion to any provider's wire format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notification {
    /// Exactly one variant. `None` is an input error reported at conversion time.
    pub payload: Option<Payload>,
    pub collapse_key: String,
    /// Seconds. Zero means the provider default.
    pub time_to_live: u32,
    pub sequence: i32,
}

impl Notification {
    pub fn new(payload: Payload) -> Self {
        Notification {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn payload(&self) -> Result<&Payload, ConversionError> {
        self.payload.as_ref().ok_or(ConversionError::MissingPayload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Voip(VoipPush),
    Alerting(AlertingPush),
    Encrypted(EncryptedPush),
    Silent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoipPush {
    pub call_id: i64,
    pub call_id_str: String,
    pub attempt_index: i32,
    pub display_name: String,
    pub event_bus_id: String,
    pub update_type: String,
    pub disposal_reason: String,
    pub peer: Option<Peer>,
    pub out_peer: Option<OutPeer>,
    pub video: bool,
    pub merge: Option<Merge>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerType {
    #[default]
    Unknown,
    Private,
    Group,
    Sip,
}

impl PeerType {
    /// Numeric code understood by the mobile clients.
    pub const fn code(&self) -> i32 {
        match self {
            PeerType::Private => 1,
            PeerType::Group => 2,
            PeerType::Sip => 4,
            PeerType::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Peer {
    pub id: i32,
    pub peer_type: PeerType,
    pub str_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutPeer {
    pub id: i32,
    pub peer_type: PeerType,
    pub access_hash: i64,
    pub str_id: String,
}

impl Peer {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("id".to_string(), self.id.to_string()),
            ("type".to_string(), self.peer_type.code().to_string()),
            ("strId".to_string(), self.str_id.clone()),
        ])
    }
}

impl OutPeer {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("id".to_string(), self.id.to_string()),
            ("type".to_string(), self.peer_type.code().to_string()),
            ("accessHash".to_string(), self.access_hash.to_string()),
            ("strId".to_string(), self.str_id.clone()),
        ])
    }
}

/// Collapses consecutive call pushes on the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merge {
    pub key: String,
    pub merge: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalizedText {
    pub loc_key: String,
    pub loc_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertingPush {
    pub title: String,
    pub loc_title: Option<LocalizedText>,
    pub body: String,
    pub loc_body: Option<LocalizedText>,
    pub badge: i32,
    pub mid: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptedPush {
    pub nonce: i64,
    pub encrypted_data: Vec<u8>,
    pub public_alerting: Option<AlertingPush>,
}
