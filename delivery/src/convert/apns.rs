use crate::certificate::CertificateCapabilities;
use crate::config::ProjectPolicy;
use crate::convert::encode_data;
use crate::errors::ConversionError;
use crate::notification::{AlertingPush, EncryptedPush, Notification, Payload, VoipPush};
use crate::providers::Converted;
use crate::providers::apns::{ApnsPushType, ApnsRequest};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(20 * 60);
const PRIORITY_IMMEDIATE: u8 = 10;
const PRIORITY_CONSERVE_POWER: u8 = 5;

/// Builds the APNs request for `notification`. Silent pushes are not sent at all.
pub fn to_apns(
    notification: &Notification,
    policy: &ProjectPolicy,
    capabilities: &CertificateCapabilities,
    now: SystemTime,
) -> Result<Converted<ApnsRequest>, ConversionError> {
    let mut aps = Map::new();
    let mut root = Map::new();

    let push_type = match notification.payload()? {
        Payload::Silent => return Ok(Converted::Ignore),
        Payload::Voip(voip) => {
            if !capabilities.supports_voip {
                return Err(ConversionError::AttemptedVoipWithoutCapability);
            }
            add_voip(&mut root, voip);
            ApnsPushType::Voip
        }
        Payload::Alerting(alerting) if policy.allow_alerts => {
            add_alert(&mut aps, alerting, &policy.sound);
            aps.insert("mutable-content".into(), json!(1));
            if let Some(mid) = &alerting.mid {
                root.insert("mid".into(), json!(mid));
            }
            if let Some(category) = &alerting.category {
                root.insert("category".into(), json!(category));
            }
            ApnsPushType::Alert
        }
        Payload::Alerting(alerting) => {
            // Alerts are disabled for the project, deliver a background push instead.
            add_badge(&mut aps, alerting.badge);
            aps.insert("content-available".into(), json!(1));
            ApnsPushType::Background
        }
        Payload::Encrypted(encrypted) => {
            add_encrypted(&mut aps, &mut root, encrypted, policy)?;
            ApnsPushType::Alert
        }
    };

    if notification.sequence > 0 {
        root.insert("seq".into(), json!(notification.sequence));
    }
    root.insert("aps".into(), Value::Object(aps));

    let ttl = match notification.time_to_live {
        0 => DEFAULT_EXPIRATION,
        seconds => Duration::from_secs(u64::from(seconds)),
    };
    let expiration = (now + ttl)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let priority = match push_type {
        ApnsPushType::Background => PRIORITY_CONSERVE_POWER,
        ApnsPushType::Alert | ApnsPushType::Voip => PRIORITY_IMMEDIATE,
    };

    Ok(Converted::Send(ApnsRequest {
        push_type,
        priority,
        expiration,
        topic: policy.topic.clone(),
        collapse_id: Some(notification.collapse_key.clone()).filter(|key| !key.is_empty()),
        payload: Arc::new(Value::Object(root)),
    }))
}

fn add_voip(root: &mut Map<String, Value>, voip: &VoipPush) {
    root.insert("callId".into(), json!(voip.call_id.to_string()));
    root.insert("attemptIndex".into(), json!(voip.attempt_index));
    root.insert("displayName".into(), json!(voip.display_name));
    root.insert("eventBusId".into(), json!(voip.event_bus_id));
    root.insert("updateType".into(), json!(voip.update_type));
    root.insert("disposalReason".into(), json!(voip.disposal_reason));
    if let Some(peer) = &voip.peer {
        root.insert("peer".into(), json!(peer.to_fields()));
    }
    if let Some(out_peer) = &voip.out_peer {
        root.insert("outPeer".into(), json!(out_peer.to_fields()));
    }
    root.insert("video".into(), json!(voip.video));
}

fn add_encrypted(
    aps: &mut Map<String, Value>,
    root: &mut Map<String, Value>,
    encrypted: &EncryptedPush,
    policy: &ProjectPolicy,
) -> Result<(), ConversionError> {
    if encrypted.encrypted_data.is_empty() {
        return Err(ConversionError::EmptyEncryptedPayload);
    }

    match &encrypted.public_alerting {
        Some(public) if policy.allow_alerts => add_alert(aps, public, &policy.sound),
        Some(public) => add_badge(aps, public.badge),
        None => {}
    }

    aps.insert("mutable-content".into(), json!(1));
    root.insert(
        "user_info".into(),
        json!({
            "nonce": encrypted.nonce.to_string(),
            "encrypted_data": encode_data(&encrypted.encrypted_data),
        }),
    );
    Ok(())
}

fn add_alert(aps: &mut Map<String, Value>, alerting: &AlertingPush, sound: &str) {
    let mut alert = Map::new();

    if let Some(title) = &alerting.loc_title {
        alert.insert("title-loc-key".into(), json!(title.loc_key));
        alert.insert("title-loc-args".into(), json!(title.loc_args));
    } else if !alerting.title.is_empty() {
        alert.insert("title".into(), json!(alerting.title));
    }

    if let Some(body) = &alerting.loc_body {
        alert.insert("loc-key".into(), json!(body.loc_key));
        alert.insert("loc-args".into(), json!(body.loc_args));
    } else if !alerting.body.is_empty() {
        alert.insert("body".into(), json!(alerting.body));
    }

    if !alert.is_empty() {
        aps.insert("alert".into(), Value::Object(alert));
    }
    if !sound.is_empty() {
        aps.insert("sound".into(), json!(sound));
    }
    add_badge(aps, alerting.badge);
}

fn add_badge(aps: &mut Map<String, Value>, badge: i32) {
    if badge > 0 {
        aps.insert("badge".into(), json!(badge));
    }
}
