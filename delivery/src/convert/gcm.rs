use crate::config::ProjectPolicy;
use crate::convert::encode_data;
use crate::errors::ConversionError;
use crate::notification::{AlertingPush, EncryptedPush, Notification, Payload, VoipPush};
use crate::providers::Converted;
use crate::providers::gcm::{GcmNotification, GcmRequest};
use serde_json::{Map, Value, json};

const PRIORITY_HIGH: &str = "high";

/// Builds the legacy envelope for `notification`, without a recipient.
pub fn to_gcm(
    notification: &Notification,
    policy: &ProjectPolicy,
) -> Result<Converted<GcmRequest>, ConversionError> {
    let mut request = GcmRequest {
        priority: PRIORITY_HIGH.into(),
        ..Default::default()
    };

    match notification.payload()? {
        Payload::Voip(voip) => add_voip(&mut request.data, voip),
        Payload::Encrypted(encrypted) => add_encrypted(&mut request, encrypted, policy)?,
        Payload::Alerting(alerting) if policy.allow_alerts => {
            add_alert(&mut request, alerting, &policy.sound);
            if let Some(mid) = &alerting.mid {
                request.data.insert("mid".into(), json!(mid));
            }
            if let Some(category) = &alerting.category {
                request.data.insert("category".into(), json!(category));
            }
        }
        Payload::Alerting(alerting) => degrade(&mut request, alerting),
        Payload::Silent => {}
    }

    request.collapse_key = notification.collapse_key.clone();
    request.time_to_live = notification.time_to_live;
    if notification.sequence > 0 {
        request
            .data
            .insert("seq".into(), json!(notification.sequence));
    }

    Ok(Converted::Send(request))
}

fn add_voip(data: &mut Map<String, Value>, voip: &VoipPush) {
    data.insert("callId".into(), json!(voip.call_id));
    if !voip.call_id_str.is_empty() {
        data.insert("callIdStr".into(), json!(voip.call_id_str));
    }
    data.insert("attemptIndex".into(), json!(voip.attempt_index));
    data.insert("displayName".into(), json!(voip.display_name));
    data.insert("eventBusId".into(), json!(voip.event_bus_id));
    data.insert("updateType".into(), json!(voip.update_type));
    data.insert("disposalReason".into(), json!(voip.disposal_reason));
    if let Some(peer) = &voip.peer {
        data.insert("peer".into(), json!(peer.to_fields()));
    }
    if let Some(out_peer) = &voip.out_peer {
        data.insert("outPeer".into(), json!(out_peer.to_fields()));
    }
    if let Some(merge) = &voip.merge {
        data.insert("merge".into(), json!({"key": merge.key, "merge": merge.merge}));
    }
    data.insert("video".into(), json!(voip.video));
}

fn add_encrypted(
    request: &mut GcmRequest,
    encrypted: &EncryptedPush,
    policy: &ProjectPolicy,
) -> Result<(), ConversionError> {
    if encrypted.encrypted_data.is_empty() {
        return Err(ConversionError::EmptyEncryptedPayload);
    }

    match &encrypted.public_alerting {
        Some(public) if policy.allow_alerts => add_alert(request, public, &policy.sound),
        Some(public) => degrade(request, public),
        None => {}
    }

    request.data.insert(
        "userInfo".into(),
        json!({
            "nonce": encrypted.nonce.to_string(),
            "encrypted": encode_data(&encrypted.encrypted_data),
        }),
    );
    Ok(())
}

fn add_alert(request: &mut GcmRequest, alerting: &AlertingPush, sound: &str) {
    let mut notification = GcmNotification {
        sound: sound.to_string(),
        ..Default::default()
    };

    match &alerting.loc_title {
        Some(title) => {
            notification.title_loc_key = title.loc_key.clone();
            notification.title_loc_args = title.loc_args.clone();
        }
        None => notification.title = alerting.title.clone(),
    }
    match &alerting.loc_body {
        Some(body) => {
            notification.body_loc_key = body.loc_key.clone();
            notification.body_loc_args = body.loc_args.clone();
        }
        None => notification.body = alerting.body.clone(),
    }

    request.notification = Some(notification);
}

// Alerts are disabled for the project: wake the app without showing anything.
fn degrade(request: &mut GcmRequest, alerting: &AlertingPush) {
    request.content_available = true;
    if alerting.badge > 0 {
        request.data.insert("badge".into(), json!(alerting.badge));
    }
}
