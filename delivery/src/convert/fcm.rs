use crate::config::ProjectPolicy;
use crate::convert::{encode_data, to_json_string};
use crate::errors::ConversionError;
use crate::notification::{AlertingPush, EncryptedPush, Notification, Payload, VoipPush};
use crate::providers::Converted;
use crate::providers::fcm::{AndroidConfig, AndroidPriority, FcmNotification, Message};
use serde_json::json;
use std::collections::BTreeMap;

/// Builds the FCM v1 message for `notification`, without a device token.
///
/// Alerting pushes are refused when the project disallows alerts.
pub fn to_fcm(
    notification: &Notification,
    policy: &ProjectPolicy,
) -> Result<Converted<Message>, ConversionError> {
    let mut message = Message::default();

    match notification.payload()? {
        Payload::Voip(voip) => add_voip(&mut message.data, voip)?,
        Payload::Encrypted(encrypted) => add_encrypted(&mut message, encrypted, policy)?,
        Payload::Alerting(_) if !policy.allow_alerts => {
            return Err(ConversionError::AlertingNotSupported);
        }
        Payload::Alerting(alerting) => add_alert(&mut message, alerting),
        Payload::Silent => {}
    }

    let mut android = AndroidConfig {
        priority: AndroidPriority::High,
        collapse_key: notification.collapse_key.clone(),
        ..Default::default()
    };
    if notification.time_to_live > 0 {
        android.ttl = format!("{}s", notification.time_to_live);
    }
    message.android = Some(android);

    if notification.sequence > 0 {
        message
            .data
            .insert("seq".into(), notification.sequence.to_string());
    }

    Ok(Converted::Send(message))
}

fn add_voip(data: &mut BTreeMap<String, String>, voip: &VoipPush) -> Result<(), ConversionError> {
    data.insert("callId".into(), voip.call_id.to_string());
    if !voip.call_id_str.is_empty() {
        data.insert("callIdStr".into(), voip.call_id_str.clone());
    }
    data.insert("attemptIndex".into(), voip.attempt_index.to_string());
    data.insert("displayName".into(), voip.display_name.clone());
    data.insert("eventBusId".into(), voip.event_bus_id.clone());
    data.insert("updateType".into(), voip.update_type.clone());
    data.insert("disposalReason".into(), voip.disposal_reason.clone());
    data.insert("video".into(), voip.video.to_string());

    if let Some(peer) = &voip.peer {
        data.insert("peer".into(), to_json_string(&peer.to_fields())?);
    }
    if let Some(out_peer) = &voip.out_peer {
        data.insert("outPeer".into(), to_json_string(&out_peer.to_fields())?);
    }
    if let Some(merge) = &voip.merge {
        data.insert(
            "merge".into(),
            to_json_string(&json!({"key": merge.key, "merge": merge.merge}))?,
        );
    }
    Ok(())
}

fn add_encrypted(
    message: &mut Message,
    encrypted: &EncryptedPush,
    policy: &ProjectPolicy,
) -> Result<(), ConversionError> {
    if encrypted.encrypted_data.is_empty() {
        return Err(ConversionError::EmptyEncryptedPayload);
    }

    match &encrypted.public_alerting {
        Some(public) if policy.allow_alerts => add_alert(message, public),
        Some(public) => {
            if let Some(category) = &public.category {
                message.data.insert("category".into(), category.clone());
            }
        }
        None => {}
    }

    let user_info = BTreeMap::from([
        ("nonce", encrypted.nonce.to_string()),
        ("encrypted", encode_data(&encrypted.encrypted_data)),
    ]);
    message
        .data
        .insert("userInfo".into(), to_json_string(&user_info)?);
    Ok(())
}

fn add_alert(message: &mut Message, alerting: &AlertingPush) {
    message.notification = Some(FcmNotification {
        title: alerting.title.clone(),
        body: alerting.body.clone(),
    });
    if let Some(mid) = &alerting.mid {
        message.data.insert("mid".into(), mid.clone());
    }
    if let Some(category) = &alerting.category {
        message.data.insert("category".into(), category.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Merge, Peer, PeerType};

    fn convert(notification: &Notification, policy: &ProjectPolicy) -> Message {
        match to_fcm(notification, policy).unwrap() {
            Converted::Send(message) => message,
            Converted::Ignore => panic!("push was ignored"),
        }
    }

    fn alerting() -> AlertingPush {
        AlertingPush {
            title: "Alice".into(),
            body: "Hello".into(),
            badge: 2,
            mid: Some("m-1".into()),
            category: Some("message".into()),
            ..Default::default()
        }
    }

    fn allow_alerts() -> ProjectPolicy {
        ProjectPolicy {
            allow_alerts: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_alerting() {
        let mut notification = Notification::new(Payload::Alerting(alerting()));
        notification.collapse_key = "chat-1".into();
        notification.time_to_live = 90;
        notification.sequence = 5;

        let message = convert(&notification, &allow_alerts());
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "data": {"mid": "m-1", "category": "message", "seq": "5"},
                "notification": {"title": "Alice", "body": "Hello"},
                "android": {"collapse_key": "chat-1", "priority": "HIGH", "ttl": "90s"},
            })
        );
    }

    #[test]
    fn test_alerting_disallowed_is_an_error() {
        let notification = Notification::new(Payload::Alerting(alerting()));
        assert_eq!(
            to_fcm(&notification, &ProjectPolicy::default()),
            Err(ConversionError::AlertingNotSupported)
        );
    }

    #[test]
    fn test_silent_sends_envelope() {
        let message = convert(
            &Notification::new(Payload::Silent),
            &ProjectPolicy::default(),
        );
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"android": {"priority": "HIGH"}})
        );
    }

    #[test]
    fn test_voip() {
        let voip = VoipPush {
            call_id: 123,
            call_id_str: "c-123".into(),
            attempt_index: 1,
            display_name: "Bob".into(),
            peer: Some(Peer {
                id: 5,
                peer_type: PeerType::Group,
                str_id: "g5".into(),
            }),
            merge: Some(Merge {
                key: "call-123".into(),
                merge: true,
            }),
            ..Default::default()
        };
        let message = convert(
            &Notification::new(Payload::Voip(voip)),
            &ProjectPolicy::default(),
        );

        assert_eq!(message.data["callId"], "123");
        assert_eq!(message.data["callIdStr"], "c-123");
        assert_eq!(message.data["attemptIndex"], "1");
        assert_eq!(message.data["video"], "false");
        assert_eq!(message.data["peer"], r#"{"id":"5","strId":"g5","type":"2"}"#);
        assert_eq!(message.data["merge"], r#"{"key":"call-123","merge":true}"#);
        assert!(!message.data.contains_key("outPeer"));
        assert_eq!(message.notification, None);
    }

    #[test]
    fn test_encrypted() {
        let encrypted = EncryptedPush {
            nonce: 9,
            encrypted_data: b"secret".to_vec(),
            public_alerting: Some(alerting()),
        };
        let notification = Notification::new(Payload::Encrypted(encrypted.clone()));

        let message = convert(&notification, &ProjectPolicy::default());
        assert_eq!(
            message.data,
            BTreeMap::from([
                ("category".to_string(), "message".to_string()),
                (
                    "userInfo".to_string(),
                    r#"{"encrypted":"c2VjcmV0","nonce":"9"}"#.to_string()
                ),
            ])
        );
        assert_eq!(message.notification, None);

        let message = convert(&notification, &allow_alerts());
        assert_eq!(
            message.notification,
            Some(FcmNotification {
                title: "Alice".into(),
                body: "Hello".into(),
            })
        );
        assert_eq!(message.data["mid"], "m-1");

        let empty = Notification::new(Payload::Encrypted(EncryptedPush {
            encrypted_data: vec![],
            ..encrypted
        }));
        assert_eq!(
            to_fcm(&empty, &allow_alerts()),
            Err(ConversionError::EmptyEncryptedPayload)
        );
    }
}
