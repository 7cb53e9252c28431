//! Mapping of the generic notification onto each provider's wire format.
//!
//! Every converter is a pure function of the notification, the project policy and (for
//! APNs) the certificate capabilities.

pub mod apns;
pub mod fcm;
pub mod gcm;

use crate::errors::ConversionError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

pub(crate) fn encode_data(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Encodes a nested value as a JSON string for string-only data maps.
pub(crate) fn to_json_string<T: Serialize>(value: &T) -> Result<String, ConversionError> {
    serde_json::to_string(value).map_err(|e| ConversionError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_helpers() {
        assert_eq!(encode_data(b"secret"), "c2VjcmV0");
        let fields = BTreeMap::from([("id", "1"), ("type", "2")]);
        assert_eq!(to_json_string(&fields).unwrap(), r#"{"id":"1","type":"2"}"#);
    }
}
