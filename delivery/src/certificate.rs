//! Capabilities granted by an Apple push certificate.

use crate::errors::ConstructionError;
use crate::topics::extract_topics;
use std::collections::BTreeSet;
use x509_parser::pem::Pem;

pub const OID_DEVELOPMENT: &str = "1.2.840.113635.100.6.3.1";
pub const OID_PRODUCTION: &str = "1.2.840.113635.100.6.3.2";
pub const OID_VOIP: &str = "1.2.840.113635.100.6.3.5";
pub const OID_VOIP_TOPICS: &str = "1.2.840.113635.100.6.3.6";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CertificateCapabilities {
    pub is_sandbox: bool,
    pub supports_voip: bool,
    pub supports_production: bool,
    pub allowed_topics: BTreeSet<String>,
}

impl CertificateCapabilities {
    /// Inspects every certificate in a PEM bundle. Other blocks (keys) are skipped.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ConstructionError> {
        let mut capabilities = CertificateCapabilities::default();
        let mut found = false;

        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| ConstructionError::Certificate(e.to_string()))?;
            if block.label != "CERTIFICATE" {
                continue;
            }
            let cert = block
                .parse_x509()
                .map_err(|e| ConstructionError::Certificate(e.to_string()))?;
            found = true;

            for ext in cert.extensions() {
                capabilities.apply(&ext.oid.to_id_string(), ext.value)?;
            }
        }

        if !found {
            return Err(ConstructionError::MissingCertificate);
        }
        Ok(capabilities)
    }

    fn apply(&mut self, oid: &str, value: &[u8]) -> Result<(), ConstructionError> {
        match oid {
            OID_DEVELOPMENT => self.is_sandbox = true,
            OID_PRODUCTION => self.supports_production = true,
            OID_VOIP => self.supports_voip = true,
            OID_VOIP_TOPICS => self.allowed_topics.extend(extract_topics(value)?),
            _ => {}
        }
        Ok(())
    }

    /// Fails when a topic is configured but the certificate lists topics that exclude it.
    /// Certificates without a topic list accept any topic.
    pub fn check_topic(&self, topic: Option<&str>) -> Result<(), ConstructionError> {
        match topic {
            Some(topic)
                if !self.allowed_topics.is_empty() && !self.allowed_topics.contains(topic) =>
            {
                Err(ConstructionError::TopicNotAllowed {
                    topic: topic.to_string(),
                    allowed: self.allowed_topics.iter().cloned().collect(),
                })
            }
            _ => Ok(()),
        }
    }
}
