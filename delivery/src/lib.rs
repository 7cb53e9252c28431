//! Push notification delivery for Apple (APNs), Firebase Cloud Messaging v1 and legacy GCM.
//!
//! A [`router::Router`] owns one [`dispatcher::Worker`] per configured project. Each worker
//! converts a generic [`notification::Notification`] into its provider's wire format, sends it
//! to every device token with bounded concurrency and reports back the tokens the provider
//! declared dead.

pub mod certificate;
pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod errors;
pub mod metrics_defs;
pub mod notification;
mod pipe;
pub mod providers;
pub mod retry;
pub mod router;
pub mod topics;

#[cfg(test)]
mod testutils;
