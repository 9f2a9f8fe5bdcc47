//! Webhook subscription definitions
//!
//! Subscriptions are data owned by the gateway. Delivery happens elsewhere
//! and only reports back through the delivery counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::credentials::generate_secret;
use crate::error::StoreError;

/// Maximum stored length of the last delivery error
pub const MAX_ERROR_LENGTH: usize = 1000;

/// Platform events a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "patient.created")]
    PatientCreated,
    #[serde(rename = "patient.updated")]
    PatientUpdated,
    #[serde(rename = "appointment.created")]
    AppointmentCreated,
    #[serde(rename = "appointment.updated")]
    AppointmentUpdated,
    #[serde(rename = "appointment.cancelled")]
    AppointmentCancelled,
    #[serde(rename = "medical_record.created")]
    MedicalRecordCreated,
    #[serde(rename = "prescription.created")]
    PrescriptionCreated,
    #[serde(rename = "prescription.dispensed")]
    PrescriptionDispensed,
    #[serde(rename = "lab_result.ready")]
    LabResultReady,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::PatientCreated => "patient.created",
            WebhookEvent::PatientUpdated => "patient.updated",
            WebhookEvent::AppointmentCreated => "appointment.created",
            WebhookEvent::AppointmentUpdated => "appointment.updated",
            WebhookEvent::AppointmentCancelled => "appointment.cancelled",
            WebhookEvent::MedicalRecordCreated => "medical_record.created",
            WebhookEvent::PrescriptionCreated => "prescription.created",
            WebhookEvent::PrescriptionDispensed => "prescription.dispensed",
            WebhookEvent::LabResultReady => "lab_result.ready",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEvent {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient.created" => Ok(WebhookEvent::PatientCreated),
            "patient.updated" => Ok(WebhookEvent::PatientUpdated),
            "appointment.created" => Ok(WebhookEvent::AppointmentCreated),
            "appointment.updated" => Ok(WebhookEvent::AppointmentUpdated),
            "appointment.cancelled" => Ok(WebhookEvent::AppointmentCancelled),
            "medical_record.created" => Ok(WebhookEvent::MedicalRecordCreated),
            "prescription.created" => Ok(WebhookEvent::PrescriptionCreated),
            "prescription.dispensed" => Ok(WebhookEvent::PrescriptionDispensed),
            "lab_result.ready" => Ok(WebhookEvent::LabResultReady),
            other => Err(StoreError::Invalid(format!("unknown webhook event: {}", other))),
        }
    }
}

/// A (client, event, target URL) subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: i64,
    pub client_id: i64,
    pub event: WebhookEvent,
    pub target_url: String,
    /// Signing secret for outbound payloads
    pub secret: String,
    pub is_active: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Validated input for a new subscription
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub client_id: i64,
    pub event: WebhookEvent,
    pub target_url: String,
    pub secret: String,
}

impl NewWebhook {
    /// Validate the target URL and generate a signing secret
    pub fn new(client_id: i64, event: WebhookEvent, target_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client_id,
            event,
            target_url: validate_target_url(target_url)?,
            secret: generate_secret(),
        })
    }
}

/// Outcome reported by the delivery mechanism
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure(String),
}

/// Only absolute http(s) URLs with a host are accepted
pub fn validate_target_url(raw: &str) -> Result<String, StoreError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| StoreError::Invalid(format!("invalid webhook URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(StoreError::Invalid(format!(
                "unsupported webhook URL scheme: {}",
                other
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(StoreError::Invalid("webhook URL has no host".to_string()));
    }

    Ok(url.to_string())
}

/// Clamp a delivery error to [`MAX_ERROR_LENGTH`] characters
pub fn clamp_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LENGTH).collect()
}
