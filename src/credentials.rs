//! API client credentials
//!
//! A credential pairs an opaque public key with a server-side secret, a set
//! of per-resource capability flags and two request quotas.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the caller-facing public key
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Random bytes behind each secret (64 characters once encoded)
pub const SECRET_BYTES: usize = 48;

pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const DEFAULT_DAILY_REQUEST_LIMIT: u32 = 10_000;

/// Resource families exposed behind the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Patients,
    Appointments,
    MedicalRecords,
    Pharmacy,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::Patients,
        Resource::Appointments,
        Resource::MedicalRecords,
        Resource::Pharmacy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Patients => "patients",
            Resource::Appointments => "appointments",
            Resource::MedicalRecords => "medical_records",
            Resource::Pharmacy => "pharmacy",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of access a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

/// Capability flags, one per (resource, read|write) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub can_read_patients: bool,
    pub can_write_patients: bool,
    pub can_read_appointments: bool,
    pub can_write_appointments: bool,
    pub can_read_medical_records: bool,
    pub can_write_medical_records: bool,
    pub can_read_pharmacy: bool,
    pub can_write_pharmacy: bool,
}

impl Capabilities {
    /// Read access to every resource, no writes
    pub fn read_only() -> Self {
        Self {
            can_read_patients: true,
            can_read_appointments: true,
            can_read_medical_records: true,
            can_read_pharmacy: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            can_read_patients: true,
            can_write_patients: true,
            can_read_appointments: true,
            can_write_appointments: true,
            can_read_medical_records: true,
            can_write_medical_records: true,
            can_read_pharmacy: true,
            can_write_pharmacy: true,
        }
    }

    pub fn allows(&self, resource: Resource, access: Access) -> bool {
        match (resource, access) {
            (Resource::Patients, Access::Read) => self.can_read_patients,
            (Resource::Patients, Access::Write) => self.can_write_patients,
            (Resource::Appointments, Access::Read) => self.can_read_appointments,
            (Resource::Appointments, Access::Write) => self.can_write_appointments,
            (Resource::MedicalRecords, Access::Read) => self.can_read_medical_records,
            (Resource::MedicalRecords, Access::Write) => self.can_write_medical_records,
            (Resource::Pharmacy, Access::Read) => self.can_read_pharmacy,
            (Resource::Pharmacy, Access::Write) => self.can_write_pharmacy,
        }
    }

    pub fn set(&mut self, resource: Resource, access: Access, allowed: bool) {
        let flag = match (resource, access) {
            (Resource::Patients, Access::Read) => &mut self.can_read_patients,
            (Resource::Patients, Access::Write) => &mut self.can_write_patients,
            (Resource::Appointments, Access::Read) => &mut self.can_read_appointments,
            (Resource::Appointments, Access::Write) => &mut self.can_write_appointments,
            (Resource::MedicalRecords, Access::Read) => &mut self.can_read_medical_records,
            (Resource::MedicalRecords, Access::Write) => &mut self.can_write_medical_records,
            (Resource::Pharmacy, Access::Read) => &mut self.can_read_pharmacy,
            (Resource::Pharmacy, Access::Write) => &mut self.can_write_pharmacy,
        };
        *flag = allowed;
    }
}

/// A registered API client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub public_key: String,
    /// Shared signing secret, never returned after issuance
    pub secret: String,
    pub is_active: bool,
    pub capabilities: Capabilities,
    pub rate_limit_per_minute: u32,
    pub daily_request_limit: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClientCredential {
    /// Short public key prefix, safe for logs
    pub fn key_prefix(&self) -> &str {
        key_prefix(&self.public_key)
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary::from(self)
    }
}

/// Client fields supplied by an administrator at creation
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_daily_request_limit")]
    pub daily_request_limit: u32,
}

impl NewClient {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: Capabilities::default(),
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            daily_request_limit: DEFAULT_DAILY_REQUEST_LIMIT,
        }
    }
}

fn default_rate_limit_per_minute() -> u32 {
    DEFAULT_RATE_LIMIT_PER_MINUTE
}

fn default_daily_request_limit() -> u32 {
    DEFAULT_DAILY_REQUEST_LIMIT
}

/// Per-flag capability change; absent flags keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CapabilityUpdate {
    pub can_read_patients: Option<bool>,
    pub can_write_patients: Option<bool>,
    pub can_read_appointments: Option<bool>,
    pub can_write_appointments: Option<bool>,
    pub can_read_medical_records: Option<bool>,
    pub can_write_medical_records: Option<bool>,
    pub can_read_pharmacy: Option<bool>,
    pub can_write_pharmacy: Option<bool>,
}

impl CapabilityUpdate {
    pub fn apply(&self, caps: &mut Capabilities) {
        let pairs = [
            (self.can_read_patients, &mut caps.can_read_patients),
            (self.can_write_patients, &mut caps.can_write_patients),
            (self.can_read_appointments, &mut caps.can_read_appointments),
            (self.can_write_appointments, &mut caps.can_write_appointments),
            (self.can_read_medical_records, &mut caps.can_read_medical_records),
            (self.can_write_medical_records, &mut caps.can_write_medical_records),
            (self.can_read_pharmacy, &mut caps.can_read_pharmacy),
            (self.can_write_pharmacy, &mut caps.can_write_pharmacy),
        ];
        for (change, flag) in pairs {
            if let Some(value) = change {
                *flag = value;
            }
        }
    }
}

impl From<Capabilities> for CapabilityUpdate {
    /// Replace every flag
    fn from(c: Capabilities) -> Self {
        Self {
            can_read_patients: Some(c.can_read_patients),
            can_write_patients: Some(c.can_write_patients),
            can_read_appointments: Some(c.can_read_appointments),
            can_write_appointments: Some(c.can_write_appointments),
            can_read_medical_records: Some(c.can_read_medical_records),
            can_write_medical_records: Some(c.can_write_medical_records),
            can_read_pharmacy: Some(c.can_read_pharmacy),
            can_write_pharmacy: Some(c.can_write_pharmacy),
        }
    }
}

/// Partial update of an existing client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub capabilities: Option<CapabilityUpdate>,
    pub rate_limit_per_minute: Option<u32>,
    pub daily_request_limit: Option<u32>,
}

/// Client view without the secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub public_key: String,
    pub is_active: bool,
    pub capabilities: Capabilities,
    pub rate_limit_per_minute: u32,
    pub daily_request_limit: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ClientCredential> for ClientSummary {
    fn from(c: &ClientCredential) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            description: c.description.clone(),
            public_key: c.public_key.clone(),
            is_active: c.is_active,
            capabilities: c.capabilities,
            rate_limit_per_minute: c.rate_limit_per_minute,
            daily_request_limit: c.daily_request_limit,
            created_by: c.created_by.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Key material handed to the administrator exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub client: ClientSummary,
    pub secret: String,
}

/// A freshly generated public key / secret pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub secret: String,
}

impl KeyPair {
    /// Generate both halves independently
    pub fn generate() -> Self {
        Self {
            public_key: generate_public_key(),
            secret: generate_secret(),
        }
    }
}

/// Random alphanumeric public key of [`PUBLIC_KEY_LENGTH`] characters
pub fn generate_public_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PUBLIC_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// URL-safe random secret token
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// First 8 characters of a public key (whole key when shorter)
pub fn key_prefix(public_key: &str) -> &str {
    match public_key.char_indices().nth(8) {
        Some((idx, _)) => &public_key[..idx],
        None => public_key,
    }
}
