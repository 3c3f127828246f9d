use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User id that selects the administrative playbook profile
pub const ROOT_USER_ID: &str = "ROOT";

/// User model - a tenant that owns at most one range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    /// Short range identifier, e.g. "JD"
    pub user_id: String,
    pub name: String,
    /// Hypervisor account name, without the `@pam` realm
    pub username: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_root(&self) -> bool {
        self.user_id == ROOT_USER_ID
    }

    /// Account name as the hypervisor expects it in credentials
    pub fn pam_username(&self) -> String {
        format!("{}@pam", self.username)
    }
}

/// Range model - an isolated virtual lab environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Range {
    pub range_number: i32,
    pub user_id: String,
    pub name: String,
    pub testing_enabled: bool,
    pub allowed_domains: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub range_state: RangeState,
    pub last_deployment: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Range lifecycle state, stored as text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum RangeState {
    #[sqlx(rename = "NEVER DEPLOYED")]
    #[serde(rename = "NEVER DEPLOYED")]
    NeverDeployed,
    #[sqlx(rename = "DEPLOYING")]
    #[serde(rename = "DEPLOYING")]
    Deploying,
    #[sqlx(rename = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
    #[sqlx(rename = "ERROR")]
    #[serde(rename = "ERROR")]
    Error,
    #[sqlx(rename = "ABORTED")]
    #[serde(rename = "ABORTED")]
    Aborted,
    #[sqlx(rename = "DESTROYING")]
    #[serde(rename = "DESTROYING")]
    Destroying,
    #[sqlx(rename = "DESTROYED")]
    #[serde(rename = "DESTROYED")]
    Destroyed,
}

impl std::fmt::Display for RangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeState::NeverDeployed => write!(f, "NEVER DEPLOYED"),
            RangeState::Deploying => write!(f, "DEPLOYING"),
            RangeState::Success => write!(f, "SUCCESS"),
            RangeState::Error => write!(f, "ERROR"),
            RangeState::Aborted => write!(f, "ABORTED"),
            RangeState::Destroying => write!(f, "DESTROYING"),
            RangeState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// Another tenant's range that this owner's range router must allow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AccessGrant {
    pub second_octet: i32,
    pub username: String,
}
