use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(pub String);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Available,
    Cooling,
    /// Terminal until an explicit reset.
    Exhausted,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Cooling => "cooling",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Snapshot of one provider credential and its failover state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: ProfileId,
    pub provider_id: String,
    pub credential_ref: String,
    pub priority: u32,
    pub status: ProfileStatus,
    pub failure_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Persisted mutable state of a profile; static fields come from configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: ProfileId,
    pub status: ProfileStatus,
    pub failure_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ProfileSnapshot {
    pub fn storage_key(id: &ProfileId) -> String {
        format!("auth_profile:{id}")
    }
}

impl From<&AuthProfile> for ProfileSnapshot {
    fn from(profile: &AuthProfile) -> Self {
        Self {
            id: profile.id.clone(),
            status: profile.status,
            failure_count: profile.failure_count,
            cooldown_until: profile.cooldown_until,
        }
    }
}
