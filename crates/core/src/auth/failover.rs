use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::backoff::BackoffPolicy;
use crate::clock::SharedClock;
use crate::config::{AuthConfig, ProfileConfig};
use crate::domain::profile::{AuthProfile, ProfileId, ProfileSnapshot, ProfileStatus};
use crate::errors::GatewayError;
use crate::persistence::{get_json, set_json, KvStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailoverPolicy {
    pub max_failures: u32,
    pub wait_for_cooldown: bool,
    pub max_wait: Duration,
}

impl From<&AuthConfig> for FailoverPolicy {
    fn from(config: &AuthConfig) -> Self {
        Self {
            max_failures: config.max_failures,
            wait_for_cooldown: config.wait_for_cooldown,
            max_wait: config.max_wait(),
        }
    }
}

/// The profile chosen for one invocation attempt.
#[derive(Clone, Debug)]
pub struct ProfileLease {
    pub id: ProfileId,
    pub provider_id: String,
    pub credential_ref: String,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub available: usize,
    pub cooling: usize,
    pub exhausted: usize,
}

#[derive(Clone, Copy, Debug)]
struct ProfileState {
    status: ProfileStatus,
    failure_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl ProfileState {
    fn fresh() -> Self {
        Self { status: ProfileStatus::Available, failure_count: 0, cooldown_until: None }
    }

    /// `cooling --elapsed--> available`; the failure count is kept until a success.
    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ProfileStatus::Cooling
            && self.cooldown_until.map_or(true, |until| until <= now)
        {
            self.status = ProfileStatus::Available;
            self.cooldown_until = None;
            return true;
        }
        false
    }
}

struct ProfileSlot {
    id: ProfileId,
    provider_id: String,
    credential_ref: String,
    api_key: Option<SecretString>,
    priority: u32,
    state: Mutex<ProfileState>,
}

impl ProfileSlot {
    fn lease(&self) -> ProfileLease {
        ProfileLease {
            id: self.id.clone(),
            provider_id: self.provider_id.clone(),
            credential_ref: self.credential_ref.clone(),
            api_key: self.api_key.clone(),
        }
    }

    fn snapshot(&self, state: &ProfileState) -> AuthProfile {
        AuthProfile {
            id: self.id.clone(),
            provider_id: self.provider_id.clone(),
            credential_ref: self.credential_ref.clone(),
            priority: self.priority,
            status: state.status,
            failure_count: state.failure_count,
            cooldown_until: state.cooldown_until,
        }
    }
}

/// Profiles sharing one priority; selection rotates through them.
struct PriorityTier {
    slots: Range<usize>,
    cursor: AtomicUsize,
}

/// Pool of provider credentials with a per-profile cooldown state machine.
/// Each profile carries its own lock; selection scans without a pool lock.
pub struct AuthProfileFailoverManager {
    slots: Vec<ProfileSlot>,
    tiers: Vec<PriorityTier>,
    policy: FailoverPolicy,
    backoff: Arc<dyn BackoffPolicy>,
    clock: SharedClock,
    store: Option<Arc<dyn KvStore>>,
}

impl AuthProfileFailoverManager {
    pub fn new(
        profiles: &[ProfileConfig],
        policy: FailoverPolicy,
        backoff: Arc<dyn BackoffPolicy>,
        clock: SharedClock,
    ) -> Self {
        let mut ordered: Vec<&ProfileConfig> = profiles.iter().collect();
        ordered.sort_by_key(|profile| profile.priority);

        let slots: Vec<ProfileSlot> = ordered
            .into_iter()
            .map(|profile| ProfileSlot {
                id: ProfileId(profile.id.clone()),
                provider_id: profile.provider.clone(),
                credential_ref: profile.credential_ref.clone(),
                api_key: profile.api_key.clone(),
                priority: profile.priority,
                state: Mutex::new(ProfileState::fresh()),
            })
            .collect();

        let mut tiers = Vec::new();
        let mut start = 0;
        while start < slots.len() {
            let priority = slots[start].priority;
            let end = slots[start..]
                .iter()
                .position(|slot| slot.priority != priority)
                .map_or(slots.len(), |offset| start + offset);
            tiers.push(PriorityTier { slots: start..end, cursor: AtomicUsize::new(0) });
            start = end;
        }

        Self { slots, tiers, policy, backoff, clock, store: None }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Highest-priority available profile, rotating within a priority tier.
    /// With `wait_for_cooldown`, blocks on the nearest cooldown up to `max_wait`.
    pub async fn select(&self) -> Result<ProfileLease, GatewayError> {
        let deadline = tokio::time::Instant::now() + self.policy.max_wait;
        loop {
            if let Some(lease) = self.try_select().await {
                return Ok(lease);
            }
            if !self.policy.wait_for_cooldown {
                break;
            }

            let Some(nearest) = self.nearest_cooldown().await else {
                break;
            };
            let wait = (nearest - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1));
            if tokio::time::Instant::now() + wait > deadline {
                tracing::debug!(
                    event_name = "auth.profile.wait_exceeded",
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "nearest cooldown is beyond the configured max wait"
                );
                break;
            }
            tracing::debug!(
                event_name = "auth.profile.waiting",
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "waiting for a profile cooldown to elapse"
            );
            tokio::time::sleep(wait).await;
        }

        tracing::warn!(event_name = "auth.profile.none_available", "no auth profile is available");
        Err(GatewayError::NoAvailableProfile)
    }

    async fn try_select(&self) -> Option<ProfileLease> {
        let now = self.clock.now();
        for tier in &self.tiers {
            let size = tier.slots.len();
            let start = tier.cursor.fetch_add(1, Ordering::Relaxed) % size;
            for offset in 0..size {
                let slot = &self.slots[tier.slots.start + (start + offset) % size];
                let mut state = slot.state.lock().await;
                if state.refresh(now) {
                    tracing::info!(
                        event_name = "auth.profile.available",
                        profile_id = %slot.id,
                        "profile cooldown elapsed"
                    );
                    let snapshot = slot.snapshot(&state);
                    self.persist(&snapshot).await;
                }
                if state.status == ProfileStatus::Available {
                    tracing::debug!(
                        event_name = "auth.profile.selected",
                        profile_id = %slot.id,
                        priority = slot.priority,
                        "auth profile selected"
                    );
                    return Some(slot.lease());
                }
            }
        }
        None
    }

    async fn nearest_cooldown(&self) -> Option<DateTime<Utc>> {
        let mut nearest: Option<DateTime<Utc>> = None;
        for slot in &self.slots {
            let state = slot.state.lock().await;
            if state.status != ProfileStatus::Cooling {
                continue;
            }
            if let Some(until) = state.cooldown_until {
                nearest = Some(nearest.map_or(until, |current| current.min(until)));
            }
        }
        nearest
    }

    /// Records a provider failure. Reaching `max_failures` exhausts the profile;
    /// otherwise it cools for `backoff(failure_count)`, never shortening an
    /// existing cooldown.
    pub async fn report_failure(&self, id: &ProfileId) -> Option<AuthProfile> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if state.status == ProfileStatus::Exhausted {
            return Some(slot.snapshot(&state));
        }

        let now = self.clock.now();
        state.failure_count = state.failure_count.saturating_add(1);
        if state.failure_count >= self.policy.max_failures {
            state.status = ProfileStatus::Exhausted;
            state.cooldown_until = None;
            tracing::error!(
                event_name = "auth.profile.exhausted",
                profile_id = %slot.id,
                failure_count = state.failure_count,
                "auth profile exhausted; manual reset required"
            );
        } else {
            let cooldown = self.backoff.cooldown(state.failure_count);
            let proposed = now
                + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
            let until = state.cooldown_until.map_or(proposed, |existing| existing.max(proposed));
            state.status = ProfileStatus::Cooling;
            state.cooldown_until = Some(until);
            tracing::warn!(
                event_name = "auth.profile.cooling",
                profile_id = %slot.id,
                failure_count = state.failure_count,
                cooldown_until = %until,
                "auth profile cooling down"
            );
        }

        let snapshot = slot.snapshot(&state);
        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Clears the failure count. An exhausted profile stays exhausted.
    pub async fn report_success(&self, id: &ProfileId) -> Option<AuthProfile> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        if state.status == ProfileStatus::Exhausted {
            return Some(slot.snapshot(&state));
        }
        let changed = state.failure_count != 0 || state.status != ProfileStatus::Available;
        *state = ProfileState::fresh();
        let snapshot = slot.snapshot(&state);
        if changed {
            self.persist(&snapshot).await;
        }
        Some(snapshot)
    }

    pub async fn reset(&self, id: &ProfileId) -> Option<AuthProfile> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        *state = ProfileState::fresh();
        tracing::info!(
            event_name = "auth.profile.reset",
            profile_id = %slot.id,
            "auth profile reset"
        );
        let snapshot = slot.snapshot(&state);
        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Loads persisted state for every configured profile. Entries for
    /// profiles no longer configured are ignored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let mut restored = 0;
        for slot in &self.slots {
            let key = ProfileSnapshot::storage_key(&slot.id);
            match get_json::<ProfileSnapshot>(store.as_ref(), &key).await {
                Ok(Some(snapshot)) => {
                    let mut state = slot.state.lock().await;
                    state.status = snapshot.status;
                    state.failure_count = snapshot.failure_count;
                    state.cooldown_until = snapshot.cooldown_until;
                    restored += 1;
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(
                    event_name = "auth.profile.restore_failed",
                    profile_id = %slot.id,
                    error = %error,
                    "could not restore auth profile state"
                ),
            }
        }
        tracing::info!(
            event_name = "auth.profile.restored",
            restored,
            configured = self.slots.len(),
            "auth profile state restored"
        );
        restored
    }

    pub async fn profiles(&self) -> Vec<AuthProfile> {
        let now = self.clock.now();
        let mut profiles = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut state = slot.state.lock().await;
            state.refresh(now);
            profiles.push(slot.snapshot(&state));
        }
        profiles
    }

    pub async fn profile(&self, id: &ProfileId) -> Option<AuthProfile> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        state.refresh(self.clock.now());
        Some(slot.snapshot(&state))
    }

    pub async fn summary(&self) -> ProfileSummary {
        let mut summary = ProfileSummary::default();
        for profile in self.profiles().await {
            match profile.status {
                ProfileStatus::Available => summary.available += 1,
                ProfileStatus::Cooling => summary.cooling += 1,
                ProfileStatus::Exhausted => summary.exhausted += 1,
            }
        }
        summary
    }

    fn slot(&self, id: &ProfileId) -> Option<&ProfileSlot> {
        self.slots.iter().find(|slot| &slot.id == id)
    }

    async fn persist(&self, profile: &AuthProfile) {
        let Some(store) = &self.store else {
            return;
        };
        let key = ProfileSnapshot::storage_key(&profile.id);
        if let Err(error) = set_json(store.as_ref(), &key, &ProfileSnapshot::from(profile)).await {
            tracing::warn!(
                event_name = "auth.profile.persist_failed",
                profile_id = %profile.id,
                error = %error,
                "could not persist auth profile state"
            );
        }
    }
}
