use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::config::{BusyPolicy, SessionsConfig};
use crate::domain::channel::{ChannelIdentity, ChannelType, ConversationKey};
use crate::domain::session::{
    HistoryEntry, HistoryRole, Session, SessionId, SessionSnapshot, SessionState,
};
use crate::domain::tool::CorrelationId;
use crate::errors::GatewayError;
use crate::multiplexer::{EventType, StreamMultiplexer};
use crate::persistence::{get_json, set_json, KvStore};

/// Notified after a session is expired, with the tool calls that were still
/// pending. Held weakly so the registry never owns its observers.
#[async_trait]
pub trait SessionExpiryListener: Send + Sync {
    async fn session_expired(&self, session_id: &SessionId, pending: &[CorrelationId]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistrySettings {
    pub idle_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub max_queued: usize,
    pub history_limit: usize,
}

impl From<&SessionsConfig> for RegistrySettings {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            busy_policy: config.busy_policy,
            max_queued: config.max_queued,
            history_limit: config.history_limit,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryReason {
    Idle,
    Reset,
    Explicit,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reset => "reset",
            Self::Explicit => "explicit",
        }
    }
}

struct SessionFields {
    state: SessionState,
    last_activity_at: DateTime<Utc>,
    pending_tool_calls: BTreeSet<CorrelationId>,
    history: VecDeque<HistoryEntry>,
}

struct SessionEntry {
    id: SessionId,
    identity: ChannelIdentity,
    conversation_key: ConversationKey,
    created_at: DateTime<Utc>,
    fields: Mutex<SessionFields>,
    invocation_slot: Arc<Semaphore>,
    waiting: AtomicUsize,
    lifetime: CancellationToken,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl SessionEntry {
    fn new(
        id: SessionId,
        identity: ChannelIdentity,
        created_at: DateTime<Utc>,
        last_activity_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_key: identity.conversation_key(),
            id,
            identity,
            created_at,
            fields: Mutex::new(SessionFields {
                state: SessionState::Idle,
                last_activity_at,
                pending_tool_calls: BTreeSet::new(),
                history: VecDeque::new(),
            }),
            invocation_slot: Arc::new(Semaphore::new(1)),
            waiting: AtomicUsize::new(0),
            lifetime: CancellationToken::new(),
            in_flight: Mutex::new(None),
        }
    }

    fn fields(&self) -> MutexGuard<'_, SessionFields> {
        lock_or_recover(&self.fields)
    }

    fn snapshot(&self) -> Session {
        let fields = self.fields();
        Session {
            id: self.id.clone(),
            identity: self.identity.clone(),
            conversation_key: self.conversation_key.clone(),
            state: fields.state,
            created_at: self.created_at,
            last_activity_at: fields.last_activity_at,
            pending_tool_calls: fields.pending_tool_calls.clone(),
        }
    }

    fn persisted(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            identity: self.identity.clone(),
            conversation_key: self.conversation_key.clone(),
            created_at: self.created_at,
            last_activity_at: self.fields().last_activity_at,
        }
    }
}

type RouteKey = (ChannelType, ConversationKey);

#[derive(Default)]
struct RegistryInner {
    routes: HashMap<RouteKey, SessionId>,
    sessions: HashMap<SessionId, Arc<SessionEntry>>,
}

/// Holds the session slot for one invocation. Dropping it returns the session
/// to idle and admits the next queued invocation.
pub struct InvocationPermit {
    session_id: SessionId,
    token: CancellationToken,
    entry: Arc<SessionEntry>,
    _slot: OwnedSemaphorePermit,
}

impl InvocationPermit {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Cancelled by an explicit stop or by expiry of the session.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InvocationPermit {
    fn drop(&mut self) {
        {
            let mut fields = self.entry.fields();
            if fields.state == SessionState::Active {
                fields.state = SessionState::Idle;
            }
        }
        let mut in_flight = lock_or_recover(&self.entry.in_flight);
        in_flight.take();
    }
}

/// Maps `(channel, conversation key)` to exactly one live session.
/// The registry lock covers structural changes only; session fields sit
/// behind a per-session lock.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    settings: RegistrySettings,
    events: StreamMultiplexer,
    clock: SharedClock,
    store: Option<Arc<dyn KvStore>>,
    listeners: Mutex<Vec<Weak<dyn SessionExpiryListener>>>,
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings, events: StreamMultiplexer, clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            settings,
            events,
            clock,
            store: None,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register_expiry_listener(&self, listener: Weak<dyn SessionExpiryListener>) {
        lock_or_recover(&self.listeners).push(listener);
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Returns the live session for this identity, creating it on first contact.
    pub async fn resolve(&self, identity: &ChannelIdentity) -> Session {
        let route: RouteKey = (identity.channel_type, identity.conversation_key());
        {
            let inner = self.inner.read().await;
            if let Some(entry) = inner.routes.get(&route).and_then(|id| inner.sessions.get(id)) {
                return entry.snapshot();
            }
        }

        let rehydrated = self.load_snapshot(identity).await;

        let (entry, created) = {
            let mut inner = self.inner.write().await;
            if let Some(entry) = inner.routes.get(&route).and_then(|id| inner.sessions.get(id)) {
                (entry.clone(), false)
            } else {
                let now = self.clock.now();
                let entry = Arc::new(match &rehydrated {
                    Some(snapshot) => SessionEntry::new(
                        snapshot.id.clone(),
                        identity.clone(),
                        snapshot.created_at,
                        snapshot.last_activity_at,
                    ),
                    None => SessionEntry::new(SessionId::generate(), identity.clone(), now, now),
                });
                inner.routes.insert(route, entry.id.clone());
                inner.sessions.insert(entry.id.clone(), entry.clone());
                (entry, true)
            }
        };

        if created {
            let rehydrated = rehydrated.is_some();
            tracing::info!(
                event_name = "session.registry.created",
                session_id = %entry.id,
                channel = %identity.channel_type,
                conversation_key = %entry.conversation_key,
                rehydrated,
                "session created"
            );
            if !rehydrated {
                self.persist(&entry).await;
            }
            self.events.emit(
                EventType::SessionCreated,
                &entry.id,
                json!({
                    "channel": identity.channel_type,
                    "conversationKey": entry.conversation_key,
                    "rehydrated": rehydrated,
                }),
            );
        }
        entry.snapshot()
    }

    pub async fn get(&self, id: &SessionId) -> Result<Session, GatewayError> {
        Ok(self.entry(id).await?.snapshot())
    }

    /// Records activity. Unknown and expired sessions report `SessionNotFound`.
    pub async fn touch(&self, id: &SessionId) -> Result<(), GatewayError> {
        let entry = self.entry(id).await?;
        {
            let mut fields = entry.fields();
            let now = self.clock.now();
            if now > fields.last_activity_at {
                fields.last_activity_at = now;
            }
        }
        self.persist(&entry).await;
        Ok(())
    }

    /// Expires the session; returns `false` when it was already gone.
    pub async fn expire(&self, id: &SessionId) -> bool {
        self.expire_with_reason(id, ExpiryReason::Explicit, None).await
    }

    /// Expires the session currently mapped to `identity` so the next message
    /// starts a fresh one.
    pub async fn reset(&self, identity: &ChannelIdentity) -> Option<SessionId> {
        let route: RouteKey = (identity.channel_type, identity.conversation_key());
        let id = self.inner.read().await.routes.get(&route).cloned()?;
        self.expire_with_reason(&id, ExpiryReason::Reset, None).await.then_some(id)
    }

    /// Records progress of the in-flight invocation (a token, a tool call, a
    /// tool result) as activity. Kept in memory only; `touch` persists.
    pub async fn record_progress(&self, id: &SessionId) -> Result<(), GatewayError> {
        let entry = self.entry(id).await?;
        let now = self.clock.now();
        let mut fields = entry.fields();
        if now > fields.last_activity_at {
            fields.last_activity_at = now;
        }
        Ok(())
    }

    /// Expires every session with no activity for longer than `idle_timeout`.
    /// An in-flight invocation that keeps making progress keeps its session
    /// alive; one that has stalled past the timeout is aborted with it.
    pub async fn sweep(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let threshold = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(threshold) else {
            return Vec::new();
        };
        let stale: Vec<SessionId> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|entry| entry.fields().last_activity_at < cutoff)
                .map(|entry| entry.id.clone())
                .collect()
        };

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if self.expire_with_reason(&id, ExpiryReason::Idle, Some(cutoff)).await {
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            tracing::info!(
                event_name = "session.registry.swept",
                expired = expired.len(),
                "idle sessions expired"
            );
        }
        expired
    }

    /// With `idle_cutoff`, a session active again since the cutoff is kept.
    async fn expire_with_reason(
        &self,
        id: &SessionId,
        reason: ExpiryReason,
        idle_cutoff: Option<DateTime<Utc>>,
    ) -> bool {
        let entry = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.sessions.get(id).cloned() else {
                return false;
            };
            if idle_cutoff.is_some_and(|cutoff| entry.fields().last_activity_at >= cutoff) {
                return false;
            }
            inner.sessions.remove(id);
            let route: RouteKey = (entry.identity.channel_type, entry.conversation_key.clone());
            if inner.routes.get(&route) == Some(id) {
                inner.routes.remove(&route);
            }
            entry
        };

        let pending: Vec<CorrelationId> = {
            let mut fields = entry.fields();
            fields.state = SessionState::Expired;
            std::mem::take(&mut fields.pending_tool_calls).into_iter().collect()
        };
        entry.lifetime.cancel();

        let listeners: Vec<Arc<dyn SessionExpiryListener>> = {
            let mut listeners = lock_or_recover(&self.listeners);
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.session_expired(id, &pending).await;
        }

        if let Some(store) = &self.store {
            if let Err(error) = store.delete(&SessionSnapshot::storage_key(&entry.identity)).await
            {
                tracing::warn!(
                    event_name = "session.registry.persist_failed",
                    session_id = %id,
                    error = %error,
                    "could not delete session snapshot"
                );
            }
        }

        tracing::info!(
            event_name = "session.registry.expired",
            session_id = %id,
            reason = reason.as_str(),
            cancelled_tool_calls = pending.len(),
            "session expired"
        );
        self.events.emit(
            EventType::SessionExpired,
            id,
            json!({
                "reason": reason.as_str(),
                "cancelledToolCalls": pending,
            }),
        );
        true
    }

    /// Admits one invocation at a time per session. A second request waits in
    /// arrival order (queue policy, bounded by `max_queued`) or is refused
    /// with `SessionBusy` (reject policy).
    pub async fn begin_invocation(&self, id: &SessionId) -> Result<InvocationPermit, GatewayError> {
        let entry = self.entry(id).await?;
        let slot = match entry.invocation_slot.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => match self.settings.busy_policy {
                BusyPolicy::Reject => {
                    tracing::debug!(
                        event_name = "session.invocation.rejected",
                        session_id = %id,
                        "session busy; invocation rejected"
                    );
                    return Err(GatewayError::SessionBusy { session_id: id.clone() });
                }
                BusyPolicy::Queue => {
                    let queued = entry.waiting.fetch_add(1, Ordering::SeqCst);
                    if queued >= self.settings.max_queued {
                        entry.waiting.fetch_sub(1, Ordering::SeqCst);
                        return Err(GatewayError::SessionBusy { session_id: id.clone() });
                    }
                    tracing::debug!(
                        event_name = "session.invocation.queued",
                        session_id = %id,
                        position = queued + 1,
                        "invocation queued behind in-flight request"
                    );
                    let acquired = tokio::select! {
                        slot = entry.invocation_slot.clone().acquire_owned() => slot.ok(),
                        _ = entry.lifetime.cancelled() => None,
                    };
                    entry.waiting.fetch_sub(1, Ordering::SeqCst);
                    acquired.ok_or_else(|| GatewayError::SessionNotFound(id.clone()))?
                }
            },
        };

        let token = entry.lifetime.child_token();
        {
            let mut fields = entry.fields();
            if fields.state == SessionState::Expired {
                return Err(GatewayError::SessionNotFound(id.clone()));
            }
            fields.state = SessionState::Active;
            let now = self.clock.now();
            if now > fields.last_activity_at {
                fields.last_activity_at = now;
            }
        }
        *lock_or_recover(&entry.in_flight) = Some(token.clone());

        Ok(InvocationPermit { session_id: id.clone(), token, entry, _slot: slot })
    }

    /// Cancels the in-flight invocation, if any, leaving the session alive.
    pub async fn cancel_invocation(&self, id: &SessionId) -> Result<bool, GatewayError> {
        let entry = self.entry(id).await?;
        let in_flight = lock_or_recover(&entry.in_flight).clone();
        Ok(match in_flight {
            Some(token) => {
                token.cancel();
                tracing::info!(
                    event_name = "session.invocation.stopped",
                    session_id = %id,
                    "in-flight invocation cancelled"
                );
                true
            }
            None => false,
        })
    }

    pub async fn add_pending_tool_call(
        &self,
        id: &SessionId,
        correlation_id: &CorrelationId,
    ) -> Result<(), GatewayError> {
        let entry = self.entry(id).await?;
        let mut fields = entry.fields();
        if !fields.pending_tool_calls.insert(correlation_id.clone()) {
            return Err(GatewayError::DuplicateToolCall {
                session_id: id.clone(),
                correlation_id: correlation_id.clone(),
            });
        }
        Ok(())
    }

    pub async fn remove_pending_tool_call(&self, id: &SessionId, correlation_id: &CorrelationId) {
        if let Ok(entry) = self.entry(id).await {
            entry.fields().pending_tool_calls.remove(correlation_id);
        }
    }

    /// Keeps at most `history_limit` turns, dropping the oldest.
    pub async fn append_history(
        &self,
        id: &SessionId,
        role: HistoryRole,
        text: impl Into<String>,
    ) -> Result<(), GatewayError> {
        let limit = self.settings.history_limit;
        let entry = self.entry(id).await?;
        let mut fields = entry.fields();
        if limit == 0 {
            return Ok(());
        }
        fields.history.push_back(HistoryEntry { role, text: text.into(), at: self.clock.now() });
        while fields.history.len() > limit {
            fields.history.pop_front();
        }
        Ok(())
    }

    pub async fn history(&self, id: &SessionId) -> Result<Vec<HistoryEntry>, GatewayError> {
        let entry = self.entry(id).await?;
        let history = entry.fields().history.iter().cloned().collect();
        Ok(history)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.read().await.sessions.keys().cloned().collect()
    }

    async fn entry(&self, id: &SessionId) -> Result<Arc<SessionEntry>, GatewayError> {
        self.inner
            .read()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(id.clone()))
    }

    async fn load_snapshot(&self, identity: &ChannelIdentity) -> Option<SessionSnapshot> {
        let store = self.store.as_ref()?;
        let key = SessionSnapshot::storage_key(identity);
        let snapshot = match get_json::<SessionSnapshot>(store.as_ref(), &key).await {
            Ok(snapshot) => snapshot?,
            Err(error) => {
                tracing::warn!(
                    event_name = "session.registry.rehydrate_failed",
                    channel = %identity.channel_type,
                    error = %error,
                    "could not read session snapshot"
                );
                return None;
            }
        };

        let threshold =
            chrono::Duration::from_std(self.settings.idle_timeout).unwrap_or(chrono::Duration::MAX);
        if self.clock.now() - snapshot.last_activity_at > threshold {
            if let Err(error) = store.delete(&key).await {
                tracing::warn!(
                    event_name = "session.registry.persist_failed",
                    channel = %identity.channel_type,
                    error = %error,
                    "could not delete stale session snapshot"
                );
            }
            return None;
        }
        Some(snapshot)
    }

    async fn persist(&self, entry: &SessionEntry) {
        let Some(store) = &self.store else {
            return;
        };
        let key = SessionSnapshot::storage_key(&entry.identity);
        if let Err(error) = set_json(store.as_ref(), &key, &entry.persisted()).await {
            tracing::warn!(
                event_name = "session.registry.persist_failed",
                session_id = %entry.id,
                error = %error,
                "could not persist session snapshot"
            );
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::{RegistrySettings, SessionExpiryListener, SessionRegistry};
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::BusyPolicy;
    use crate::domain::channel::{ChannelIdentity, ChannelType};
    use crate::domain::session::{HistoryRole, SessionId, SessionSnapshot, SessionState};
    use crate::domain::tool::CorrelationId;
    use crate::errors::GatewayError;
    use crate::multiplexer::{EventType, StreamMultiplexer};
    use crate::persistence::{get_json, InMemoryKvStore, KvStore, StoreError};

    fn settings(busy_policy: BusyPolicy) -> RegistrySettings {
        RegistrySettings {
            idle_timeout: Duration::from_secs(60),
            busy_policy,
            max_queued: 2,
            history_limit: 3,
        }
    }

    fn registry(clock: &ManualClock, busy_policy: BusyPolicy) -> SessionRegistry {
        let clock: SharedClock = Arc::new(clock.clone());
        SessionRegistry::new(settings(busy_policy), StreamMultiplexer::new(16), clock)
    }

    fn telegram_user(id: &str) -> ChannelIdentity {
        ChannelIdentity::direct(ChannelType::Telegram, id)
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<(SessionId, Vec<CorrelationId>)>>,
    }

    #[async_trait]
    impl SessionExpiryListener for RecordingListener {
        async fn session_expired(&self, session_id: &SessionId, pending: &[CorrelationId]) {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((session_id.clone(), pending.to_vec()));
            }
        }
    }

    #[tokio::test]
    async fn resolve_returns_same_session_until_expired() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let identity = telegram_user("u1");

        let first = registry.resolve(&identity).await;
        let second = registry.resolve(&identity).await;
        assert_eq!(first.id, second.id);

        assert!(registry.expire(&first.id).await);
        assert!(!registry.expire(&first.id).await);
        let third = registry.resolve(&identity).await;
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn group_and_direct_conversations_get_separate_sessions() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);

        let direct = registry.resolve(&telegram_user("u1")).await;
        let group = registry.resolve(&ChannelIdentity::group(ChannelType::Telegram, "u1")).await;
        let other_channel = registry.resolve(&ChannelIdentity::direct(ChannelType::Slack, "u1")).await;

        assert_ne!(direct.id, group.id);
        assert_ne!(direct.id, other_channel.id);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn concurrent_resolves_create_exactly_one_session() {
        let clock = ManualClock::default();
        let registry = Arc::new(registry(&clock, BusyPolicy::Queue));
        let identity = telegram_user("race");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let identity = identity.clone();
            handles.push(tokio::spawn(async move { registry.resolve(&identity).await.id }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            if let Ok(id) = handle.await {
                ids.push(id);
            }
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_expires_only_idle_sessions_and_cancels_pending_calls() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let listener: Arc<RecordingListener> = Arc::new(RecordingListener::default());
        let weak: std::sync::Weak<dyn SessionExpiryListener> = {
            let as_dyn: Arc<dyn SessionExpiryListener> = listener.clone();
            Arc::downgrade(&as_dyn)
        };
        registry.register_expiry_listener(weak);

        let idle = registry.resolve(&telegram_user("idle")).await;
        let call = CorrelationId("call-1".to_owned());
        assert!(registry.add_pending_tool_call(&idle.id, &call).await.is_ok());

        clock.advance(ChronoDuration::seconds(45));
        let busy = registry.resolve(&telegram_user("busy")).await;
        clock.advance(ChronoDuration::seconds(30));
        assert!(registry.touch(&busy.id).await.is_ok());

        let expired = registry.sweep(Duration::from_secs(60)).await;
        assert_eq!(expired, vec![idle.id.clone()]);
        assert!(matches!(registry.get(&idle.id).await, Err(GatewayError::SessionNotFound(_))));
        assert!(registry.get(&busy.id).await.is_ok());

        let seen = listener.seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(seen, vec![(idle.id, vec![call])]);
    }

    #[tokio::test]
    async fn sweep_spares_an_invocation_that_keeps_making_progress() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let session = registry.resolve(&telegram_user("u1")).await;

        clock.advance(ChronoDuration::seconds(50));
        let permit = registry.begin_invocation(&session.id).await;
        let token = permit.as_ref().map(|permit| permit.token()).unwrap_or_default();

        clock.advance(ChronoDuration::seconds(50));
        assert!(registry.record_progress(&session.id).await.is_ok());
        clock.advance(ChronoDuration::seconds(40));

        assert!(registry.sweep(Duration::from_secs(60)).await.is_empty());
        assert!(!token.is_cancelled());
        assert_eq!(
            registry.get(&session.id).await.map(|session| session.state),
            Ok(SessionState::Active)
        );

        clock.advance(ChronoDuration::seconds(30));
        assert_eq!(registry.sweep(Duration::from_secs(60)).await, vec![session.id.clone()]);
        assert!(token.is_cancelled());
        drop(permit);
    }

    #[tokio::test]
    async fn touch_on_unknown_session_reports_not_found() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let missing = SessionId("ses-missing".to_owned());

        assert!(matches!(registry.touch(&missing).await, Err(GatewayError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn reject_policy_refuses_second_invocation() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Reject);
        let session = registry.resolve(&telegram_user("u1")).await;

        let permit = registry.begin_invocation(&session.id).await;
        assert!(permit.is_ok());
        assert_eq!(
            registry.get(&session.id).await.map(|session| session.state),
            Ok(SessionState::Active)
        );
        assert!(matches!(
            registry.begin_invocation(&session.id).await,
            Err(GatewayError::SessionBusy { .. })
        ));

        drop(permit);
        assert!(registry.begin_invocation(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn queue_policy_admits_waiters_after_release() {
        let clock = ManualClock::default();
        let registry = Arc::new(registry(&clock, BusyPolicy::Queue));
        let session = registry.resolve(&telegram_user("u1")).await;

        let first = registry.begin_invocation(&session.id).await;
        assert!(first.is_ok());

        let waiter = {
            let registry = registry.clone();
            let id = session.id.clone();
            tokio::spawn(async move { registry.begin_invocation(&id).await.is_ok() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        assert!(matches!(waiter.await, Ok(true)));
    }

    #[tokio::test]
    async fn expiring_a_session_cancels_its_invocation_token() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let session = registry.resolve(&telegram_user("u1")).await;

        let permit = registry.begin_invocation(&session.id).await;
        let token = permit.as_ref().map(|permit| permit.token()).ok();
        assert!(token.as_ref().is_some_and(|token| !token.is_cancelled()));

        registry.expire(&session.id).await;
        assert!(token.is_some_and(|token| token.is_cancelled()));
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_invocation_but_keeps_session() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let session = registry.resolve(&telegram_user("u1")).await;

        assert_eq!(registry.cancel_invocation(&session.id).await, Ok(false));
        let permit = registry.begin_invocation(&session.id).await;
        assert_eq!(registry.cancel_invocation(&session.id).await, Ok(true));
        assert!(permit.map(|permit| permit.token().is_cancelled()).unwrap_or(false));
        assert!(registry.get(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn history_is_bounded() -> Result<(), GatewayError> {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let session = registry.resolve(&telegram_user("u1")).await;

        for turn in 0..5 {
            registry.append_history(&session.id, HistoryRole::User, format!("m{turn}")).await?;
        }
        let history = registry.history(&session.id).await?;
        let texts: Vec<&str> = history.iter().map(|entry| entry.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        Ok(())
    }

    #[tokio::test]
    async fn reset_starts_a_new_session_for_identity() {
        let clock = ManualClock::default();
        let registry = registry(&clock, BusyPolicy::Queue);
        let identity = telegram_user("u1");
        let first = registry.resolve(&identity).await;

        assert_eq!(registry.reset(&identity).await, Some(first.id.clone()));
        assert_eq!(registry.reset(&identity).await, None);
        assert_ne!(registry.resolve(&identity).await.id, first.id);
    }

    #[tokio::test]
    async fn snapshot_rehydrates_same_session_after_restart() {
        let clock = ManualClock::default();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let identity = telegram_user("u1");

        let before = registry(&clock, BusyPolicy::Queue).with_store(store.clone());
        let original = before.resolve(&identity).await;

        let after = registry(&clock, BusyPolicy::Queue).with_store(store.clone());
        assert_eq!(after.resolve(&identity).await.id, original.id);

        after.expire(&original.id).await;
        let fresh = registry(&clock, BusyPolicy::Queue).with_store(store);
        assert_ne!(fresh.resolve(&identity).await.id, original.id);
    }

    #[tokio::test]
    async fn stale_snapshot_is_not_rehydrated() {
        let clock = ManualClock::default();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let identity = telegram_user("u1");

        let original = registry(&clock, BusyPolicy::Queue)
            .with_store(store.clone())
            .resolve(&identity)
            .await;
        clock.advance(ChronoDuration::minutes(5));

        let restarted = registry(&clock, BusyPolicy::Queue).with_store(store);
        assert_ne!(restarted.resolve(&identity).await.id, original.id);
    }

    /// Reads and writes work; deletes always fail.
    struct UndeletableStore(InMemoryKvStore);

    #[async_trait]
    impl KvStore for UndeletableStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only replica".to_owned()))
        }
    }

    #[tokio::test]
    async fn stale_snapshot_delete_failure_still_starts_a_fresh_session() {
        let clock = ManualClock::default();
        let store: Arc<dyn KvStore> = Arc::new(UndeletableStore(InMemoryKvStore::new()));
        let identity = telegram_user("u1");

        let original = registry(&clock, BusyPolicy::Queue)
            .with_store(store.clone())
            .resolve(&identity)
            .await;
        clock.advance(ChronoDuration::minutes(5));

        let restarted = registry(&clock, BusyPolicy::Queue).with_store(store.clone());
        let fresh = restarted.resolve(&identity).await;
        assert_ne!(fresh.id, original.id);

        let stored: Option<SessionSnapshot> =
            get_json(store.as_ref(), &SessionSnapshot::storage_key(&identity)).await.ok().flatten();
        assert_eq!(stored.map(|snapshot| snapshot.id), Some(fresh.id));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let clock = ManualClock::default();
        let events = StreamMultiplexer::new(8);
        let shared: SharedClock = Arc::new(clock.clone());
        let registry = SessionRegistry::new(settings(BusyPolicy::Queue), events.clone(), shared);
        let mut subscription = events.subscribe(None);

        let session = registry.resolve(&telegram_user("u1")).await;
        registry.expire(&session.id).await;

        let created = subscription.recv().await.map(|event| event.event_type);
        let expired = subscription.recv().await.map(|event| event.event_type);
        assert_eq!(created, Ok(EventType::SessionCreated));
        assert_eq!(expired, Ok(EventType::SessionExpired));
    }
}
