use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use switchboard_core::domain::channel::{ChannelType, MessageId};
use tokio::sync::watch;

pub type DedupeKey = (ChannelType, MessageId);

/// First sighting of a message; the holder must `complete` it with the outcome.
/// Dropping it uncompleted forgets the message so a replay is processed anew.
pub struct ClaimTicket<T> {
    sender: watch::Sender<Option<T>>,
    state: Arc<Mutex<DedupeState<T>>>,
    key: DedupeKey,
    generation: u64,
    completed: bool,
}

impl<T> ClaimTicket<T> {
    pub fn complete(mut self, outcome: T) {
        self.sender.send_replace(Some(outcome));
        self.completed = true;
    }
}

impl<T> Drop for ClaimTicket<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = lock_state(&self.state);
        if state.entries.get(&self.key).is_some_and(|entry| entry.generation == self.generation) {
            state.entries.remove(&self.key);
            let (key, generation) = (&self.key, self.generation);
            state.order.retain(|(queued, queued_generation)| {
                queued != key || *queued_generation != generation
            });
            tracing::debug!(
                event_name = "channel.inbound.claim_abandoned",
                channel = %self.key.0,
                message_id = %self.key.1.0,
                "inbound claim dropped without an outcome; message forgotten"
            );
        }
    }
}

/// Replay of a message already claimed; resolves to the original outcome.
pub struct DuplicateWaiter<T> {
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone> DuplicateWaiter<T> {
    /// `None` when the original claim was abandoned without an outcome.
    pub async fn outcome(mut self) -> Option<T> {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

pub enum Claim<T> {
    First(ClaimTicket<T>),
    Duplicate(DuplicateWaiter<T>),
}

struct DedupeEntry<T> {
    generation: u64,
    receiver: watch::Receiver<Option<T>>,
}

struct DedupeState<T> {
    entries: HashMap<DedupeKey, DedupeEntry<T>>,
    order: VecDeque<(DedupeKey, u64)>,
    next_generation: u64,
}

/// Remembers the outcome of the last `capacity` inbound messages per
/// `(channel, message id)`, evicting the oldest first.
pub struct DedupeCache<T> {
    capacity: usize,
    state: Arc<Mutex<DedupeState<T>>>,
}

impl<T: Clone> DedupeCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(DedupeState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
            })),
        }
    }

    pub fn claim(&self, key: DedupeKey) -> Claim<T> {
        let mut state = lock_state(&self.state);
        if let Some(entry) = state.entries.get(&key) {
            return Claim::Duplicate(DuplicateWaiter { receiver: entry.receiver.clone() });
        }

        let (sender, receiver) = watch::channel(None);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(key.clone(), DedupeEntry { generation, receiver });
        state.order.push_back((key.clone(), generation));
        while state.order.len() > self.capacity {
            if let Some((evicted, evicted_generation)) = state.order.pop_front() {
                if state.entries.get(&evicted).is_some_and(|entry| entry.generation == evicted_generation)
                {
                    state.entries.remove(&evicted);
                }
            }
        }
        Claim::First(ClaimTicket { sender, state: self.state.clone(), key, generation, completed: false })
    }

    pub fn len(&self) -> usize {
        lock_state(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_state<T>(state: &Mutex<DedupeState<T>>) -> MutexGuard<'_, DedupeState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use switchboard_core::domain::channel::{ChannelType, MessageId};

    use super::{Claim, DedupeCache};

    fn key(channel: ChannelType, id: &str) -> (ChannelType, MessageId) {
        (channel, MessageId(id.to_owned()))
    }

    #[tokio::test]
    async fn duplicate_receives_first_outcome() {
        let cache: DedupeCache<String> = DedupeCache::new(8);

        let Claim::First(ticket) = cache.claim(key(ChannelType::Telegram, "m1")) else {
            panic!("first sighting should be a fresh claim");
        };
        let Claim::Duplicate(waiter) = cache.claim(key(ChannelType::Telegram, "m1")) else {
            panic!("second sighting should be a duplicate");
        };

        let pending = tokio::spawn(waiter.outcome());
        ticket.complete("Hello".to_owned());

        assert_eq!(pending.await.ok().flatten(), Some("Hello".to_owned()));
    }

    #[tokio::test]
    async fn same_message_id_on_other_channel_is_distinct() {
        let cache: DedupeCache<u8> = DedupeCache::new(8);

        assert!(matches!(cache.claim(key(ChannelType::Telegram, "m1")), Claim::First(_)));
        assert!(matches!(cache.claim(key(ChannelType::Discord, "m1")), Claim::First(_)));
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted_past_capacity() {
        let cache: DedupeCache<u8> = DedupeCache::new(2);

        for id in ["a", "b", "c"] {
            if let Claim::First(ticket) = cache.claim(key(ChannelType::Slack, id)) {
                ticket.complete(1);
            }
        }

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.claim(key(ChannelType::Slack, "a")), Claim::First(_)));
        assert!(matches!(cache.claim(key(ChannelType::Slack, "c")), Claim::Duplicate(_)));
    }

    #[tokio::test]
    async fn abandoned_claim_forgets_the_message() {
        let cache: DedupeCache<u8> = DedupeCache::new(4);

        let first = cache.claim(key(ChannelType::Signal, "m1"));
        let Claim::Duplicate(waiter) = cache.claim(key(ChannelType::Signal, "m1")) else {
            panic!("second sighting should be a duplicate");
        };
        drop(first);

        assert_eq!(waiter.outcome().await, None);
        assert!(cache.is_empty());
        assert!(matches!(cache.claim(key(ChannelType::Signal, "m1")), Claim::First(_)));
    }

    #[tokio::test]
    async fn completed_claim_stays_cached_after_ticket_is_consumed() {
        let cache: DedupeCache<u8> = DedupeCache::new(4);

        if let Claim::First(ticket) = cache.claim(key(ChannelType::Signal, "m1")) {
            ticket.complete(7);
        }

        let Claim::Duplicate(waiter) = cache.claim(key(ChannelType::Signal, "m1")) else {
            panic!("completed message should stay cached");
        };
        assert_eq!(waiter.outcome().await, Some(7));
    }
}
