pub mod auth;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod multiplexer;
pub mod persistence;
pub mod session;

pub use auth::{AuthProfileFailoverManager, BackoffPolicy, ExponentialBackoff, ProfileLease};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use domain::channel::{
    ChannelIdentity, ChannelType, ContentPart, ConversationKey, ConversationScope,
    InboundEnvelope, MessageId, OutboundEnvelope,
};
pub use domain::profile::{AuthProfile, ProfileId, ProfileStatus};
pub use domain::session::{HistoryEntry, HistoryRole, Session, SessionId, SessionState};
pub use domain::tool::{
    CorrelationId, ToolAccess, ToolCallRequest, ToolCallStatus, ToolInvocationRecord,
};
pub use errors::GatewayError;
pub use multiplexer::{ControlEvent, EventType, StreamMultiplexer, Subscription};
pub use persistence::{InMemoryKvStore, KvStore, StoreError};
pub use session::{InvocationPermit, SessionExpiryListener, SessionRegistry};
