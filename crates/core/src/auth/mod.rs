pub mod backoff;
pub mod failover;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use failover::{AuthProfileFailoverManager, FailoverPolicy, ProfileLease, ProfileSummary};
