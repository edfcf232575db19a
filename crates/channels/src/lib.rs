//! Channel plumbing: adapter contract, inbound normalization and
//! de-duplication, outbound queueing, and the per-transport receive loop.

pub mod adapter;
pub mod dedupe;
pub mod ingress;
pub mod normalize;
pub mod outbound;
pub mod retry;
pub mod router;

pub use adapter::{AdapterTable, ChannelAdapter, DeliveryError, DeliveryReceipt};
pub use dedupe::{Claim, ClaimTicket, DedupeCache, DuplicateWaiter};
pub use ingress::{ChannelTransport, InboundSink, IngressExit, IngressRunner, TransportError};
pub use normalize::{normalize, AdapterEvent, NormalizeError, RawGroupMessage, RawMedia, RawMessage};
pub use outbound::{DeliveryResult, DispatchOutcome, OutboundQueue};
pub use retry::RetryPolicy;
pub use router::{ChannelRouter, IngestOutcome, IngestReceipt, RouterSettings};
