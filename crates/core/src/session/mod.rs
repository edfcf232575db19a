pub mod registry;

pub use registry::{
    ExpiryReason, InvocationPermit, RegistrySettings, SessionExpiryListener, SessionRegistry,
};
