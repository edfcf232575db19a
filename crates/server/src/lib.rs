//! Switchboard gateway process: wires the session registry, channel router,
//! failover manager and tool coordinator into one inbound pipeline, and
//! serves the health and event-stream endpoints.

pub mod bootstrap;
pub mod events_ws;
pub mod gateway;
pub mod health;
pub mod sweeper;

use axum::Router;

use crate::bootstrap::Application;
use crate::health::HealthState;

pub use bootstrap::{assemble, bootstrap, bootstrap_with_config, BootstrapError, Collaborators};
pub use gateway::Gateway;

/// `GET /health` and `GET /v1/events` over the application's components.
pub fn http_router(app: &Application) -> Router {
    health::router(HealthState {
        store: app.store.clone(),
        sessions: app.sessions.clone(),
        profiles: app.profiles.clone(),
    })
    .merge(events_ws::router(app.events.clone()))
}
