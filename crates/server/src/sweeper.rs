use std::sync::Arc;
use std::time::Duration;

use switchboard_core::session::SessionRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically expires sessions idle for longer than `idle_timeout`.
pub fn spawn_sweeper(
    sessions: Arc<SessionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = sessions.sweep(idle_timeout).await;
                    for session_id in &expired {
                        tracing::debug!(
                            event_name = "session.sweeper.expired",
                            session_id = %session_id,
                            "idle session expired"
                        );
                    }
                }
            }
        }
        tracing::debug!(event_name = "session.sweeper.stopped", "idle sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use switchboard_core::clock::{ManualClock, SharedClock};
    use switchboard_core::config::{AppConfig, SessionsConfig};
    use switchboard_core::domain::channel::{ChannelIdentity, ChannelType};
    use switchboard_core::multiplexer::StreamMultiplexer;
    use switchboard_core::session::{RegistrySettings, SessionRegistry};
    use tokio_util::sync::CancellationToken;

    use super::spawn_sweeper;

    fn sessions_config() -> SessionsConfig {
        AppConfig::default().sessions
    }

    #[tokio::test]
    async fn sweeper_expires_idle_sessions_until_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared: SharedClock = clock.clone();
        let sessions = Arc::new(SessionRegistry::new(
            RegistrySettings::from(&sessions_config()),
            StreamMultiplexer::new(8),
            shared,
        ));
        let session = sessions.resolve(&ChannelIdentity::direct(ChannelType::Discord, "u-1")).await;
        clock.advance(chrono::Duration::seconds(120));

        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(
            sessions.clone(),
            Duration::from_secs(60),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        let mut expired = false;
        for _ in 0..100 {
            if sessions.get(&session.id).await.is_err() {
                expired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(expired, "idle session should be swept");

        shutdown.cancel();
        assert!(handle.await.is_ok());
    }
}
