use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fleet_domain::{Clock, ContainerId, ContainerLogEntry, LogLevel};
use fleet_store::{ContainerLogBmcTrait, Ctx};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Time-windowed deduplicated log stream per container. Suppression is keyed
/// by (container, message) identity, not by template, so heartbeats of
/// different ships log independently.
///
/// Best-effort only: two concurrent writers can both pass the check inside
/// one window and persist twice. The sink throttles, it does not serialize.
#[derive(Debug)]
pub struct DedupLogSink {
    log_bmc: Arc<dyn ContainerLogBmcTrait>,
    clock: Arc<dyn Clock>,
    window: Duration,
    cache_cap: usize,
    last_written: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupLogSink {
    pub fn new(log_bmc: Arc<dyn ContainerLogBmcTrait>, clock: Arc<dyn Clock>, window: Duration, cache_cap: usize) -> Self {
        Self {
            log_bmc,
            clock,
            window,
            cache_cap,
            last_written: Mutex::new(HashMap::new()),
        }
    }

    pub async fn log(&self, ctx: &Ctx, container_id: &ContainerId, level: LogLevel, message: &str) -> Result<()> {
        self.log_with_metadata(ctx, container_id, level, message, None).await
    }

    pub async fn log_with_metadata(
        &self,
        ctx: &Ctx,
        container_id: &ContainerId,
        level: LogLevel,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = self.clock.now();
        let key = format!("{}|{}", container_id, message);

        {
            let mut last_written = self.last_written.lock().expect("dedup cache mutex poisoned");
            if let Some(last) = last_written.get(&key) {
                if now - *last < self.window {
                    return Ok(());
                }
            }
            if last_written.len() >= self.cache_cap {
                // single sweep: drop everything older than the window
                let window = self.window;
                last_written.retain(|_, written_at| now - *written_at < window);
            }
            last_written.insert(key, now);
        }

        self.log_bmc
            .append(
                ctx,
                &ContainerLogEntry {
                    container_id: container_id.clone(),
                    player_id: ctx.player_id(),
                    timestamp: now,
                    level,
                    message: message.to_string(),
                    metadata,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::test_epoch;
    use fleet_domain::{ManualClock, PlayerId};
    use fleet_store::InMemoryContainerLogBmc;
    use test_log::test;

    fn sink_with(window_secs: i64, cap: usize) -> (DedupLogSink, Arc<InMemoryContainerLogBmc>, ManualClock) {
        let log_bmc = Arc::new(InMemoryContainerLogBmc::new());
        let clock = ManualClock::starting_at(test_epoch());
        let sink = DedupLogSink::new(
            Arc::clone(&log_bmc) as Arc<dyn ContainerLogBmcTrait>,
            Arc::new(clock.clone()),
            Duration::seconds(window_secs),
            cap,
        );
        (sink, log_bmc, clock)
    }

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    #[test(tokio::test)]
    async fn thousand_identical_messages_persist_once_per_window() -> Result<()> {
        let (sink, log_bmc, clock) = sink_with(60, 10_000);
        let container = ContainerId("C".to_string());

        for _ in 0..1000 {
            sink.log(&ctx(), &container, LogLevel::Info, "hello").await?;
            clock.advance(Duration::milliseconds(5));
        }
        assert_eq!(log_bmc.all_entries().await.len(), 1);

        clock.advance(Duration::seconds(61));
        sink.log(&ctx(), &container, LogLevel::Info, "hello").await?;
        assert_eq!(log_bmc.all_entries().await.len(), 2);
        Ok(())
    }

    #[test(tokio::test)]
    async fn different_messages_and_containers_are_independent() -> Result<()> {
        let (sink, log_bmc, _clock) = sink_with(60, 10_000);

        sink.log(&ctx(), &ContainerId("C1".to_string()), LogLevel::Info, "heartbeat SHIP-2").await?;
        sink.log(&ctx(), &ContainerId("C1".to_string()), LogLevel::Info, "heartbeat SHIP-3").await?;
        sink.log(&ctx(), &ContainerId("C2".to_string()), LogLevel::Info, "heartbeat SHIP-2").await?;
        assert_eq!(log_bmc.all_entries().await.len(), 3);
        Ok(())
    }

    #[test(tokio::test)]
    async fn cache_cap_evicts_expired_entries_in_one_sweep() -> Result<()> {
        let (sink, log_bmc, clock) = sink_with(60, 3);
        let container = ContainerId("C".to_string());

        sink.log(&ctx(), &container, LogLevel::Info, "a").await?;
        sink.log(&ctx(), &container, LogLevel::Info, "b").await?;
        sink.log(&ctx(), &container, LogLevel::Info, "c").await?;

        // all three entries are stale after the window passes
        clock.advance(Duration::seconds(61));
        sink.log(&ctx(), &container, LogLevel::Info, "d").await?;
        assert_eq!(log_bmc.all_entries().await.len(), 4);

        // the sweep dropped a/b/c, so "a" logs again
        sink.log(&ctx(), &container, LogLevel::Info, "a").await?;
        assert_eq!(log_bmc.all_entries().await.len(), 5);
        Ok(())
    }
}
