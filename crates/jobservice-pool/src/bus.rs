//! Cross-replica event bus over the notification channel.
//!
//! Every replica subscribes to the same channel and applies each event to
//! its local caches: policies, hook URLs and pending operator commands.

use std::sync::Arc;
use std::time::Duration;

use jobservice_kv::{KeyBuilder, KvStore, Subscription};
use jobservice_opm::JobStatsManager;
use jobservice_period::PolicyStore;
use jobservice_protocols::utils::make_identifier;
use jobservice_protocols::{BusEvent, JobServiceError, JobServiceResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Keep-alive period. Each tick publishes a ping that must come back on
    /// the subscription before the next tick.
    pub ping_interval: Duration,
    /// Resubscribe attempts after the subscription broke.
    pub max_restarts: u32,
    /// Base of the restart backoff.
    pub backoff_unit: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            max_restarts: 5,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Delay before restart `attempt` (1-based): `2^attempt + 5` units.
fn restart_backoff(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(2u32.saturating_pow(attempt).saturating_add(5))
}

pub struct MessageBus {
    kv: Arc<dyn KvStore>,
    keys: KeyBuilder,
    policies: Arc<PolicyStore>,
    stats: Arc<JobStatsManager>,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeyBuilder,
        policies: Arc<PolicyStore>,
        stats: Arc<JobStatsManager>,
        config: BusConfig,
    ) -> Self {
        Self {
            kv,
            keys,
            policies,
            stats,
            config,
        }
    }

    /// Subscribe, then consume events in the background until `cancel`.
    ///
    /// Returns once the subscription is live, so events published after this
    /// call are never missed.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JobServiceResult<()> {
        let subscription = self.kv.subscribe(&self.keys.notifications()).await?;
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            bus.supervise(subscription, cancel).await;
        });
        info!("Message bus subscribed to {}", self.keys.notifications());
        Ok(())
    }

    async fn supervise(&self, mut subscription: Subscription, cancel: CancellationToken) {
        let mut restarts = 0;
        loop {
            match self.consume(&mut subscription, &cancel).await {
                Ok(()) => break,
                Err(e) => {
                    restarts += 1;
                    if restarts > self.config.max_restarts {
                        error!("Message bus gave up after {} restarts: {}", restarts - 1, e);
                        break;
                    }
                    let delay = restart_backoff(self.config.backoff_unit, restarts);
                    warn!("Message bus failed ({}), restart {} in {:?}", e, restarts, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match self.kv.subscribe(&self.keys.notifications()).await {
                        Ok(fresh) => subscription = fresh,
                        Err(e) => warn!("Message bus resubscribe failed: {}", e),
                    }
                }
            }
        }
        info!("Message bus stopped");
    }

    /// Consume until cancelled (`Ok`) or the subscription breaks (`Err`).
    async fn consume(
        &self,
        subscription: &mut Subscription,
        cancel: &CancellationToken,
    ) -> JobServiceResult<()> {
        let token = make_identifier();
        let mut awaiting_echo = false;
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = subscription.recv() => {
                    let Some(raw) = message else {
                        return Err(JobServiceError::Kv("subscription closed".to_string()));
                    };
                    let event = match BusEvent::decode(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Failed to decode bus message: {}", e);
                            continue;
                        }
                    };
                    if let BusEvent::Ping(echo) = &event {
                        if *echo == token {
                            awaiting_echo = false;
                        }
                        continue;
                    }
                    if let Err(e) = self.apply(event).await {
                        warn!("Failed to handle bus message: {}", e);
                    }
                }
                _ = ping.tick() => {
                    if awaiting_echo {
                        return Err(JobServiceError::Kv(
                            "keep-alive ping not echoed on the subscription".to_string(),
                        ));
                    }
                    let request = BusEvent::Ping(token.clone()).encode()?;
                    self.kv.publish(subscription.channel(), &request).await?;
                    awaiting_echo = true;
                }
            }
        }
    }

    /// Apply one encoded event to the local caches.
    pub async fn dispatch(&self, raw: &str) -> JobServiceResult<()> {
        self.apply(BusEvent::decode(raw)?).await
    }

    async fn apply(&self, event: BusEvent) -> JobServiceResult<()> {
        debug!(event = event.name(), "Bus event received");

        match event {
            BusEvent::Schedule(policy) => {
                if !self.policies.add(policy) {
                    return Err(JobServiceError::Validation(
                        "scheduled policy without id".to_string(),
                    ));
                }
            }
            BusEvent::UnSchedule(policy) => {
                self.policies.remove(&policy.id);
            }
            BusEvent::RegisterHook(hook) => {
                self.stats
                    .register_hook(&hook.job_id, &hook.hook_url, true)
                    .await?;
            }
            BusEvent::FireCommand(job_id, command) => {
                self.stats.send_command(&job_id, command, true).await?;
            }
            // Another subscriber's keep-alive.
            BusEvent::Ping(_) => {}
        }
        Ok(())
    }
}
