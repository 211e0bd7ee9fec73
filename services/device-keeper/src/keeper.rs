//! Connection Keeper
//!
//! Drives the discovery loop: polls the target source on a fixed delay and
//! makes sure every channel of every online device has a started
//! connection. Devices that drop out of the listing are left alone; their
//! connections end through the agent's offline signal or the retry budget.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::config::Config;
use crate::connection::device::{ConnectionContext, ConnectionSettings};
use crate::connection::registry::ConnectionRegistry;
use crate::connection::scheduler::{default_pool_size, Scheduler};
use crate::connection::target::{agent_url, Channel, ConnectionKey};
use crate::connection::transport::Dialer;
use crate::connection::websocket::WsDialer;
use crate::directory::adapter::{DeviceAddressSink, TargetSource};
use crate::sync::{DeviceSync, DisabledSync};

/// What a single discovery tick saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Devices returned by the target source
    pub targets: usize,
    /// Registry size after the tick
    pub connections: usize,
}

pub struct ConnectionKeeper {
    source: Arc<dyn TargetSource>,
    registry: ConnectionRegistry,
    interval: Duration,
    query_timeout: Duration,
}

impl ConnectionKeeper {
    pub fn builder(
        source: Arc<dyn TargetSource>,
        sink: Arc<dyn DeviceAddressSink>,
    ) -> ConnectionKeeperBuilder {
        ConnectionKeeperBuilder::new(source, sink)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One discovery tick: query the source and ensure a started connection
    /// for every (device, channel) pair it returns.
    pub async fn tick(&self) -> Result<TickSummary> {
        let targets = timeout(self.query_timeout, self.source.online_targets())
            .await
            .map_err(|_| anyhow!("directory query timed out after {:?}", self.query_timeout))??;

        for target in &targets {
            for channel in Channel::ALL {
                let key = ConnectionKey::new(target.device_id.clone(), channel);
                let url = agent_url(target, channel);
                self.registry.ensure(key, url, target).start();
            }
        }

        Ok(TickSummary {
            targets: targets.len(),
            connections: self.registry.len(),
        })
    }

    /// Tick on a fixed delay until `shutdown` fires, then stop everything
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            pool_size = self.registry.scheduler().size(),
            "Discovery loop started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.tick() => match result {
                    Ok(summary) => debug!(
                        targets = summary.targets,
                        connections = summary.connections,
                        "Discovery tick complete"
                    ),
                    // Retried on the next tick
                    Err(e) => warn!(error = %e, "Discovery tick failed"),
                },
            }
        }

        self.shutdown();
    }

    /// Stop every connection and cancel every scheduled task
    pub fn shutdown(&self) {
        info!(connections = self.registry.len(), "Shutting down connection keeper");
        self.registry.stop_all();
        self.registry.scheduler().shutdown();
    }
}

/// Builder for ConnectionKeeper
pub struct ConnectionKeeperBuilder {
    source: Arc<dyn TargetSource>,
    sink: Arc<dyn DeviceAddressSink>,
    dialer: Option<Arc<dyn Dialer>>,
    sync: Option<Arc<dyn DeviceSync>>,
    scheduler: Option<Scheduler>,
    settings: ConnectionSettings,
    interval: Duration,
    query_timeout: Duration,
}

impl ConnectionKeeperBuilder {
    pub fn new(source: Arc<dyn TargetSource>, sink: Arc<dyn DeviceAddressSink>) -> Self {
        Self {
            source,
            sink,
            dialer: None,
            sync: None,
            scheduler: None,
            settings: ConnectionSettings::default(),
            interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
        }
    }

    /// Apply the discovery and connection sections of `config`
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = ConnectionSettings::from_config(config);
        self.interval = Duration::from_secs(config.discovery.interval_secs);
        self.query_timeout = Duration::from_secs(config.discovery.query_timeout_secs);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn sync(mut self, sync: Arc<dyn DeviceSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Must be called inside a tokio runtime unless a scheduler was given
    pub fn build(self) -> ConnectionKeeper {
        let ctx = ConnectionContext {
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Scheduler::new(default_pool_size())),
            dialer: self
                .dialer
                .unwrap_or_else(|| Arc::new(WsDialer::default())),
            sink: self.sink,
            sync: self.sync.unwrap_or_else(|| Arc::new(DisabledSync)),
            settings: self.settings,
        };

        ConnectionKeeper {
            source: self.source,
            registry: ConnectionRegistry::new(ctx),
            interval: self.interval,
            query_timeout: self.query_timeout,
        }
    }
}
