//! IotSystem - top-level supervisor
//!
//! Starts the device manager with the configured mailbox sizes and stops it,
//! along with every group and device below it, on shutdown.

use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::lifecycle::Watchable;
use crate::manager::DeviceManager;

/// How long shutdown waits for the manager to drain its mailbox
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Running IoT application
pub struct IotSystem {
    manager: DeviceManager,
    query_timeout: Duration,
}

impl IotSystem {
    /// Start the application from `config`
    pub fn start(config: &Config) -> Self {
        debug!(?config, "IotSystem::start: called");
        let manager = DeviceManager::spawn(config.mailbox);
        info!("IoT Application started");
        Self {
            manager,
            query_timeout: config.query.timeout(),
        }
    }

    /// Handle to the device manager
    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Default timeout for group queries
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Stop the manager and wait until it has terminated
    pub async fn shutdown(self) -> Result<()> {
        debug!("IotSystem::shutdown: called");
        if let Err(e) = self.manager.shutdown().await {
            warn!(error = %e, "IotSystem::shutdown: manager already stopped");
        }

        tokio::time::timeout(SHUTDOWN_TIMEOUT, self.manager.terminated())
            .await
            .context("Timed out waiting for the device manager to stop")?;

        info!("IoT Application stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TemperatureReading;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let system = IotSystem::start(&Config::default());
        let manager = system.manager().clone();
        assert_eq!(system.query_timeout(), Duration::from_secs(3));

        system.shutdown().await.unwrap();
        assert!(manager.is_terminated());
    }

    #[tokio::test]
    async fn test_query_through_system() {
        let mut config = Config::default();
        config.query.timeout_ms = 500;
        let system = IotSystem::start(&config);

        let device = system.manager().track_device("group", "device1").await.unwrap();
        device.record_temperature(0, 21.5).await.unwrap();

        let reply = system
            .manager()
            .query_group(1, "group", system.query_timeout())
            .await
            .unwrap();
        assert_eq!(reply.request_id, 1);
        assert_eq!(
            reply.temperatures.get("device1"),
            Some(&TemperatureReading::Temperature(21.5))
        );

        system.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), device.terminated())
            .await
            .unwrap();
    }
}
