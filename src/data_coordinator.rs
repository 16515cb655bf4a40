use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::fetcher::DeviceClient;
use crate::home_assistant::HomeAssistantAPI;
use crate::home_assistant_publisher::HomeAssistantPublisher;
use crate::poller::{Poller, Snapshot};

/// Owns the poller and publisher tasks and stops them together.
pub struct DataCoordinator {
    shutdown: CancellationToken,
    results: watch::Receiver<Snapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl DataCoordinator {
    /// Spawns the AiSEG2 poller and the Home Assistant publisher.
    pub fn start(config: AppConfig) -> anyhow::Result<Self> {
        info!(
            "Starting AiSEG2 bridge for {} as {}",
            config.endpoint.base_url(),
            config.endpoint.username
        );
        let shutdown = CancellationToken::new();

        let ha_client = config
            .home_assistant
            .as_ref()
            .map(HomeAssistantAPI::new)
            .transpose()?;

        let scan_interval = config.endpoint.scan_interval;
        let source = DeviceClient::new(config.endpoint, config.poll.request_timeout);
        let (poller, results) = Poller::new(source, config.poll, scan_interval);

        let publisher = HomeAssistantPublisher::new(results.clone(), ha_client);
        let tasks = vec![
            tokio::spawn(poller.run(shutdown.child_token())),
            publisher.spawn(shutdown.child_token()),
        ];

        Ok(Self {
            shutdown,
            results,
            tasks,
        })
    }

    /// Latest poll results, for callers other than the publisher.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.results.clone()
    }

    /// Cancels any cycle in flight and waits for both tasks to wind down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("AiSEG2 bridge stopped");
    }
}
