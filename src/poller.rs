use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::climate;
use crate::config::PollSettings;
use crate::error::PollError;
use crate::extractor::{self, RawField};
use crate::fetcher::{HtmlDocument, PageId, PageSource};
use crate::normalizer::{self, KeyAllocator};
use crate::reading::{validate_snapshot, PollResult, Reading};

/// Latest published result; `None` until the first cycle completes.
pub type Snapshot = Option<Arc<PollResult>>;

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Authenticating,
    Fetching(PageId),
    Extracting(PageId),
    Normalizing,
    Done { success: bool },
}

/// Drives poll cycles against one AiSEG2 and publishes each outcome.
pub struct Poller<S: PageSource> {
    source: S,
    settings: PollSettings,
    scan_interval: Duration,
    cycle: u64,
    state: CycleState,
    published: watch::Sender<Snapshot>,
}

impl<S: PageSource> Poller<S> {
    pub fn new(
        source: S,
        settings: PollSettings,
        scan_interval: Duration,
    ) -> (Self, watch::Receiver<Snapshot>) {
        let (published, receiver) = watch::channel(None);
        (
            Self {
                source,
                settings,
                scan_interval,
                cycle: 0,
                state: CycleState::Idle,
                published,
            },
            receiver,
        )
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.published.subscribe()
    }

    /// Polls every scan interval until `shutdown` fires. Cycles never overlap; an
    /// overrunning cycle pushes the next one back.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Polling AiSEG2 every {}s",
            self.scan_interval.as_secs_f64()
        );
        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cancelled = tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = self.poll_once() => false,
            };
            if cancelled {
                warn!("Poll cycle abandoned for shutdown");
                self.source.discard_session();
                self.enter(CycleState::Idle);
                break;
            }
        }
        info!("AiSEG2 poller stopped");
    }

    /// Runs one full cycle and publishes its result.
    pub async fn poll_once(&mut self) -> Arc<PollResult> {
        self.cycle += 1;
        let cycle = self.cycle;
        let deadline = Instant::now() + self.scan_interval;

        self.enter(CycleState::Authenticating);
        self.source.begin_cycle();
        let outcome = self.run_cycle(deadline).await;

        match &outcome {
            Ok(readings) => info!("Poll cycle {} produced {} readings", cycle, readings.len()),
            Err(PollError::Auth(err)) if cycle == 1 => {
                error!("AiSEG2 setup failed, check credentials: {}", err)
            }
            Err(err) => error!("Poll cycle {} failed: {}", cycle, err),
        }
        self.enter(CycleState::Done {
            success: outcome.is_ok(),
        });

        let result = Arc::new(PollResult {
            cycle,
            completed_at: Utc::now(),
            outcome,
        });
        self.published.send_replace(Some(result.clone()));
        result
    }

    async fn run_cycle(&mut self, deadline: Instant) -> Result<Vec<Reading>, PollError> {
        let totals = self.fetch_with_retry(PageId::Totals, deadline).await?;
        let totals = self.extract(&totals)?;
        self.enter(CycleState::Normalizing);
        let mut readings = normalizer::normalize(&totals, PageId::Totals)?;

        let circuits = self.fetch_circuits(deadline).await?;
        self.enter(CycleState::Normalizing);
        readings.extend(normalizer::normalize(&circuits, PageId::Circuits(1))?);
        validate_snapshot(&readings)?;

        if self.settings.climate {
            match self.poll_climate(deadline, &readings).await {
                Ok(climate) => {
                    let energy = readings.len();
                    readings.extend(climate);
                    if let Err(err) = validate_snapshot(&readings) {
                        warn!("Dropping climate readings this cycle: {}", err);
                        readings.truncate(energy);
                    }
                }
                Err(err) => warn!("Skipping climate sensors this cycle: {}", err),
            }
        }

        Ok(readings)
    }

    /// Walks the circuit screens in order until one is empty or repeats the last.
    async fn fetch_circuits(&mut self, deadline: Instant) -> Result<Vec<RawField>, PollError> {
        let mut fields: Vec<RawField> = Vec::new();
        let mut previous_labels: Vec<String> = Vec::new();

        for page in 1..=self.settings.max_circuit_pages {
            let document = self
                .fetch_with_retry(PageId::Circuits(page), deadline)
                .await?;
            let page_fields = self.extract(&document)?;
            let labels: Vec<String> = page_fields.iter().map(|f| f.label.clone()).collect();
            if labels.is_empty() || labels == previous_labels {
                debug!("Circuit list ends before page {}", page);
                break;
            }
            fields.extend(page_fields);
            previous_labels = labels;
        }
        Ok(fields)
    }

    async fn poll_climate(
        &mut self,
        deadline: Instant,
        taken: &[Reading],
    ) -> Result<Vec<Reading>, PollError> {
        let document = self.fetch_with_retry(PageId::Climate, deadline).await?;
        self.enter(CycleState::Extracting(PageId::Climate));
        let sensors = climate::extract_sensors(&document);

        // Leave settings mode whatever the page held, or the device UI stays locked.
        sleep(self.settings.setting_exit_delay).await;
        self.enter(CycleState::Fetching(PageId::Home));
        if let Err(err) = self.source.fetch(PageId::Home).await {
            warn!("Could not leave AiSEG2 settings mode (ignored): {}", err);
        }

        self.enter(CycleState::Normalizing);
        let mut keys = KeyAllocator::reserving(taken.iter().map(|r| r.key.as_str()));
        Ok(climate::sensor_readings(&sensors?, &mut keys))
    }

    fn enter(&mut self, state: CycleState) {
        debug!("Cycle {}: {:?}", self.cycle, state);
        self.state = state;
    }

    fn extract(&mut self, document: &HtmlDocument) -> Result<Vec<RawField>, PollError> {
        self.enter(CycleState::Extracting(document.page));
        Ok(extractor::extract(document)?)
    }

    async fn fetch_with_retry(
        &mut self,
        page: PageId,
        deadline: Instant,
    ) -> Result<HtmlDocument, PollError> {
        let mut attempt = 0;
        loop {
            self.enter(CycleState::Fetching(page));
            match self.source.fetch(page).await {
                Ok(document) => return Ok(document),
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff(attempt);
                    // The retry itself may run for a full request timeout.
                    if Instant::now() + delay + self.settings.request_timeout >= deadline {
                        warn!("No time left in this cycle to retry {}: {}", page, err);
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        "Fetching {} failed ({}), retry {}/{} in {:?}",
                        page, err, attempt, self.settings.max_retries, delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
