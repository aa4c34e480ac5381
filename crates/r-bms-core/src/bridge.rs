//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Answers ESC register reads on behalf of the BMS."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_bms_common::time::clamp_to_std;
use r_bms_common::{CancellationToken, EscConfig};
use r_bms_protocol::{Command, Frame, ProtocolDriver, ReceiveOutcome, Transport};
use r_bms_registers::catalogue::describe;
use r_bms_registers::{
    resolve_bms_parameters, Category, ParameterDefinition, Publisher, RegisterCache,
    RegisterSnapshot, Subscriber, UpdateEvent, BMS_ADDRESS, ESC_ADDRESS,
};
use tracing::{debug, info, trace, warn};

use crate::metrics::LinkMetrics;
use crate::Result;

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// What the bridge did with one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A response was sent.
    Answered,
    /// The register is not cached.
    Missing,
    /// The cache is older than the staleness timeout.
    Stale,
    /// A status frame was merged into the observed snapshot.
    Observed,
    /// Not addressed to the impersonated BMS.
    Ignored,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::Missing => "missing",
            Self::Stale => "stale",
            Self::Observed => "observed",
            Self::Ignored => "ignored",
        }
    }
}

/// Copy `data` into a buffer of exactly `length` bytes, truncating or
/// zero-padding as needed.
pub fn fit_to_length(data: &[u8], length: u8) -> Vec<u8> {
    let mut buffer = vec![0; usize::from(length)];
    let copied = data.len().min(buffer.len());
    buffer[..copied].copy_from_slice(&data[..copied]);
    buffer
}

#[derive(Debug, Default)]
struct MirrorState {
    cache: RegisterCache,
    last_update: Option<DateTime<Utc>>,
}

/// Cheap clonable handle feeding the bridge's private cache.
///
/// Subscribed to the poller. Only the mirrored registers are copied, under
/// a lock that is held for a few byte copies at most.
#[derive(Clone)]
pub struct BridgeHandle {
    state: Arc<Mutex<MirrorState>>,
    mirrored: Arc<[u8]>,
}

impl BridgeHandle {
    fn new(mirrored: &[ParameterDefinition]) -> Self {
        Self {
            state: Arc::new(Mutex::new(MirrorState::default())),
            mirrored: mirrored.iter().map(|definition| definition.id).collect(),
        }
    }

    /// Copy every mirrored register present in `snapshot` and remember
    /// `timestamp` as the time of the last update.
    ///
    /// Events from the bridge's own category are ignored.
    pub fn set_data(&self, timestamp: DateTime<Utc>, category: Category, snapshot: &RegisterSnapshot) {
        if !category.is_bms() {
            return;
        }
        let mut state = self.state.lock();
        for id in self.mirrored.iter().copied() {
            if let Some(data) = snapshot.get(id) {
                state.cache.update(id, data);
                state.last_update = Some(timestamp);
            }
        }
    }

    /// Time of the most recent mirrored update.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_update
    }

    /// Copy of the mirrored registers.
    pub fn snapshot(&self) -> RegisterSnapshot {
        self.state.lock().cache.snapshot()
    }

    fn lookup(&self, id: u8, length: u8, now: DateTime<Utc>, staleness: Duration) -> std::result::Result<Vec<u8>, RequestOutcome> {
        let state = self.state.lock();
        let data = state.cache.get(id).ok_or(RequestOutcome::Missing)?;
        match state.last_update {
            Some(updated) if clamp_to_std(now - updated) <= staleness => Ok(fit_to_length(data, length)),
            _ => Err(RequestOutcome::Stale),
        }
    }
}

impl Subscriber for BridgeHandle {
    fn on_update(&self, event: &UpdateEvent) {
        self.set_data(event.timestamp, event.category, &event.snapshot);
    }

    fn name(&self) -> &str {
        "bridge"
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("mirrored", &self.mirrored)
            .field("last_update", &self.last_update())
            .finish()
    }
}

/// Impersonates the BMS on the ESC bus.
pub struct BridgeResponder<T> {
    driver: ProtocolDriver<T>,
    handle: BridgeHandle,
    staleness: Duration,
    observe_status: bool,
    observed: RegisterCache,
    publisher: Publisher,
    metrics: Option<LinkMetrics>,
}

impl<T: Transport> BridgeResponder<T> {
    pub fn new(driver: ProtocolDriver<T>, mirrored: &[ParameterDefinition], staleness: Duration) -> Self {
        Self {
            driver,
            handle: BridgeHandle::new(mirrored),
            staleness,
            observe_status: true,
            observed: RegisterCache::new(),
            publisher: Publisher::new(),
            metrics: None,
        }
    }

    /// Build a responder from the `[esc]` section.
    pub fn from_config(driver: ProtocolDriver<T>, config: &EscConfig) -> Result<Self> {
        let mirrored = resolve_bms_parameters(&config.mirrored)?;
        Ok(Self::new(driver, &mirrored, config.staleness_timeout).observe_status(config.observe_status))
    }

    /// Merge ESC status frames and publish them as [`Category::Esc`].
    pub fn observe_status(mut self, enabled: bool) -> Self {
        self.observe_status = enabled;
        self
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle to subscribe to the poller.
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Register a consumer of observed ESC status.
    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.publisher.subscribe(subscriber);
    }

    /// Decide how to react to `frame` received at `now`.
    ///
    /// Returns the response to send, if any. Requests for missing registers
    /// or while the cache is stale get no answer; the ESC retries on its own.
    pub fn handle_frame(&mut self, frame: &Frame, now: DateTime<Utc>) -> Option<Frame> {
        let (outcome, response) = self.classify(frame, now);
        if let Some(metrics) = &self.metrics {
            metrics.record_bridge(outcome);
        }
        response
    }

    fn classify(&mut self, frame: &Frame, now: DateTime<Utc>) -> (RequestOutcome, Option<Frame>) {
        match (frame.command(), frame.address()) {
            (Command::ReadRequest, BMS_ADDRESS) => {
                let parameter = frame.parameter();
                match self.handle.lookup(parameter, frame.data_length(), now, self.staleness) {
                    Ok(data) => match Frame::read_response(BMS_ADDRESS, parameter, data) {
                        Ok(response) => (RequestOutcome::Answered, Some(response)),
                        Err(err) => {
                            warn!(parameter, error = %err, "unable to build bridge response");
                            (RequestOutcome::Missing, None)
                        }
                    },
                    Err(outcome) => {
                        debug!(
                            parameter = %describe(BMS_ADDRESS, parameter),
                            outcome = outcome.as_str(),
                            "request left unanswered"
                        );
                        (outcome, None)
                    }
                }
            }
            (Command::Status, ESC_ADDRESS) if self.observe_status => {
                if let Some(payload) = frame.payload() {
                    self.observed.update(frame.parameter(), payload);
                }
                let event = UpdateEvent::new(now, Category::Esc, self.observed.snapshot());
                self.publisher.publish(&event);
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish(Category::Esc);
                }
                (RequestOutcome::Observed, None)
            }
            _ => {
                trace!(frame = %frame, "ignoring frame");
                (RequestOutcome::Ignored, None)
            }
        }
    }

    /// Serve the ESC bus until `cancel` fires.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        info!(
            bus = %self.driver.transport().name(),
            staleness_s = self.staleness.as_secs(),
            observe_status = self.observe_status,
            "bridge responder started"
        );
        loop {
            let frame = match self.driver.receive_frame(None, cancel) {
                Ok(ReceiveOutcome::Frame(frame)) => frame,
                Ok(ReceiveOutcome::Timeout) => continue,
                Ok(ReceiveOutcome::InvalidData) => {
                    debug!(bus = %self.driver.transport().name(), "invalid data on ESC bus");
                    continue;
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(bus = %self.driver.transport().name(), error = %err, "ESC bus failure");
                    if let Err(err) = self.driver.transport_mut().reset() {
                        warn!(error = %err, "ESC transport reset failed");
                    }
                    if cancel.wait_timeout(ERROR_BACKOFF) {
                        break;
                    }
                    continue;
                }
            };

            if let Some(response) = self.handle_frame(&frame, Utc::now()) {
                match self.driver.send_frame(&response, cancel) {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => break,
                    Err(err) => warn!(error = %err, "failed to send bridge response"),
                }
            }
        }
        info!("bridge responder stopped");
        Ok(())
    }
}
