//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Two-tier register poller for the BMS bus."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use r_bms_common::{CancellationToken, PollingConfig, TickJitter};
use r_bms_protocol::{ProtocolDriver, ProtocolError, ReadOutcome, Transport};
use r_bms_registers::catalogue::describe;
use r_bms_registers::{
    resolve_bms_parameters, Category, ParameterDefinition, Publisher, RegisterCache, Subscriber,
    UpdateEvent, BMS_ADDRESS,
};
use tracing::{debug, info, warn};

use crate::metrics::LinkMetrics;
use crate::schedule::{is_slow_tick, TickSchedule};
use crate::Result;

/// Reads the BMS on a fixed schedule and publishes what it read.
///
/// The fast set is read on every tick, the slow set on tick zero and every
/// `slow_divider`th tick after it. Each set owns its cache, so a failed read
/// keeps the last known value of that register.
pub struct Poller<T> {
    driver: ProtocolDriver<T>,
    address: u16,
    fast: Vec<ParameterDefinition>,
    slow: Vec<ParameterDefinition>,
    fast_cache: RegisterCache,
    slow_cache: RegisterCache,
    interval: Duration,
    slow_divider: u32,
    publisher: Publisher,
    jitter: Arc<TickJitter>,
    metrics: Option<LinkMetrics>,
}

impl<T: Transport> Poller<T> {
    pub fn new(
        driver: ProtocolDriver<T>,
        fast: Vec<ParameterDefinition>,
        slow: Vec<ParameterDefinition>,
        interval: Duration,
        slow_divider: u32,
    ) -> Self {
        Self {
            driver,
            address: BMS_ADDRESS,
            fast,
            slow,
            fast_cache: RegisterCache::new(),
            slow_cache: RegisterCache::new(),
            interval,
            slow_divider: slow_divider.max(1),
            publisher: Publisher::new(),
            jitter: Arc::new(TickJitter::new(interval)),
            metrics: None,
        }
    }

    /// Build a poller from the `[polling]` section.
    pub fn from_config(driver: ProtocolDriver<T>, config: &PollingConfig) -> Result<Self> {
        let fast = resolve_bms_parameters(&config.fast)?;
        let slow = resolve_bms_parameters(&config.slow)?;
        Ok(Self::new(
            driver,
            fast,
            slow,
            config.fast_interval,
            config.slow_divider,
        ))
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a consumer. Must happen before [`Poller::run`].
    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.publisher.subscribe(subscriber);
    }

    /// Start lateness of every tick.
    pub fn jitter(&self) -> Arc<TickJitter> {
        Arc::clone(&self.jitter)
    }

    /// Read every register of `category` and publish the updated cache.
    ///
    /// Nothing is published when every read of the set timed out. Returns
    /// how many reads succeeded; only cancellation is an error.
    pub fn poll(
        &mut self,
        category: Category,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, ProtocolError> {
        let (parameters, cache) = match category {
            Category::BmsFast => (&self.fast, &mut self.fast_cache),
            Category::BmsSlow => (&self.slow, &mut self.slow_cache),
            Category::Esc => return Ok(0),
        };

        let mut succeeded = 0;
        for definition in parameters {
            let outcome =
                self.driver
                    .read_register(self.address, definition.id, definition.length, cancel)?;
            let name = describe(self.address, definition.id);
            let answered = match outcome {
                ReadOutcome::Value(value) => {
                    cache.update(definition.id, &value);
                    succeeded += 1;
                    true
                }
                ReadOutcome::Timeout => {
                    debug!(parameter = %name, category = %category, "register read timed out");
                    false
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_read(&name, answered);
            }
        }

        if succeeded == 0 {
            warn!(category = %category, registers = parameters.len(), "no register answered");
            return Ok(0);
        }

        let event = UpdateEvent::new(timestamp, category, cache.snapshot());
        self.publisher.publish(&event);
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(category);
        }
        Ok(succeeded)
    }

    /// Run tick `index`: the fast set, then the slow set when it is due.
    ///
    /// Both sets share the timestamp taken at the start of the tick.
    pub fn poll_tick(
        &mut self,
        index: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProtocolError> {
        let timestamp = Utc::now();
        self.poll(Category::BmsFast, timestamp, cancel)?;
        if is_slow_tick(index, self.slow_divider) {
            self.poll(Category::BmsSlow, timestamp, cancel)?;
        }
        Ok(())
    }

    /// Poll until `cancel` fires.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        info!(
            bus = %self.driver.transport().name(),
            interval_ms = self.interval.as_millis() as u64,
            slow_divider = self.slow_divider,
            fast = self.fast.len(),
            slow = self.slow.len(),
            subscribers = self.publisher.len(),
            "poller started"
        );
        let mut schedule = TickSchedule::new(self.interval, Instant::now());
        loop {
            if schedule.wait(cancel) {
                break;
            }
            let started = Instant::now();
            let (index, due) = schedule.begin(started);
            self.jitter.record_tick(due, started);
            match self.poll_tick(index, cancel) {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => return Err(err.into()),
            }
        }
        info!(
            ticks = schedule.ticks(),
            overruns = self.jitter.overruns(),
            "poller stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use r_bms_common::DriverConfig;
    use r_bms_protocol::{Command, Frame, MemoryTransport, ReceiveOutcome};
    use r_bms_registers::{BmsParameter, RegisterSnapshot};
    use std::collections::HashMap;
    use std::thread::{self, JoinHandle};

    fn quick() -> DriverConfig {
        DriverConfig {
            retries: 2,
            receive_timeout: Duration::from_millis(30),
            retry_delay: Duration::from_millis(1),
        }
    }

    /// Answers reads for the registers present in `values`.
    fn device(
        transport: MemoryTransport,
        values: Arc<Mutex<HashMap<u8, Vec<u8>>>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut driver = ProtocolDriver::new(transport, quick());
            loop {
                let frame = match driver.receive_frame(Some(Duration::from_millis(20)), &cancel) {
                    Ok(ReceiveOutcome::Frame(frame)) => frame,
                    Ok(_) => continue,
                    Err(_) => return,
                };
                if frame.command() != Command::ReadRequest {
                    continue;
                }
                let value = values.lock().get(&frame.parameter()).cloned();
                if let Some(value) = value {
                    let response =
                        Frame::read_response(frame.address(), frame.parameter(), value).unwrap();
                    if driver.send_frame(&response, &cancel).is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn recorder(poller: &mut Poller<MemoryTransport>) -> Arc<Mutex<Vec<UpdateEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        poller.subscribe(Arc::new(move |event: &UpdateEvent| {
            sink.lock().push(event.clone());
        }));
        events
    }

    fn setup(
        values: HashMap<u8, Vec<u8>>,
    ) -> (
        Poller<MemoryTransport>,
        Arc<Mutex<HashMap<u8, Vec<u8>>>>,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let (host, bms) = MemoryTransport::pair("bms-host", "bms");
        let values = Arc::new(Mutex::new(values));
        let cancel = CancellationToken::new();
        let device = device(bms, Arc::clone(&values), cancel.clone());
        let poller = Poller::new(
            ProtocolDriver::new(host, quick()),
            vec![
                BmsParameter::BatteryVoltage.definition(),
                BmsParameter::BatteryCurrent.definition(),
            ],
            vec![BmsParameter::BatteryPercent.definition()],
            Duration::from_millis(50),
            3,
        );
        (poller, values, cancel, device)
    }

    #[test]
    fn failed_read_keeps_previous_value() {
        let (mut poller, values, cancel, device) = setup(HashMap::from([
            (9, vec![1, 0, 0, 0]),
            (10, vec![2, 0, 0, 0]),
        ]));
        let events = recorder(&mut poller);

        let now = Utc::now();
        assert_eq!(poller.poll(Category::BmsFast, now, &cancel).unwrap(), 2);

        values.lock().remove(&10);
        values.lock().insert(9, vec![3, 0, 0, 0]);
        assert_eq!(poller.poll(Category::BmsFast, now, &cancel).unwrap(), 1);

        let expected: RegisterSnapshot = [(9u8, vec![3, 0, 0, 0]), (10u8, vec![2, 0, 0, 0])]
            .into_iter()
            .collect();
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(*events[1].snapshot, expected);
        assert_eq!(events[1].category, Category::BmsFast);

        cancel.cancel();
        device.join().unwrap();
    }

    #[test]
    fn nothing_is_published_when_every_read_fails() {
        let (mut poller, _values, cancel, device) = setup(HashMap::new());
        let events = recorder(&mut poller);

        assert_eq!(poller.poll(Category::BmsSlow, Utc::now(), &cancel).unwrap(), 0);
        assert!(events.lock().is_empty());

        cancel.cancel();
        device.join().unwrap();
    }

    #[test]
    fn slow_set_follows_the_divider() {
        let (mut poller, _values, cancel, device) = setup(HashMap::from([
            (9, vec![1, 0, 0, 0]),
            (10, vec![2, 0, 0, 0]),
            (13, vec![75]),
        ]));
        let events = recorder(&mut poller);

        for index in 0..4 {
            poller.poll_tick(index, &cancel).unwrap();
        }
        let categories: Vec<Category> = events.lock().iter().map(|event| event.category).collect();
        assert_eq!(
            categories,
            vec![
                Category::BmsFast,
                Category::BmsSlow,
                Category::BmsFast,
                Category::BmsFast,
                Category::BmsFast,
                Category::BmsSlow,
            ]
        );

        cancel.cancel();
        device.join().unwrap();
    }

    /// Answers every read after the next scripted delay and records when
    /// each request arrived.
    fn slow_device(
        transport: MemoryTransport,
        delays: Vec<Duration>,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, Arc<Mutex<Vec<Instant>>>) {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&arrivals);
        let handle = thread::spawn(move || {
            let mut driver = ProtocolDriver::new(transport, quick());
            let mut delays = delays.into_iter();
            loop {
                let frame = match driver.receive_frame(None, &cancel) {
                    Ok(ReceiveOutcome::Frame(frame)) => frame,
                    Ok(_) => continue,
                    Err(_) => return,
                };
                seen.lock().push(Instant::now());
                thread::sleep(delays.next().unwrap_or(Duration::from_millis(5)));
                let value = vec![0; usize::from(frame.data_length())];
                let response =
                    Frame::read_response(frame.address(), frame.parameter(), value).unwrap();
                if driver.send_frame(&response, &cancel).is_err() {
                    return;
                }
            }
        });
        (handle, arrivals)
    }

    /// Runs a fast-set-only poller at 100 ms for `run_for` against
    /// [`slow_device`] and returns the request arrival times.
    fn run_against_slow_device(
        delays: Vec<Duration>,
        run_for: Duration,
    ) -> (Vec<Instant>, Arc<TickJitter>) {
        let (host, bms) = MemoryTransport::pair("bms-host", "bms");
        let device_cancel = CancellationToken::new();
        let (device, arrivals) = slow_device(bms, delays, device_cancel.clone());
        let settings = DriverConfig {
            retries: 1,
            receive_timeout: Duration::from_millis(400),
            retry_delay: Duration::from_millis(1),
        };
        let poller = Poller::new(
            ProtocolDriver::new(host, settings),
            vec![BmsParameter::BatteryVoltage.definition()],
            Vec::new(),
            Duration::from_millis(100),
            1000,
        );
        let jitter = poller.jitter();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = thread::spawn(move || poller.run(&stopper));

        thread::sleep(run_for);
        cancel.cancel();
        handle.join().unwrap().unwrap();
        device_cancel.cancel();
        device.join().unwrap();

        let arrivals = arrivals.lock().clone();
        (arrivals, jitter)
    }

    fn assert_near(actual: Duration, expected: Duration, context: &str) {
        let tolerance = Duration::from_millis(40);
        let error = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            error < tolerance,
            "{context}: expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn slow_reads_do_not_shift_later_ticks() {
        let delays = [10, 70, 5, 80, 40, 60, 10]
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        let (arrivals, jitter) = run_against_slow_device(delays, Duration::from_millis(750));

        assert!(arrivals.len() >= 7, "only {} ticks ran", arrivals.len());
        let origin = arrivals[0];
        for (tick, arrival) in arrivals.iter().take(7).enumerate() {
            assert_near(
                arrival.duration_since(origin),
                Duration::from_millis(100) * tick as u32,
                &format!("tick {tick}"),
            );
        }
        assert_eq!(jitter.overruns(), 0);
    }

    #[test]
    fn overrun_restarts_the_grid_without_catch_up_ticks() {
        let delays = [5, 5, 260, 5, 5, 5]
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        let (arrivals, jitter) = run_against_slow_device(delays, Duration::from_millis(800));

        assert!(arrivals.len() >= 6, "only {} ticks ran", arrivals.len());
        let gap = |tick: usize| arrivals[tick].duration_since(arrivals[tick - 1]);
        assert_near(gap(1), Duration::from_millis(100), "before the overrun");
        assert_near(gap(2), Duration::from_millis(100), "before the overrun");
        // Tick 3 was due while tick 2 was still waiting for its answer.
        assert_near(gap(3), Duration::from_millis(260), "late tick");
        assert_near(gap(4), Duration::from_millis(100), "first tick after re-anchoring");
        assert_near(gap(5), Duration::from_millis(100), "second tick after re-anchoring");
        assert_eq!(jitter.overruns(), 1);
    }

    #[test]
    fn cancellation_stops_the_run_loop() {
        let (poller, _values, cancel, device) = setup(HashMap::from([(9, vec![1, 0, 0, 0])]));
        let jitter = poller.jitter();
        let stopper = cancel.clone();
        let handle = thread::spawn(move || poller.run(&stopper));

        thread::sleep(Duration::from_millis(180));
        cancel.cancel();
        handle.join().unwrap().unwrap();
        device.join().unwrap();

        let summary = jitter.histogram().summary().unwrap();
        assert!(summary.samples >= 2);
    }
}
