//! ---
//! bms_section: "15-testing-qa-runbook"
//! bms_subsection: "test"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Runtime driven against a simulated battery and ESC over in-memory buses."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prometheus::Registry;
use r_bms_common::{AppConfig, CancellationToken, DriverConfig};
use r_bms_core::{BatterySimulator, EscSimulator, LinkRuntime, Transports};
use r_bms_persistence::{LogReader, ReadStrategy};
use r_bms_protocol::{Frame, MemoryTransport, ProtocolDriver};
use r_bms_registers::{BmsParameter, Category, ESC_ADDRESS};

fn quick_driver() -> DriverConfig {
    DriverConfig {
        retries: 5,
        receive_timeout: Duration::from_millis(100),
        retry_delay: Duration::from_millis(5),
    }
}

fn config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.polling.fast_interval = Duration::from_millis(50);
    config.polling.slow_divider = 4;
    config.driver = quick_driver();
    config.datalog.directory = dir.to_path_buf();
    config.datalog.chunk_size = 256;
    config.datalog.failure_backoff = Duration::from_millis(10);
    config
}

#[test]
fn bridge_serves_polled_values_and_everything_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let (bms_host, bms_device) = MemoryTransport::pair("bms", "battery");
    let (esc_host, esc_device) = MemoryTransport::pair("esc", "controller");

    let sim_cancel = CancellationToken::new();
    let mut battery = BatterySimulator::with_seed(ProtocolDriver::new(bms_device, quick_driver()), 3);
    battery.set_value(BmsParameter::SerialNumber, b"RBMS-0001".to_vec());
    let token = sim_cancel.clone();
    let battery = thread::spawn(move || battery.run(&token));

    let registry = Arc::new(Registry::new());
    let runtime = LinkRuntime::start(
        &config,
        Transports {
            bms: Box::new(bms_host),
            esc: Some(Box::new(esc_host)),
        },
        Arc::clone(&registry),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));

    let mut esc = EscSimulator::from_config(ProtocolDriver::new(esc_device, quick_driver()), &config.esc)
        .unwrap();
    let results = esc.read_cycle(&sim_cancel).unwrap();
    assert_eq!(results.len(), config.esc.mirrored.len());
    assert!(results.iter().all(|(_, value)| value.is_some()), "{results:?}");
    assert!(results.contains(&(BmsParameter::Unknown7.id(), Some(vec![0x05]))));

    let status = Frame::status(ESC_ADDRESS, 75, vec![0x01, 0x02]).unwrap();
    esc.send_status(&status, &sim_cancel).unwrap();

    thread::sleep(Duration::from_millis(200));
    let report = runtime.shutdown().unwrap();
    sim_cancel.cancel();
    battery.join().unwrap().unwrap();

    assert!(report.writer.records > 0);
    assert_eq!(report.dropped, 0);
    assert!(report.jitter.histogram().summary().unwrap().samples >= 4);

    let records: Vec<_> = LogReader::open(&report.log_path, ReadStrategy::SlidingWindow)
        .unwrap()
        .map(|record| record.unwrap())
        .collect();
    assert_eq!(records.len() as u64, report.writer.records);
    for category in [Category::BmsFast, Category::BmsSlow, Category::Esc] {
        assert!(
            records.iter().any(|record| record.category == category),
            "no {category} record"
        );
    }
    let esc_record = records
        .iter()
        .find(|record| record.category == Category::Esc)
        .unwrap();
    assert_eq!(esc_record.values[0].param, 75);
    assert_eq!(esc_record.values[0].data, vec![0x01, 0x02]);

    let families: Vec<String> = registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_owned())
        .collect();
    assert!(families.contains(&"r_bms_bridge_requests_total".to_owned()));
    assert!(families.contains(&"r_bms_datalog_records_written_total".to_owned()));
}

#[test]
fn runs_without_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.esc.enabled = false;

    let (bms_host, bms_device) = MemoryTransport::pair("bms", "battery");
    let sim_cancel = CancellationToken::new();
    let battery = BatterySimulator::with_seed(ProtocolDriver::new(bms_device, quick_driver()), 9);
    let token = sim_cancel.clone();
    let battery = thread::spawn(move || battery.run(&token));

    let runtime = LinkRuntime::start(
        &config,
        Transports {
            bms: Box::new(bms_host),
            esc: None,
        },
        Arc::new(Registry::new()),
    )
    .unwrap();
    thread::sleep(Duration::from_millis(150));
    assert!(!runtime.is_finished());
    let report = runtime.shutdown().unwrap();
    sim_cancel.cancel();
    battery.join().unwrap().unwrap();

    assert!(report.writer.records >= 2);
    assert!(report.log_path.starts_with(dir.path()));
}
