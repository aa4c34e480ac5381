//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Starts the poller, bridge and log writer threads and stops them in order."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use prometheus::Registry;
use r_bms_common::{AppConfig, CancellationToken, TickJitter};
use r_bms_persistence::{DataLogMetrics, DataLogger, FileSink, LogWriter, WriterStats};
use r_bms_protocol::{ProtocolDriver, SerialTransport, Transport};
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeResponder;
use crate::metrics::LinkMetrics;
use crate::poller::Poller;
use crate::{CoreError, Result};

/// Buses handed to the runtime. `esc` is `None` when bridging is disabled.
pub struct Transports {
    pub bms: Box<dyn Transport>,
    pub esc: Option<Box<dyn Transport>>,
}

impl Transports {
    /// Serial ports named in the configuration. Ports open lazily on first use.
    pub fn serial(config: &AppConfig) -> Self {
        let esc = config.esc.enabled.then(|| {
            Box::new(SerialTransport::new("esc", &config.esc.serial())) as Box<dyn Transport>
        });
        Self {
            bms: Box::new(SerialTransport::new("bms", &config.bms)),
            esc,
        }
    }
}

/// Summary returned by [`LinkRuntime::shutdown`].
#[derive(Debug)]
pub struct RuntimeReport {
    pub writer: WriterStats,
    /// Records rejected by the full write queue.
    pub dropped: u64,
    pub log_path: PathBuf,
    pub jitter: Arc<TickJitter>,
}

/// Running poller, bridge and data log writer.
pub struct LinkRuntime {
    link_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    poller: JoinHandle<Result<()>>,
    bridge: Option<JoinHandle<Result<()>>>,
    writer: JoinHandle<r_bms_persistence::Result<WriterStats>>,
    logger: Arc<DataLogger>,
    jitter: Arc<TickJitter>,
    log_path: PathBuf,
}

impl LinkRuntime {
    /// Wire up and start every thread.
    ///
    /// The poller publishes to the data log and to the bridge; the bridge
    /// publishes observed ESC status to the data log.
    pub fn start(config: &AppConfig, transports: Transports, registry: Arc<Registry>) -> Result<Self> {
        let link_metrics = LinkMetrics::new(Arc::clone(&registry))?;
        let datalog_metrics = DataLogMetrics::new(registry)?;

        let logger = Arc::new(
            DataLogger::new(config.datalog.queue_capacity).with_metrics(datalog_metrics.clone()),
        );
        let sink = FileSink::for_config(&config.datalog, Utc::now());
        let log_path = sink.path().to_path_buf();
        let writer = LogWriter::from_config(sink, &config.datalog).with_metrics(datalog_metrics);

        let mut poller = Poller::from_config(
            ProtocolDriver::new(transports.bms, config.driver.clone()),
            &config.polling,
        )?
        .with_metrics(link_metrics.clone());
        poller.subscribe(logger.clone());

        let bridge = match transports.esc {
            Some(esc) if config.esc.enabled => {
                let mut bridge = BridgeResponder::from_config(
                    ProtocolDriver::new(esc, config.driver.clone()),
                    &config.esc,
                )?
                .with_metrics(link_metrics);
                poller.subscribe(Arc::new(bridge.handle()));
                bridge.subscribe(logger.clone());
                Some(bridge)
            }
            _ => None,
        };
        let jitter = poller.jitter();

        let link_cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();

        let queue = logger.queue();
        let token = writer_cancel.clone();
        let writer = spawn("datalog-writer", move || writer.run(queue, &token))?;

        let token = link_cancel.clone();
        let poller = match spawn("bms-poller", move || poller.run(&token)) {
            Ok(handle) => handle,
            Err(err) => {
                abandon(&link_cancel, None, &writer_cancel, writer);
                return Err(err);
            }
        };

        let bridge = match bridge {
            Some(bridge) => {
                let token = link_cancel.clone();
                match spawn("esc-bridge", move || bridge.run(&token)) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        abandon(&link_cancel, Some(poller), &writer_cancel, writer);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        info!(
            log = %log_path.display(),
            bridge = bridge.is_some(),
            "link runtime started"
        );
        Ok(Self {
            link_cancel,
            writer_cancel,
            poller,
            bridge,
            writer,
            logger,
            jitter,
            log_path,
        })
    }

    /// File the data log is written to.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn jitter(&self) -> Arc<TickJitter> {
        Arc::clone(&self.jitter)
    }

    /// Whether any link thread has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.poller.is_finished() || self.bridge.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Stop producers first, then let the writer drain the queue.
    pub fn shutdown(self) -> Result<RuntimeReport> {
        info!("stopping link threads");
        self.link_cancel.cancel();
        let poller = join("bms-poller", self.poller);
        let bridge = self.bridge.map(|handle| join("esc-bridge", handle));

        self.writer_cancel.cancel();
        let writer = match self.writer.join() {
            Ok(stats) => stats?,
            Err(_) => return Err(CoreError::ThreadPanicked("datalog-writer")),
        };

        poller?;
        bridge.transpose()?;

        let report = RuntimeReport {
            writer,
            dropped: self.logger.dropped(),
            log_path: self.log_path,
            jitter: self.jitter,
        };
        info!(
            records = report.writer.records,
            bytes = report.writer.bytes,
            dropped = report.dropped,
            "link runtime stopped"
        );
        Ok(report)
    }
}

fn spawn<F, T>(name: &'static str, body: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .map_err(|err| CoreError::Spawn(name, err))
}

/// Stop the threads of a half-finished start, in shutdown order.
fn abandon(
    link_cancel: &CancellationToken,
    poller: Option<JoinHandle<Result<()>>>,
    writer_cancel: &CancellationToken,
    writer: JoinHandle<r_bms_persistence::Result<WriterStats>>,
) {
    warn!("link runtime failed to start; stopping started threads");
    link_cancel.cancel();
    if let Some(poller) = poller {
        let _ = join("bms-poller", poller);
    }
    writer_cancel.cancel();
    match writer.join() {
        Ok(Ok(stats)) => debug!(records = stats.records, "writer stopped after failed start"),
        Ok(Err(err)) => error!(error = %err, "writer failed after failed start"),
        Err(_) => error!("datalog-writer thread panicked"),
    }
}

fn join(name: &'static str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!(thread = name, error = %err, "link thread failed");
            Err(err)
        }
        Err(_) => Err(CoreError::ThreadPanicked(name)),
    }
}
