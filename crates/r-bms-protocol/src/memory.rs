//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "In-process bus pair for simulators and tests."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use r_bms_common::CancellationToken;

use crate::transport::Transport;
use crate::{ProtocolError, Result};

// Upper bound on how long a reader sleeps before re-checking cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Channel {
    bytes: Mutex<VecDeque<u8>>,
    arrived: Condvar,
}

/// One end of an in-memory, full-speed bus.
///
/// Bytes written on one end become readable on the other. Readers park on
/// a condition variable that writers signal, so waiting costs no polling
/// beyond the periodic cancellation check.
pub struct MemoryTransport {
    name: String,
    inbound: Arc<Channel>,
    outbound: Arc<Channel>,
    resets: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair(left: &str, right: &str) -> (Self, Self) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        let left = Self {
            name: left.to_owned(),
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            resets: Arc::default(),
        };
        let right = Self {
            name: right.to_owned(),
            inbound: a_to_b,
            outbound: b_to_a,
            resets: Arc::default(),
        };
        (left, right)
    }

    /// How often [`Transport::reset`] was called on this end.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Shared view of the reset counter, usable after the transport moved
    /// into a driver thread.
    pub fn reset_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.resets)
    }

    /// Bytes waiting to be read on this end.
    pub fn pending(&self) -> usize {
        self.inbound.bytes.lock().len()
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.outbound.bytes.lock().extend(bytes.iter().copied());
        self.outbound.arrived.notify_all();
        Ok(())
    }

    fn read_exactly(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut filled = 0;
        let mut queue = self.inbound.bytes.lock();
        loop {
            while filled < buffer.len() {
                match queue.pop_front() {
                    Some(byte) => {
                        buffer[filled] = byte;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == buffer.len() {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            let now = Instant::now();
            let wake = match deadline {
                Some(deadline) if now >= deadline => return Ok(false),
                Some(deadline) => deadline.min(now + CANCEL_POLL),
                None => now + CANCEL_POLL,
            };
            self.inbound.arrived.wait_until(&mut queue, wake);
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        self.inbound.bytes.lock().clear();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.inbound.bytes.lock().clear();
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_cross_to_the_peer() {
        let (mut left, mut right) = MemoryTransport::pair("host", "device");
        let cancel = CancellationToken::new();
        left.write(&[1, 2, 3]).unwrap();
        assert_eq!(right.pending(), 3);

        let mut buffer = [0u8; 3];
        assert!(right
            .read_exactly(&mut buffer, Some(Duration::from_millis(10)), &cancel)
            .unwrap());
        assert_eq!(buffer, [1, 2, 3]);
        assert_eq!(left.pending(), 0);
    }

    #[test]
    fn short_read_times_out() {
        let (mut left, mut right) = MemoryTransport::pair("host", "device");
        let cancel = CancellationToken::new();
        left.write(&[1]).unwrap();
        let mut buffer = [0u8; 2];
        let started = Instant::now();
        assert!(!right
            .read_exactly(&mut buffer, Some(Duration::from_millis(30)), &cancel)
            .unwrap());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn reader_wakes_on_late_write() {
        let (mut left, mut right) = MemoryTransport::pair("host", "device");
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            left.write(&[9, 8]).unwrap();
        });
        let mut buffer = [0u8; 2];
        assert!(right
            .read_exactly(&mut buffer, None, &CancellationToken::new())
            .unwrap());
        assert_eq!(buffer, [9, 8]);
        writer.join().unwrap();
    }

    #[test]
    fn cancellation_interrupts_unbounded_read() {
        let (_left, mut right) = MemoryTransport::pair("host", "device");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.cancel();
        });
        let mut buffer = [0u8; 1];
        let err = right.read_exactly(&mut buffer, None, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        canceller.join().unwrap();
    }

    #[test]
    fn reset_drops_pending_input() {
        let (mut left, mut right) = MemoryTransport::pair("host", "device");
        left.write(&[1, 2, 3]).unwrap();
        right.reset().unwrap();
        assert_eq!(right.pending(), 0);
        assert_eq!(right.reset_count(), 1);
    }
}
