//! The data callback worker.
//!
//! Data callbacks never run on the socket thread. The data-plane loop
//! enqueues a [`WorkItem`] per callback per packet; a single dedicated
//! consumer thread pops items strictly in enqueue order and invokes them
//! synchronously, so callbacks for the same stream never run concurrently
//! and never reorder. The consumer blocks on the queue with a one-second
//! timeout and polls the stop flag between items and on every timeout, so
//! shutdown is cooperative and bounded.
//!
//! If a callback takes longer than the packet inter-arrival time, items
//! accumulate; there is no drop policy here. Users doing heavy DSP are
//! expected to hand off to their own threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flexwave_core::{Error, Result};

use crate::rt::{self, RtRole};
use crate::vita::VitaPacket;
use crate::waveform::{DataCallback, Waveform};

/// How long the consumer waits on the queue before re-checking the stop
/// flag.
const WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// One scheduled data callback invocation. Owns its copy of the packet
/// until executed.
pub(crate) struct WorkItem {
    pub waveform: Arc<Waveform>,
    pub callback: DataCallback,
    pub packet: VitaPacket,
}

/// Single-producer / single-consumer FIFO with a dedicated consumer thread.
pub(crate) struct DataWorker {
    tx: mpsc::Sender<WorkItem>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DataWorker {
    /// Spawn the consumer thread.
    pub(crate) fn spawn() -> Result<DataWorker> {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("flexwave-data-worker".into())
            .spawn(move || {
                rt::set_realtime_priority(RtRole::DataWorker);

                while thread_running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(WAKE_INTERVAL) {
                        Ok(item) => {
                            (item.callback)(&item.waveform, &item.packet);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("data worker exiting");
            })
            .map_err(|e| Error::Transport(format!("cannot spawn data worker thread: {e}")))?;

        Ok(DataWorker {
            tx,
            running,
            handle: Some(handle),
        })
    }

    /// Enqueue one callback invocation. Items run in enqueue order.
    pub(crate) fn enqueue(&self, item: WorkItem) {
        if self.tx.send(item).is_err() {
            tracing::warn!("data worker gone; dropping work item");
        }
    }

    /// Stop the consumer and join it. Items still queued do not execute.
    pub(crate) fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DataWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::Radio;
    use std::sync::Mutex;

    fn test_waveform() -> Arc<Waveform> {
        let radio = Radio::new("127.0.0.1:4992".parse().unwrap());
        Waveform::build(&radio, "TestWave", "TEST", "USB", "1.0.0").unwrap()
    }

    fn dummy_packet() -> VitaPacket {
        VitaPacket::audio(2, 0, 0, 0, &[0.0; 4]).unwrap()
    }

    #[test]
    fn items_execute_in_enqueue_order() {
        let wf = test_waveform();
        let mut worker = DataWorker::spawn().unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        const N: usize = 100;
        for i in 0..N {
            let seen = Arc::clone(&seen);
            let done_tx = done_tx.clone();
            let callback: DataCallback = Arc::new(move |_wf, _packet| {
                seen.lock().unwrap().push(i);
                if i == N - 1 {
                    done_tx.send(()).unwrap();
                }
            });
            worker.enqueue(WorkItem {
                waveform: Arc::clone(&wf),
                callback,
                packet: dummy_packet(),
            });
        }

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("all items should have run");
        let seen = seen.lock().unwrap();
        let expected: Vec<usize> = (0..N).collect();
        assert_eq!(*seen, expected);

        worker.shutdown();
    }

    #[test]
    fn callbacks_do_not_run_concurrently() {
        let wf = test_waveform();
        let mut worker = DataWorker::spawn().unwrap();

        let in_flight = Arc::new(AtomicBool::new(false));
        let overlap = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        const N: usize = 20;
        for i in 0..N {
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            let done_tx = done_tx.clone();
            let callback: DataCallback = Arc::new(move |_wf, _packet| {
                if in_flight.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                in_flight.store(false, Ordering::SeqCst);
                if i == N - 1 {
                    done_tx.send(()).unwrap();
                }
            });
            worker.enqueue(WorkItem {
                waveform: Arc::clone(&wf),
                callback,
                packet: dummy_packet(),
            });
        }

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!overlap.load(Ordering::SeqCst), "callbacks overlapped");

        worker.shutdown();
    }

    #[test]
    fn shutdown_stops_execution() {
        let wf = test_waveform();
        let mut worker = DataWorker::spawn().unwrap();
        worker.shutdown();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_cb = Arc::clone(&ran);
        let callback: DataCallback = Arc::new(move |_wf, _packet| {
            ran_cb.store(true, Ordering::SeqCst);
        });
        worker.enqueue(WorkItem {
            waveform: wf,
            callback,
            packet: dummy_packet(),
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst), "no item may run after shutdown");
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut worker = DataWorker::spawn().unwrap();
        worker.shutdown();
        worker.shutdown();
    }
}
