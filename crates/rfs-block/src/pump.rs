//! Asynchronous write pump.
//!
//! The journal issues metadata and log-buffer writes asynchronously and
//! learns about their fate through a completion callback. This module
//! provides that seam: a `WritePump` accepts jobs and invokes each
//! job's completion exactly once, from the pump's context.
//!
//! # Design
//!
//! - `ThreadedPump` runs a single worker thread fed over an `mpsc`
//!   channel. Jobs complete in submission order per pump, which is all
//!   the journal relies on (completions for one flush may interleave
//!   with foreground work, but never reorder against each other).
//! - `InlinePump` performs the write on the submitting thread. Used in
//!   tests where deterministic completion is wanted.

use crate::ByteDevice;
use rfs_error::Result;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Completion callback for an asynchronous write.
pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A single asynchronous write request.
pub struct WriteJob {
    pub dev: Arc<dyn ByteDevice>,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: WriteCompletion,
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteJob")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Sink for asynchronous writes with completion callbacks.
pub trait WritePump: Send + Sync {
    /// Queue `job`; its completion runs exactly once, after the write
    /// finishes or fails.
    fn submit(&self, job: WriteJob);
}

fn run_job(job: WriteJob) {
    let WriteJob {
        dev,
        offset,
        data,
        done,
    } = job;
    let result = dev.write_all_at(offset, &data);
    if let Err(error) = &result {
        tracing::warn!(
            target: "rwl::pump",
            offset,
            len = data.len(),
            %error,
            "async write failed"
        );
    }
    done(result);
}

enum PumpMsg {
    Job(WriteJob),
    Shutdown,
}

/// Worker-thread pump. Completions run on the worker thread.
pub struct ThreadedPump {
    tx: Sender<PumpMsg>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedPump {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("rwl-write-pump".to_owned())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        PumpMsg::Job(job) => run_job(job),
                        PumpMsg::Shutdown => break,
                    }
                }
            })
            .expect("spawn write pump thread");
        Self {
            tx,
            worker: Some(worker),
        }
    }
}

impl Default for ThreadedPump {
    fn default() -> Self {
        Self::new()
    }
}

impl WritePump for ThreadedPump {
    fn submit(&self, job: WriteJob) {
        // A send failure means the worker is gone; run the job inline so
        // the completion still fires.
        if let Err(mpsc::SendError(PumpMsg::Job(job))) = self.tx.send(PumpMsg::Job(job)) {
            run_job(job);
        }
    }
}

impl Drop for ThreadedPump {
    fn drop(&mut self) {
        let _ = self.tx.send(PumpMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Pump that performs each write on the submitting thread.
#[derive(Debug, Default)]
pub struct InlinePump;

impl WritePump for InlinePump {
    fn submit(&self, job: WriteJob) {
        run_job(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultDevice, MemByteDevice};
    use std::sync::mpsc::channel;

    #[test]
    fn threaded_pump_writes_and_completes() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let pump = ThreadedPump::new();
        let (tx, rx) = channel();

        pump.submit(WriteJob {
            dev: Arc::clone(&dev),
            offset: 128,
            data: vec![9_u8; 64],
            done: Box::new(move |res| tx.send(res.is_ok()).unwrap()),
        });

        assert!(rx.recv().expect("completion"));
        let mut buf = [0_u8; 64];
        dev.read_exact_at(128, &mut buf).expect("read back");
        assert_eq!(buf, [9_u8; 64]);
    }

    #[test]
    fn threaded_pump_completes_in_submission_order() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let pump = ThreadedPump::new();
        let (tx, rx) = channel();

        for i in 0_u8..8 {
            let tx = tx.clone();
            pump.submit(WriteJob {
                dev: Arc::clone(&dev),
                offset: u64::from(i) * 16,
                data: vec![i; 16],
                done: Box::new(move |_| tx.send(i).unwrap()),
            });
        }

        let order: Vec<u8> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn inline_pump_reports_failures() {
        let fault = FaultDevice::new(MemByteDevice::new(4096));
        fault.fail_after_writes(0);
        let dev: Arc<dyn ByteDevice> = Arc::new(fault);
        let (tx, rx) = channel();

        InlinePump.submit(WriteJob {
            dev,
            offset: 0,
            data: vec![1_u8; 16],
            done: Box::new(move |res| tx.send(res.is_err()).unwrap()),
        });

        assert!(rx.recv().expect("completion"));
    }
}
