//! Bounded submission runtime.
//!
//! Candidates may arrive concurrently from many independent submissions.
//! This module provides a small, bounded, thread-based runtime that
//! feeds a shared [`MergeEngine`] from a backpressured queue: per-entity
//! serialization stays with the resolver's optimistic concurrency, the
//! runtime only bounds how much work is in flight at once.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

use crate::candidate::CandidateRecord;
use crate::config::RuntimeConfig;
use crate::engine::MergeEngine;
use crate::error::{CanonResult, RuntimeError};
use crate::resolver::MergeReceipt;

enum Job {
    Submit {
        candidate: CandidateRecord,
        reply: Sender<CanonResult<MergeReceipt>>,
    },
}

/// Handle to an asynchronously processed submission.
#[derive(Debug)]
pub struct SubmissionTicket {
    reply: Receiver<CanonResult<MergeReceipt>>,
}

impl SubmissionTicket {
    /// Blocks until the submission finishes.
    ///
    /// # Errors
    /// - [`RuntimeError::ShutDown`] if the runtime stopped before the
    ///   submission was processed.
    /// - Otherwise the submission's own result.
    pub fn wait(self) -> CanonResult<MergeReceipt> {
        self.reply
            .recv()
            .map_err(|_| RuntimeError::ShutDown)?
    }
}

/// A bounded worker pool over a shared engine.
pub struct EngineRuntime {
    engine: Arc<MergeEngine>,
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl EngineRuntime {
    /// Starts workers over the given engine.
    #[must_use]
    pub fn start(engine: Arc<MergeEngine>, config: RuntimeConfig) -> Self {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(&engine);
            let thread_name = format!("canonize-worker-{idx}");
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    while let Ok(Job::Submit { candidate, reply }) = rx.recv() {
                        let result = engine.submit(candidate);
                        let _ = reply.send(result);
                    }
                })
                .expect("failed to spawn canonize worker");
            handles.push(handle);
        }

        debug!(workers, queue_capacity, "engine runtime started");
        Self {
            engine,
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    /// The engine the runtime feeds.
    #[must_use]
    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    /// Enqueues a submission without blocking.
    ///
    /// # Errors
    /// - [`RuntimeError::QueueFull`] when the bounded queue is at
    ///   capacity; the caller may retry.
    /// - [`RuntimeError::ShutDown`] if the workers are gone.
    pub fn try_submit(
        &self,
        candidate: CandidateRecord,
    ) -> Result<SubmissionTicket, RuntimeError> {
        let (reply_tx, reply_rx) = bounded(1);
        match self.tx.try_send(Job::Submit {
            candidate,
            reply: reply_tx,
        }) {
            Ok(()) => Ok(SubmissionTicket { reply: reply_rx }),
            Err(TrySendError::Full(_)) => Err(RuntimeError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::ShutDown),
        }
    }

    /// Enqueues a submission and waits for its result.
    ///
    /// # Errors
    /// Backpressure and shutdown surface as
    /// [`crate::CanonError::Runtime`]; everything else is the
    /// submission's own result.
    pub fn submit(&self, candidate: CandidateRecord) -> CanonResult<MergeReceipt> {
        let ticket = self.try_submit(candidate)?;
        ticket.wait()
    }

    /// Stops accepting work and joins the workers. Queued submissions
    /// are drained first.
    pub fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
        debug!("engine runtime stopped");
    }
}
