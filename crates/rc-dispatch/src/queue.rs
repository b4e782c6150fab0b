//! Background work queue.
//!
//! Jobs run on tokio's blocking pool, at most `max_concurrent` at a time,
//! in no particular order. Results come back through a channel owned by the
//! queue, so they are only ever observed by whoever drains it. Once the
//! queue is dropped, late results are discarded by the worker that produced
//! them.

use std::sync::Arc;

use log::trace;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};

use crate::error::JobError;

pub(crate) type JobId = u64;

/// Output of one posted job.
pub(crate) struct Finished<T> {
    pub id: JobId,
    pub output: Result<T, JobError>,
}

pub(crate) struct WorkQueue<T> {
    runtime: Handle,
    permits: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<Finished<T>>,
    done_rx: mpsc::UnboundedReceiver<Finished<T>>,
    next_id: JobId,
    in_flight: usize,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(runtime: Handle, max_concurrent: usize) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            done_tx,
            done_rx,
            next_id: 0,
            in_flight: 0,
        }
    }

    /// Jobs posted but not yet handed back by [`Self::next`] or
    /// [`Self::try_next`].
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn post<F>(&mut self, job: F) -> JobId
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight += 1;

        let permits = Arc::clone(&self.permits);
        let done = self.done_tx.clone();
        self.runtime.spawn(async move {
            let output = match permits.acquire_owned().await {
                Ok(permit) => tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    job()
                })
                .await
                .map_err(JobError::from),
                Err(_) => Err(JobError::Cancelled),
            };
            if done.send(Finished { id, output }).is_err() {
                trace!("job {} finished after its queue was dropped", id);
            }
        });
        id
    }

    /// Wait for the next finished job. `None` when nothing is in flight.
    pub async fn next(&mut self) -> Option<Finished<T>> {
        if self.in_flight == 0 {
            return None;
        }
        // The queue keeps a sender alive, so the channel never closes here.
        let finished = self.done_rx.recv().await?;
        self.in_flight -= 1;
        Some(finished)
    }

    /// A finished job, if one is already waiting.
    pub fn try_next(&mut self) -> Option<Finished<T>> {
        let finished = self.done_rx.try_recv().ok()?;
        self.in_flight -= 1;
        Some(finished)
    }
}
