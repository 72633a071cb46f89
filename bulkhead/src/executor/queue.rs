use std::fmt;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{RwLock, RwLockReadGuard};

use super::Job;

/// The work queue sitting between submitters and the worker threads of one
/// executor.
///
/// Two shapes are supported:
/// - Bounded: a FIFO holding at most `capacity` jobs.
/// - Direct hand-off (`capacity == None`): nothing is ever stored. An offer
///   only succeeds when an idle worker is already waiting for a job, so the
///   queue length is always zero.
///
/// # Thread Safety
/// - Backed by a flume channel, safe for concurrent producers and consumers
/// - The sending half sits behind a read-write lock so that closing the queue
///   excludes every in-flight admission
///
/// # Shutdown
/// Closing drops the only sender. Workers keep receiving whatever is still
/// queued and observe [`Poll::Closed`] once the queue has drained.
pub(crate) struct WorkQueue {
    sender: RwLock<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    capacity: Option<usize>,
}

/// Outcome of a worker waiting for its next job.
pub(crate) enum Poll {
    Job(Job),
    TimedOut,
    Closed,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        // A zero-capacity flume channel is a rendezvous channel: `try_send`
        // succeeds only if a receiver is currently blocked waiting.
        let (sender, receiver) = flume::bounded(capacity.unwrap_or(0));
        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            capacity,
        }
    }

    /// Hold the admission side open. `None` inside the guard means the queue
    /// has been closed.
    pub(crate) fn admission(&self) -> RwLockReadGuard<'_, Option<Sender<Job>>> {
        self.sender.read()
    }

    /// Offer a job without blocking, handing it back if there is no room.
    pub(crate) fn offer(sender: &Sender<Job>, job: Job) -> Result<(), Job> {
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    /// Wait up to `timeout` for the next job.
    pub(crate) fn poll(&self, timeout: Duration) -> Poll {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => Poll::Job(job),
            Err(RecvTimeoutError::Timeout) => Poll::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    /// Stop accepting offers. Returns `false` if the queue was already closed.
    pub(crate) fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Number of queued jobs.
    ///
    /// This is a snapshot and may change by the time the value is used.
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// `None` for a direct hand-off queue.
    pub(crate) fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_bounded_queue_refuses_when_full() {
        let queue = WorkQueue::new(Some(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let admission = queue.admission();
        let sender = admission.as_ref().unwrap();

        assert!(WorkQueue::offer(sender, job(&counter)).is_ok());
        assert!(WorkQueue::offer(sender, job(&counter)).is_ok());
        assert!(WorkQueue::offer(sender, job(&counter)).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_hand_off_needs_waiting_worker() {
        let queue = Arc::new(WorkQueue::new(None));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let admission = queue.admission();
            let sender = admission.as_ref().unwrap();
            assert!(WorkQueue::offer(sender, job(&counter)).is_err());
        }
        assert_eq!(queue.len(), 0);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || match queue.poll(Duration::from_secs(5)) {
                Poll::Job(job) => job(),
                _ => panic!("expected a job"),
            })
        };

        // Keep offering until the consumer is parked and takes the job.
        let mut pending = Some(job(&counter));
        while let Some(next) = pending.take() {
            let admission = queue.admission();
            if let Err(back) = WorkQueue::offer(admission.as_ref().unwrap(), next) {
                pending = Some(back);
                thread::sleep(Duration::from_millis(5));
            }
        }
        consumer.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_queue_drains_then_reports_closed() {
        let queue = WorkQueue::new(Some(4));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let admission = queue.admission();
            WorkQueue::offer(admission.as_ref().unwrap(), job(&counter))
                .unwrap_or_else(|_| panic!("offer should succeed"));
        }
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());

        match queue.poll(Duration::from_millis(10)) {
            Poll::Job(job) => job(),
            _ => panic!("queued job should still be delivered"),
        }
        assert!(matches!(queue.poll(Duration::from_millis(10)), Poll::Closed));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
