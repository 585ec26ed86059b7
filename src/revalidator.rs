//! Background revalidation: a bounded worker pool that refreshes
//! stored entries while stale responses are being served.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{AbortHandle, Abortable, BoxFuture};
use log::{debug, warn};
use tokio::sync::Semaphore;

/// Executes revalidation work off-band.
///
/// At most `max_workers` revalidations run concurrently and at most
/// one is in flight per fingerprint. The task itself is supplied by
/// the executor as a future over its own revalidation routine; its
/// response is discarded, only the storage side-effects matter.
#[derive(Debug, Clone)]
pub struct AsyncRevalidator {
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    handles: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl AsyncRevalidator {
    /// A pool running at most `max_workers` revalidations at once.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues a revalidation for `fingerprint`. Returns `false`
    /// when one is already in flight for the same fingerprint.
    pub fn schedule(&self, fingerprint: String, task: BoxFuture<'static, ()>) -> bool {
        {
            let mut in_flight = self.in_flight.lock().expect("revalidator set poisoned");
            if !in_flight.insert(fingerprint.clone()) {
                debug!("revalidation already in flight for {fingerprint}");
                return false;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        self.handles.lock().expect("revalidator handles poisoned").insert(id, abort_handle);

        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let handles = Arc::clone(&self.handles);
        let guarded = async move {
            // permit acquisition is inside the abortable section so
            // queued work is cancellable too
            match permits.acquire().await {
                Ok(_permit) => task.await,
                Err(_) => warn!("revalidation pool closed before {fingerprint} ran"),
            }
            in_flight.lock().expect("revalidator set poisoned").remove(&fingerprint);
            fingerprint
        };

        tokio::spawn(async move {
            match Abortable::new(guarded, abort_registration).await {
                Ok(fingerprint) => debug!("background revalidation finished for {fingerprint}"),
                Err(_) => debug!("background revalidation aborted"),
            }
            handles.lock().expect("revalidator handles poisoned").remove(&id);
        });
        true
    }

    /// Cancels queued and running revalidations.
    pub fn shutdown(&self) {
        self.permits.close();
        let handles = std::mem::take(&mut *self.handles.lock().expect("revalidator handles poisoned"));
        for (_, handle) in handles {
            handle.abort();
        }
        self.in_flight.lock().expect("revalidator set poisoned").clear();
    }

    /// How many revalidations are currently tracked as in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().expect("revalidator set poisoned").len()
    }
}
