//! Two-stage cooperative shutdown: stage one quiesces the listener and
//! every worker except (if the caller is itself a worker) the one
//! currently running the quit handler, so that worker can finish writing
//! its own response before stage two tears down the rest.
//!
//! A single `quit` flag plus a `tokio::sync::Notify` wakes any blocking
//! waits instead of a dedicated eventfd/pipe, since everything here is
//! already running on the async runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct AlreadyQuitting;

pub struct Shutdown {
    quit: AtomicBool,
    notify: Notify,
    lock_held: AtomicBool,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    workers: parking_lot::Mutex<HashMap<usize, JoinHandle<()>>>,
    deferred: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            quit: AtomicBool::new(false),
            notify: Notify::new(),
            lock_held: AtomicBool::new(false),
            listener: parking_lot::Mutex::new(None),
            workers: parking_lot::Mutex::new(HashMap::new()),
            deferred: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Lets the listener task wake up early instead of waiting out its
    /// accept-loop tick.
    pub async fn wait_for_quit(&self) {
        if !self.is_quitting() {
            self.notify.notified().await;
        }
    }

    pub fn register_listener(&self, handle: JoinHandle<()>) {
        *self.listener.lock() = Some(handle);
    }

    pub fn register_worker(&self, id: usize, handle: JoinHandle<()>) {
        self.workers.lock().insert(id, handle);
    }

    /// Try-lock semantics: a second concurrent quit request is rejected
    /// rather than blocking.
    pub async fn quit_stage_one(&self, caller_worker_id: Option<usize>) -> Result<(), AlreadyQuitting> {
        if self
            .lock_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AlreadyQuitting);
        }

        self.quit.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        let listener_handle = self.listener.lock().take();
        if let Some(handle) = listener_handle {
            let _ = handle.await;
        }

        let deferred_id = caller_worker_id;
        let to_join = {
            let mut workers = self.workers.lock();
            let mut to_join = Vec::new();
            let ids: Vec<usize> = workers.keys().copied().collect();
            for id in ids {
                if Some(id) == deferred_id {
                    continue;
                }
                if let Some(handle) = workers.remove(&id) {
                    to_join.push(handle);
                }
            }
            if let Some(id) = deferred_id {
                if let Some(handle) = workers.remove(&id) {
                    *self.deferred.lock() = Some(handle);
                }
            }
            to_join
        };

        for handle in to_join {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Joins the one deferred worker (the caller of stage one, if it was a
    /// worker), once it has finished replying to the request that
    /// triggered the shutdown.
    pub async fn quit_stage_two(&self) {
        let handle = self.deferred.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub type SharedShutdown = Arc<Shutdown>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_quit_is_rejected_while_first_is_in_flight() {
        let shutdown = Arc::new(Shutdown::new());
        assert!(shutdown.quit_stage_one(None).await.is_ok());
        assert!(matches!(
            shutdown.quit_stage_one(None).await,
            Err(AlreadyQuitting)
        ));
    }

    #[tokio::test]
    async fn deferred_worker_is_not_joined_until_stage_two() {
        let shutdown = Arc::new(Shutdown::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });
        shutdown.register_worker(1, handle);

        let sd = shutdown.clone();
        let stage_one = tokio::spawn(async move { sd.quit_stage_one(Some(1)).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        stage_one.await.unwrap().unwrap();
        shutdown.quit_stage_two().await;
    }
}
