//! Generic supervised-restart wrapper for pool worker tasks.
//!
//! Mirrors the bounded-attempts, fixed-backoff shape of
//! `types::error::RecoveryStrategy::Restart`, but applies it as a single
//! reusable component both pools hold one instance of, rather than each
//! pool hand-rolling its own restart loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// Bounded panic-restart supervision for a pool worker reading from an
/// mpsc mailbox.
///
/// `run` spawns the per-item processing loop as its own task so a panic
/// inside `process` surfaces as a `JoinError` instead of taking the
/// whole pool down with it. The receiver lives behind a `Mutex` so a
/// panicked attempt doesn't drop it with the unwind; the next attempt
/// picks up queued messages where the crashed one left off. A clean
/// mailbox close (every sender dropped, i.e. pool shutdown) ends
/// supervision immediately rather than counting as a restart.
pub struct WorkerSupervisor {
    max_attempts: u32,
    delay: Duration,
}

impl WorkerSupervisor {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    pub async fn run<T, Fut>(&self, label: String, rx: mpsc::Receiver<T>, process: impl Fn(T) -> Fut + Send + Sync + 'static)
    where
        T: Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = Arc::new(Mutex::new(rx));
        let process = Arc::new(process);
        let mut attempts = 0u32;
        loop {
            let rx = rx.clone();
            let process = process.clone();
            let handle = tokio::spawn(async move {
                let mut rx = rx.lock().await;
                while let Some(item) = rx.recv().await {
                    process(item).await;
                }
            });

            match handle.await {
                Ok(()) => {
                    tracing::debug!(worker = %label, "mailbox closed, supervisor exiting cleanly");
                    return;
                }
                Err(join_err) => {
                    attempts += 1;
                    tracing::error!(worker = %label, attempt = attempts, error = %join_err, "worker task ended abnormally, restarting");
                    if attempts >= self.max_attempts {
                        tracing::error!(worker = %label, "exceeded restart attempts, giving up");
                        return;
                    }
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn clean_mailbox_close_returns_without_restarting() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let supervisor = WorkerSupervisor::new(5, Duration::from_millis(10));
        supervisor
            .run("test".to_string(), rx, move |_item: u32| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_worker_restarts_and_resumes_the_mailbox() {
        let (tx, rx) = mpsc::channel::<u32>(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        drop(tx);

        let supervisor = WorkerSupervisor::new(5, Duration::from_millis(5));
        supervisor
            .run("test".to_string(), rx, move |item: u32| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if item == 2 {
                        panic!("boom");
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_gives_up() {
        let (tx, rx) = mpsc::channel::<u32>(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        for _ in 0..10 {
            tx.send(1).await.unwrap();
        }
        drop(tx);

        let supervisor = WorkerSupervisor::new(3, Duration::from_millis(1));
        supervisor
            .run("test".to_string(), rx, move |_item: u32| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    panic!("always boom");
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
