//! Renewable one-shot expiry timer.
//!
//! A lease fires its callback at most once, when no renewal arrived for the
//! whole timeout. Renewal is idempotent; closing a lease prevents the
//! callback from ever firing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct LeaseInner {
    timeout: Duration,
    deadline: Mutex<Instant>,
    notify: Notify,
    closed: AtomicBool,
}

pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Start a lease; `on_expire` runs on the timer task when the lease
    /// expires without renewal.
    pub fn start<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::new(LeaseInner {
            timeout,
            deadline: Mutex::new(Instant::now() + timeout),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let timer = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut callback = Some(on_expire);
            loop {
                let deadline = *timer.deadline.lock().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if timer.closed.load(Ordering::Acquire) {
                            return;
                        }
                        // a renewal may have moved the deadline meanwhile
                        let current = *timer.deadline.lock().unwrap();
                        if Instant::now() >= current {
                            if let Some(callback) = callback.take() {
                                callback();
                            }
                            return;
                        }
                    }
                    _ = timer.notify.notified() => {
                        if timer.closed.load(Ordering::Acquire) {
                            return;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    /// Push the deadline out by the full timeout. Idempotent.
    pub fn renew(&self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        *self.inner.deadline.lock().unwrap() = Instant::now() + self.inner.timeout;
    }

    /// Disarm the lease; the callback will not fire.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _lease = Lease::start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_defers_expiry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let lease = Lease::start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            lease.renew();
            lease.renew(); // renewal is idempotent
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disarms() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let lease = Lease::start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lease.close();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
