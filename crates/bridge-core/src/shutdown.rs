use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline passed without a shutdown request.
    Elapsed,
    Triggered,
}

/// One-shot shutdown signal shared by blocking waiters (tick waits, settle
/// waits) and async tasks (the poller).
///
/// Triggering drops the channel sender, which disconnects every receiver and
/// wakes all blocked `wait_until` calls at once.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    triggered: AtomicBool,
    notify: watch::Sender<bool>,
    wakers: Mutex<Wakers>,
}

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Wakers {
    next_id: u64,
    registered: Vec<(u64, Waker)>,
}

/// Registration returned by [`Shutdown::on_trigger`]; the waker is removed
/// when this is dropped.
#[must_use = "the waker is unregistered when the guard is dropped"]
pub struct TriggerHook {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for TriggerHook {
    fn drop(&mut self) {
        self.inner.wakers.lock().registered.retain(|(id, _)| *id != self.id);
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown").field("triggered", &self.is_triggered()).finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx,
                triggered: AtomicBool::new(false),
                notify,
                wakers: Mutex::new(Wakers::default()),
            }),
        }
    }

    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tx.lock().take();
        self.inner.notify.send_replace(true);
        // run outside the lock; a waker may take locks of its own
        let wakers: Vec<Waker> = self.inner.wakers.lock().registered.iter().map(|(_, w)| Arc::clone(w)).collect();
        for wake in wakers {
            wake();
        }
    }

    /// Run `wake` when shutdown is triggered, so waiters parked on some other
    /// primitive (a condvar, say) can be woken. Runs at once if the signal
    /// has already fired.
    pub fn on_trigger(&self, wake: impl Fn() + Send + Sync + 'static) -> TriggerHook {
        let wake: Waker = Arc::new(wake);
        let id = {
            let mut wakers = self.inner.wakers.lock();
            let id = wakers.next_id;
            wakers.next_id += 1;
            wakers.registered.push((id, Arc::clone(&wake)));
            id
        };
        // covers a trigger that drained the list before this registration
        if self.is_triggered() {
            wake();
        }
        TriggerHook { inner: Arc::clone(&self.inner), id }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Block until `deadline` or until shutdown is triggered, whichever is first.
    pub fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        if self.is_triggered() {
            return WaitOutcome::Triggered;
        }
        match self.inner.rx.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Elapsed,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => WaitOutcome::Triggered,
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.inner.notify.subscribe();
        let _ = rx.wait_for(|t| *t).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_elapses_without_trigger() {
        let s = Shutdown::new();
        let start = Instant::now();
        assert_eq!(s.wait_until(start + Duration::from_millis(20)), WaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_wakes_blocked_waiter() {
        let s = Shutdown::new();
        let waiter = s.clone();
        let h = std::thread::spawn(move || {
            let start = Instant::now();
            let out = waiter.wait_until(start + Duration::from_secs(10));
            (out, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(30));
        s.trigger();
        let (out, waited) = h.join().unwrap();
        assert_eq!(out, WaitOutcome::Triggered);
        assert!(waited < Duration::from_secs(2));
        // stays triggered
        assert_eq!(s.wait_until(Instant::now() + Duration::from_secs(1)), WaitOutcome::Triggered);
    }

    #[test]
    fn test_trigger_runs_registered_wakers() {
        use std::sync::atomic::AtomicU32;

        let s = Shutdown::new();
        let woken = Arc::new(AtomicU32::new(0));
        let kept = {
            let woken = Arc::clone(&woken);
            s.on_trigger(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };
        let dropped = {
            let woken = Arc::clone(&woken);
            s.on_trigger(move || {
                woken.fetch_add(100, Ordering::SeqCst);
            })
        };
        drop(dropped);

        s.trigger();
        s.trigger();
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // late registration fires immediately
        let late = Arc::new(AtomicU32::new(0));
        let _hook = {
            let late = Arc::clone(&late);
            s.on_trigger(move || {
                late.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(late.load(Ordering::SeqCst), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn test_async_waiter_resolves() {
        let s = Shutdown::new();
        let t = s.clone();
        let task = tokio::spawn(async move { t.triggered().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.trigger();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        // already-triggered signal resolves immediately
        tokio::time::timeout(Duration::from_millis(50), s.triggered()).await.unwrap();
    }
}
