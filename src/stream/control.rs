// Cancellation and pause flags shared by the control thread and both workers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run-wide control flags.
///
/// `stop` and `emergency` are one-directional: once set they stay set for the
/// rest of the run. Every blocking wait in the pipeline checks them in its
/// predicate, and whoever sets them must wake the waits afterwards.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    emergency: AtomicBool,
    paused: Mutex<bool>,
    pause_cv: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn request_emergency(&self) {
        self.emergency.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.emergency.load(Ordering::SeqCst)
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        *lock(&self.paused) = paused;
        self.pause_cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.paused)
    }

    /// Blocks while paused. Returns `false` if the run was cancelled instead.
    pub fn wait_while_paused(&self) -> bool {
        let guard = lock(&self.paused);
        let _guard = self
            .pause_cv
            .wait_while(guard, |paused| *paused && !self.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        !self.is_cancelled()
    }

    pub fn wake(&self) {
        // Taking the lock orders the flag store before any waiter's predicate check
        drop(lock(&self.paused));
        self.pause_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pause_wait_is_cancellable() {
        let control = Arc::new(RunControl::new());
        control.set_paused(true);
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        control.request_stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_resume_releases_waiter() {
        let control = Arc::new(RunControl::new());
        control.set_paused(true);
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        control.set_paused(false);
        assert!(waiter.join().unwrap());
    }
}
