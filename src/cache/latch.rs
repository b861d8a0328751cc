//! One-shot latch handed to producers when the exclusive write cache
//! overflows. The flusher counts it down once pressure drops back under the
//! release threshold.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct ExclusiveLatch {
    released: Mutex<bool>,
    wakeup: Condvar,
}

impl ExclusiveLatch {
    pub fn new() -> Self {
        Self {
            released: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Blocks until the flusher releases the latch.
    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.wakeup.wait(&mut released);
        }
    }

    /// Bounded wait; returns whether the latch was released.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut released = self.released.lock();
        if *released {
            return true;
        }
        self.wakeup.wait_for(&mut released, timeout);
        *released
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    pub fn count_down(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.wakeup.notify_all();
    }
}

impl Default for ExclusiveLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiters_wake_on_count_down() {
        let latch = Arc::new(ExclusiveLatch::new());
        let waiter = Arc::clone(&latch);
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(20));
        assert!(!latch.is_released());
        latch.count_down();
        handle.join().unwrap();
        assert!(latch.is_released());
    }

    #[test]
    fn wait_for_times_out_without_release() {
        let latch = ExclusiveLatch::new();
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_for(Duration::from_millis(10)));
    }
}
