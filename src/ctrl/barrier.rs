use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Start/stop gate shared by the driver and its workers.
///
/// Each flag is raised exactly once by the driver and spin-read by workers.
#[derive(Debug, Default)]
pub struct Barrier {
    start: AtomicBool,
    stop: AtomicBool,
}

impl Barrier {
    const SPINS_BEFORE_YIELD: u32 = 1 << 10;

    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the workers start.
    pub fn open(&self) {
        self.start.store(true, Ordering::Release);
    }

    /// Tell the workers to stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the gate has been opened.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.start.load(Ordering::Acquire)
    }

    /// Whether the workers have been told to stop.
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Spin until the gate opens. Return `false` if the stop flag was raised
    /// first, in which case the caller should not start at all.
    pub fn wait_open(&self) -> bool {
        let mut spins = 0u32;
        while !self.is_open() {
            if self.should_stop() {
                return false;
            }
            spins += 1;
            if spins % Self::SPINS_BEFORE_YIELD == 0 {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_releases_waiters() {
        let gate = Barrier::new();
        thread::scope(|s| {
            let h = s.spawn(|| gate.wait_open());
            gate.open();
            assert!(h.join().unwrap());
        });
        assert!(!gate.should_stop());
    }

    #[test]
    fn stop_before_open_aborts_wait() {
        let gate = Barrier::new();
        gate.stop();
        assert!(!gate.wait_open());
    }
}
