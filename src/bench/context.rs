use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ctrl::Barrier;

/// State shared by an endpoint's event loop and its workers.
///
/// The counters are written only by the event loop; the gate is written only
/// by the driver.
#[derive(Debug)]
pub struct BenchContext {
    connections: usize,
    connects_left: AtomicUsize,
    disconnects_left: AtomicUsize,
    gate: Barrier,
}

impl BenchContext {
    pub fn new(connections: usize) -> Self {
        Self {
            connections,
            connects_left: AtomicUsize::new(connections),
            disconnects_left: AtomicUsize::new(0),
            gate: Barrier::new(),
        }
    }

    /// Number of connections the run is configured for.
    #[inline]
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Connections still awaiting establishment or failure.
    #[inline]
    pub fn connects_left(&self) -> usize {
        self.connects_left.load(Ordering::Acquire)
    }

    /// Established connections still awaiting disconnection.
    #[inline]
    pub fn disconnects_left(&self) -> usize {
        self.disconnects_left.load(Ordering::Acquire)
    }

    /// The start/stop gate of the workers.
    #[inline]
    pub fn gate(&self) -> &Barrier {
        &self.gate
    }

    /// A connection was established.
    pub(crate) fn connect_done(&self) {
        dec(&self.connects_left);
        self.disconnects_left.fetch_add(1, Ordering::AcqRel);
    }

    /// A connection failed before establishment.
    pub(crate) fn connect_failed(&self) {
        dec(&self.connects_left);
    }

    /// An established connection went away.
    pub(crate) fn disconnect_done(&self) {
        dec(&self.disconnects_left);
    }
}

fn dec(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let ctx = BenchContext::new(2);
        ctx.connect_done();
        ctx.connect_failed();
        assert_eq!((ctx.connects_left(), ctx.disconnects_left()), (0, 1));
        ctx.connect_failed();
        assert_eq!(ctx.connects_left(), 0);
        ctx.disconnect_done();
        ctx.disconnect_done();
        assert_eq!(ctx.disconnects_left(), 0);
        assert!(!ctx.gate().is_open());
    }
}
