//! Pipeline wake-up machinery.
//!
//! The reader and the copy worker hand the two ping-pong slots back and
//! forth through an explicit state machine guarded by one mutex. Every wait
//! observes the shutdown and failure state, so a session tearing down (or a
//! failed read) releases all parties instead of stranding them mid-wait.

use std::sync::{Condvar, Mutex};

use tessera_error::{tessera_err, TesseraResult};

/// Lifecycle of one ping-pong slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Free; the reader may post the next read on it.
    Empty,
    /// An asynchronous read is in flight.
    Filling,
    /// The read settled; the native buffers await the copy worker.
    Ready,
    /// The copy worker is reordering out of it.
    Consuming,
}

#[derive(Debug)]
pub struct PipeState {
    pub phases: [SlotPhase; 2],
    /// The copy worker parked after an overflow, awaiting larger buffers.
    pub suspended: bool,
    /// Bumped on every suspension. Lets the caller tell a fresh overflow
    /// apart from one it already reported.
    pub suspend_epoch: u64,
    /// A resume was requested by the caller and not yet consumed.
    pub resume_pending: bool,
    /// Set once on the first unrecoverable read failure.
    pub failed: Option<String>,
    /// Set when the session is torn down.
    pub shutdown: bool,
}

/// The single gate all pipeline parties synchronize through.
pub struct PipeGate {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl Default for PipeGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(PipeState {
                phases: [SlotPhase::Empty; 2],
                suspended: false,
                suspend_epoch: 0,
                resume_pending: false,
                failed: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }
}

impl PipeGate {
    /// Mutate the state and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut PipeState) -> R) -> R {
        let mut state = self.lock();
        let out = f(&mut state);
        self.cond.notify_all();
        out
    }

    /// Read the state without waking anyone.
    pub fn inspect<R>(&self, f: impl FnOnce(&PipeState) -> R) -> R {
        f(&self.lock())
    }

    /// Block until `pred` yields a value.
    ///
    /// Bails out with `Shutdown` when the session is being destroyed and
    /// with `Io` when a read failure has been recorded; the predicate never
    /// observes either state.
    pub fn wait_until<R>(
        &self,
        mut pred: impl FnMut(&mut PipeState) -> Option<R>,
    ) -> TesseraResult<R> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(tessera_err!(Shutdown: "session is shutting down"));
            }
            if let Some(msg) = &state.failed {
                return Err(tessera_err!(Io: "{}", msg));
            }
            if let Some(out) = pred(&mut state) {
                // Predicates may mutate the state (e.g. consuming a resume
                // request); wake the other parties so they observe it.
                self.cond.notify_all();
                return Ok(out);
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // A panicking peer already tore the pipeline; the shutdown and
            // failed flags still let every waiter exit.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_error::TesseraError;

    use super::*;

    #[test]
    fn wait_observes_updates_from_another_thread() {
        let gate = Arc::new(PipeGate::default());
        let waiter = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            waiter.wait_until(|s| (s.phases[1] == SlotPhase::Ready).then_some(()))
        });
        gate.update(|s| s.phases[1] = SlotPhase::Ready);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn shutdown_releases_waiters() {
        let gate = Arc::new(PipeGate::default());
        let waiter = Arc::clone(&gate);
        let handle =
            std::thread::spawn(move || waiter.wait_until(|_| None::<()>));
        gate.update(|s| s.shutdown = true);
        assert!(matches!(
            handle.join().unwrap(),
            Err(TesseraError::Shutdown(_))
        ));
    }

    #[test]
    fn failure_is_surfaced_to_waiters() {
        let gate = PipeGate::default();
        gate.update(|s| s.failed = Some("device gone".to_string()));
        assert!(matches!(
            gate.wait_until(|_| None::<()>),
            Err(TesseraError::Io(_))
        ));
    }
}
