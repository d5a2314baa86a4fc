//! Abortable start gate.
//!
//! A one-shot rendezvous: the last participant to arrive releases everyone.
//! Unlike `std::sync::Barrier`, a participant that cannot make it (setup
//! failure, spawn failure) aborts the gate so the others return an error
//! instead of waiting forever, and every wait is bounded by a timeout.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug)]
enum Phase {
    Waiting(usize),
    Open,
    Aborted(String),
}

pub struct StartGate {
    parties: usize,
    timeout: Duration,
    phase: Mutex<Phase>,
    cv: Condvar,
}

impl StartGate {
    pub fn new(parties: usize, timeout: Duration) -> Self {
        Self {
            parties,
            timeout,
            phase: Mutex::new(Phase::Waiting(0)),
            cv: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arrive and wait until every party has arrived.
    ///
    /// Fails if the gate is aborted or the timeout expires first. A timeout
    /// aborts the gate for everyone.
    pub fn arrive(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut phase = self.lock();
        match &mut *phase {
            Phase::Waiting(n) => {
                *n += 1;
                if *n == self.parties {
                    *phase = Phase::Open;
                    self.cv.notify_all();
                    return Ok(());
                }
            }
            Phase::Open => return Ok(()),
            Phase::Aborted(reason) => return Err(Error::GateAborted(reason.clone())),
        }
        loop {
            match &*phase {
                Phase::Open => return Ok(()),
                Phase::Aborted(reason) => return Err(Error::GateAborted(reason.clone())),
                Phase::Waiting(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                *phase = Phase::Aborted(format!("timed out after {:?}", self.timeout));
                self.cv.notify_all();
                return Err(Error::GateTimeout(self.timeout));
            }
            phase = self
                .cv
                .wait_timeout(phase, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Release every waiter with an error. No effect once the gate is open.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut phase = self.lock();
        if let Phase::Waiting(_) = *phase {
            *phase = Phase::Aborted(reason.into());
            self.cv.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), Phase::Open)
    }
}
