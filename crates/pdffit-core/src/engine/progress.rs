use super::error::FitError;
use std::time::{Duration, Instant};

/// Receives a notification after every refinement step.
///
/// `step` counts from 1; `converged` is the value the step returned. An
/// `Err` stops the refinement loop and is handed back to the caller
/// unchanged, which is how an observer cancels a running fit.
pub trait StepObserver<S: ?Sized> {
    fn on_step(&mut self, session: &S, step: usize, converged: bool) -> Result<(), FitError>;
}

impl<S: ?Sized, F> StepObserver<S> for F
where
    F: FnMut(&S, usize, bool) -> Result<(), FitError>,
{
    fn on_step(&mut self, session: &S, step: usize, converged: bool) -> Result<(), FitError> {
        self(session, step, converged)
    }
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<S: ?Sized> StepObserver<S> for NoopObserver {
    fn on_step(&mut self, _session: &S, _step: usize, _converged: bool) -> Result<(), FitError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Drop notifications arriving sooner than the interval.
    Skip,
    /// Block inside the observer until the interval has passed.
    Wait,
}

/// Rate-limits the notifications reaching `inner`. The final, converged
/// notification is always delivered.
#[derive(Debug)]
pub struct Throttled<O> {
    inner: O,
    interval: Duration,
    pacing: Pacing,
    last: Option<Instant>,
}

impl<O> Throttled<O> {
    pub fn skipping(inner: O, interval: Duration) -> Self {
        Self::new(inner, interval, Pacing::Skip)
    }

    pub fn waiting(inner: O, interval: Duration) -> Self {
        Self::new(inner, interval, Pacing::Wait)
    }

    pub fn new(inner: O, interval: Duration, pacing: Pacing) -> Self {
        Self {
            inner,
            interval,
            pacing,
            last: None,
        }
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<S: ?Sized, O: StepObserver<S>> StepObserver<S> for Throttled<O> {
    fn on_step(&mut self, session: &S, step: usize, converged: bool) -> Result<(), FitError> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                match self.pacing {
                    Pacing::Skip if !converged => return Ok(()),
                    Pacing::Skip => {}
                    Pacing::Wait => std::thread::sleep(self.interval - elapsed),
                }
            }
        }
        self.last = Some(Instant::now());
        self.inner.on_step(session, step, converged)
    }
}
