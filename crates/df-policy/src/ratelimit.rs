//! Rate limiting per resource class (`llm_call`, `llm_tokens`, ...).
//!
//! Each class owns a fair semaphore of `count` units. A unit taken by a call
//! returns to the pool at `max(call end, admission + period)`, so a class
//! never has more than `count` calls in flight and never admits more than
//! `count` units inside any window of `period`. Waiters are admitted FIFO.
//! Only the waiting task is suspended.

use crate::PolicyError;
use df_core::policy::RateLimitSpec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
struct ClassLimiter {
    name: String,
    spec: RateLimitSpec,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Shared limiter holding one bucket per configured resource class.
#[derive(Debug, Default, Clone)]
pub struct RateLimiter {
    classes: HashMap<String, Arc<ClassLimiter>>,
}

impl RateLimiter {
    pub fn new(limits: &std::collections::BTreeMap<String, RateLimitSpec>) -> Self {
        let classes = limits
            .iter()
            .filter(|(_, spec)| spec.count > 0)
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Arc::new(ClassLimiter {
                        name: name.clone(),
                        spec: *spec,
                        semaphore: Arc::new(Semaphore::new(spec.count as usize)),
                        in_flight: AtomicUsize::new(0),
                        peak: AtomicUsize::new(0),
                    }),
                )
            })
            .collect();
        Self { classes }
    }

    /// A limiter that admits everything immediately.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Wait for one unit of `class`.
    pub async fn acquire(&self, class: &str) -> Result<RatePermit, PolicyError> {
        self.acquire_units(class, 1).await
    }

    /// Wait for `units` of `class` (e.g. an estimated token count).
    /// Requests larger than the class capacity are clamped to it.
    pub async fn acquire_units(&self, class: &str, units: u32) -> Result<RatePermit, PolicyError> {
        let Some(limiter) = self.classes.get(class) else {
            return Ok(RatePermit::unlimited());
        };
        let units = units.clamp(1, limiter.spec.count);
        let permit = Arc::clone(&limiter.semaphore)
            .acquire_many_owned(units)
            .await
            .map_err(|_| PolicyError::LimiterClosed(limiter.name.clone()))?;

        let now_in_flight = limiter.in_flight.fetch_add(units as usize, Ordering::SeqCst)
            + units as usize;
        limiter.peak.fetch_max(now_in_flight, Ordering::SeqCst);
        tracing::trace!(class = %limiter.name, units, in_flight = now_in_flight, "rate permit admitted");

        Ok(RatePermit {
            permit: Some(permit),
            units: units as usize,
            release_at: Instant::now() + limiter.spec.period(),
            class: Some(Arc::clone(limiter)),
        })
    }

    /// Units currently held by running calls.
    pub fn in_flight(&self, class: &str) -> usize {
        self.classes
            .get(class)
            .map(|l| l.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Highest `in_flight` observed since creation.
    pub fn peak_in_flight(&self, class: &str) -> usize {
        self.classes
            .get(class)
            .map(|l| l.peak.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Admission ticket. Dropping it ends the call; the unit itself is returned
/// to the pool once the admission window has elapsed.
#[derive(Debug)]
pub struct RatePermit {
    permit: Option<OwnedSemaphorePermit>,
    units: usize,
    release_at: Instant,
    class: Option<Arc<ClassLimiter>>,
}

impl RatePermit {
    fn unlimited() -> Self {
        Self {
            permit: None,
            units: 0,
            release_at: Instant::now(),
            class: None,
        }
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(class) = self.class.take() {
            class.in_flight.fetch_sub(self.units, Ordering::SeqCst);
        }
        let Some(permit) = self.permit.take() else {
            return;
        };
        if Instant::now() >= self.release_at {
            return;
        }
        let release_at = self.release_at;
        // Outside a runtime the unit is returned immediately.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep_until(release_at).await;
                drop(permit);
            });
        }
    }
}
