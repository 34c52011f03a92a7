// Copyright (C) 2025 Fetchgate Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Concurrency Gate (C3): a resizable counting semaphore bounding outbound
// requests, FIFO-fair under contention (§4.3).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};

use crate::error::FetchError;
use crate::normalize::CancellationHandle;

/// Bounds outbound requests to `N` permits; `resize` adjusts `N` live
/// without disturbing requests already holding a permit.
///
/// Resizing down is implemented as debt: if `M < N`, the next `N - M`
/// releases are absorbed instead of returning a permit to the pool, so a
/// caller can never observe more than the newest `M` permits outstanding
/// (§4.3, §8 invariant 6).
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    permits: AtomicUsize,
    shrink_debt: Arc<AtomicUsize>,
}

/// A permit plus an idempotent release path. Ownership of the release
/// obligation can be transferred to a streaming/buffering strategy via
/// [`Permit::into_owned_release`]; "exactly once" is enforced by
/// [`OwnedRelease`]'s internal `released` flag (§4.3, §9).
pub struct Permit {
    shrink_debt: Arc<AtomicUsize>,
    permit: PermitSlot,
}

impl ConcurrencyGate {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits: AtomicUsize::new(permits),
            shrink_debt: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// FIFO-fair acquire, cancellable via `signal` (§5).
    pub async fn acquire(
        self: &Arc<Self>,
        signal: Option<&CancellationHandle>,
    ) -> Result<Permit, FetchError> {
        let acquire_fut = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match signal {
            None => acquire_fut.await.map_err(acquire_error)?,
            Some(sig) => {
                tokio::select! {
                    res = acquire_fut => res.map_err(acquire_error)?,
                    _ = sig.cancelled() => return Err(FetchError::Aborted),
                }
            }
        };
        Ok(Permit {
            shrink_debt: Arc::clone(&self.shrink_debt),
            permit: PermitSlot(Some(permit)),
        })
    }

    /// Adjusts the permit count live. Growing adds permits immediately;
    /// shrinking increases "debt" so the next `old - new` releases don't
    /// return a permit to the pool (§4.3).
    pub fn resize(&self, new_permits: usize) {
        let old = self.permits.swap(new_permits, Ordering::AcqRel);
        if new_permits > old {
            self.semaphore.add_permits(new_permits - old);
        } else if new_permits < old {
            self.shrink_debt
                .fetch_add(old - new_permits, Ordering::AcqRel);
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn total_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }
}

fn acquire_error(_: AcquireError) -> FetchError {
    // The semaphore is never explicitly closed in this crate, so this path
    // is unreachable in practice; kept for exhaustiveness.
    FetchError::Transport("concurrency gate closed".into())
}

impl Permit {
    /// Releases this permit, paying down any outstanding shrink debt first
    /// (§4.3). Equivalent to letting the `Permit` drop; kept for callers
    /// that want the release point to be explicit.
    pub fn release_now(self) {
        drop(self);
    }

    /// Hands off the release obligation to a strategy that owns a response
    /// body. The returned [`OwnedRelease`] guarantees exactly-once release
    /// even if both `on_body_end` and `on_body_error` fire (§4.3, §9).
    pub fn into_owned_release(mut self) -> OwnedRelease {
        let permit = self.permit.take_permit();
        OwnedRelease {
            permit: Arc::new(std::sync::Mutex::new(Some(permit))),
            released: Arc::new(AtomicBool::new(false)),
            shrink_debt: Arc::clone(&self.shrink_debt),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take_permit() {
            pay_debt_or_release(permit, &self.shrink_debt);
        }
    }
}

/// Wraps the raw permit so [`Permit::into_owned_release`] can move it out
/// without fighting `Drop`.
struct PermitSlot(Option<tokio::sync::OwnedSemaphorePermit>);

impl PermitSlot {
    fn take_permit(&mut self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.0.take()
    }
}

fn pay_debt_or_release(permit: tokio::sync::OwnedSemaphorePermit, shrink_debt: &AtomicUsize) {
    if shrink_debt
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
            if d > 0 { Some(d - 1) } else { None }
        })
        .is_ok()
    {
        permit.forget();
    } else {
        drop(permit);
    }
}

/// Idempotent release wrapper: the first call to [`OwnedRelease::release`]
/// (from any clone) releases the permit; subsequent calls are no-ops. This
/// is the "one-shot latch guarding a single release call" of the design
/// notes (§9).
#[derive(Clone)]
pub struct OwnedRelease {
    permit: Arc<std::sync::Mutex<Option<tokio::sync::OwnedSemaphorePermit>>>,
    released: Arc<AtomicBool>,
    shrink_debt: Arc<AtomicUsize>,
}

impl OwnedRelease {
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Releasing returns the permit to the semaphore, unless a
            // resize has left shrink debt, in which case it pays down the
            // debt instead (§4.3).
            let mut slot = self.permit.lock().unwrap();
            if let Some(permit) = slot.take() {
                pay_debt_or_release(permit, &self.shrink_debt);
            }
        } else {
            tracing::debug!("ignored double-release on concurrency gate permit");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_then_release_frees_the_permit() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let permit = gate.acquire(None).await.unwrap();
        assert_eq!(gate.available_permits(), 0);
        drop(permit);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn owned_release_is_idempotent() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let permit = gate.acquire(None).await.unwrap();
        let release = permit.into_owned_release();
        release.release();
        release.release();
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn resize_up_grants_new_acquirers() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let _p1 = gate.acquire(None).await.unwrap();
        gate.resize(2);
        let p2 = gate.acquire(None).await.unwrap();
        assert_eq!(gate.available_permits(), 0);
        drop(p2);
    }

    #[tokio::test]
    async fn resize_down_does_not_exceed_new_cap() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        let p1 = gate.acquire(None).await.unwrap();
        let p2 = gate.acquire(None).await.unwrap();
        gate.resize(1);
        // Both releases pay down the shrink debt; neither should hand out a
        // permit until debt is paid off.
        let r1 = p1.into_owned_release();
        r1.release();
        assert_eq!(
            gate.available_permits(),
            0,
            "first release after shrink pays debt, grants nothing"
        );
        drop(p2);
        assert_eq!(gate.available_permits(), 1, "cap is now 1");
    }

    #[tokio::test]
    async fn cancellation_signal_aborts_acquire() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let _held = gate.acquire(None).await.unwrap();
        let signal = CancellationHandle::new();
        let sig2 = signal.clone();
        let gate2 = Arc::clone(&gate);
        let waiter = tokio::spawn(async move { gate2.acquire(Some(&sig2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FetchError::Aborted)));
    }
}
