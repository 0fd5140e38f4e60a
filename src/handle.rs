use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::lock::{ttl_millis, LockManager};

/// Renewal threshold applied when the caller does not supply one.
const DEFAULT_EXTENSION_THRESHOLD: Duration = Duration::from_millis(1000);

/// Phases of the background renewal scheduler. At most one timer is
/// pending per handle, and `Running` excludes any other pending
/// timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewalPhase {
    Idle,
    Scheduled,
    Running,
    Stopped,
}

#[derive(Debug)]
struct HandleState {
    expires_at: Instant,
    released: bool,
    renewal: RenewalPhase,
    renewal_threshold: Duration,
    renewal_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct HandleInner {
    manager: LockManager,
    keys: Vec<String>,
    token: String,
    ttl: Duration,
    state: Mutex<HandleState>,
}

/// A single held acquisition.
///
/// Clones share one state cell, so a clone handed to a critical
/// section observes releases and extensions made through any other
/// clone. The ownership token is immutable for the life of the
/// handle; once released, a handle never becomes held again.
#[derive(Debug, Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

impl LockHandle {
    pub(crate) fn new(
        manager: LockManager,
        keys: Vec<String>,
        token: String,
        ttl: Duration,
        validity: Duration,
    ) -> LockHandle {
        LockHandle {
            inner: Arc::new(HandleInner {
                manager,
                keys,
                token,
                ttl,
                state: Mutex::new(HandleState {
                    expires_at: Instant::now() + validity,
                    released: false,
                    renewal: RenewalPhase::Idle,
                    renewal_threshold: DEFAULT_EXTENSION_THRESHOLD,
                    renewal_task: None,
                }),
            }),
        }
    }

    /// The canonicalized resource keys this handle covers.
    pub fn resource_keys(&self) -> &[String] {
        &self.inner.keys
    }

    /// Instant at which the handle considers itself expired locally.
    pub fn expiration_instant(&self) -> Instant {
        self.inner.state.lock().expires_at
    }

    /// Whether the lock has been released. Monotonic.
    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }

    /// Whether the local validity window has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.inner.state.lock().expires_at
    }

    /// Neither released nor expired.
    pub fn is_valid(&self) -> bool {
        let state = self.inner.state.lock();
        !state.released && Instant::now() <= state.expires_at
    }

    /// Time left before local expiry; zero once expired.
    pub fn remaining_validity(&self) -> Duration {
        self.inner
            .state
            .lock()
            .expires_at
            .saturating_duration_since(Instant::now())
    }

    /// Release the lock on all servers.
    ///
    /// Idempotent: the first call flips the released flag, cancels
    /// any pending renewal, and fans the release out; later calls
    /// return `true` without touching the servers. Per-server
    /// failures are demoted, so this never raises.
    pub async fn release(&self) -> bool {
        let stale_task = {
            let mut state = self.inner.state.lock();
            if state.released {
                return true;
            }
            state.released = true;
            state.renewal = RenewalPhase::Stopped;
            state.renewal_task.take()
        };
        if let Some(task) = stale_task {
            task.abort();
        }
        self.inner
            .manager
            .release_keys(&self.inner.keys, &self.inner.token)
            .await
    }

    /// Extend the lock to `new_ttl`, or to the original TTL when
    /// `None`.
    ///
    /// Extension requires quorum. `Ok(true)` advances the local
    /// expiry to `now + new_ttl`; `Ok(false)` means the majority was
    /// lost and leaves the expiry untouched. A released handle is
    /// refused, and a fan-out in which every server failed surfaces
    /// as [`LockError::LockExtensionFailed`].
    pub async fn extend(&self, new_ttl: Option<Duration>) -> Result<bool, LockError> {
        if self.is_released() {
            return Err(LockError::InvalidParameter(
                "cannot extend a released lock".into(),
            ));
        }
        let ttl = new_ttl.unwrap_or(self.inner.ttl);
        let ttl_ms = ttl_millis(ttl)?;

        match self
            .inner
            .manager
            .extend_keys(&self.inner.keys, &self.inner.token, ttl_ms)
            .await
        {
            Ok(true) => {
                self.inner.state.lock().expires_at = Instant::now() + ttl;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(error) => Err(LockError::LockExtensionFailed(Box::new(error))),
        }
    }

    /// Keep the lock alive from a background task.
    ///
    /// A single-shot timer is armed to fire `threshold` before the
    /// local expiry (one second when `None`; immediately when the
    /// expiry is already inside the threshold). Every successful
    /// renewal advances the expiry by the original TTL and re-arms
    /// the timer. A renewal that loses quorum or fails stops the
    /// scheduler with a warning and leaves the critical section
    /// running — callers observe the loss through
    /// [`is_valid`](LockHandle::is_valid).
    pub fn start_auto_extension(&self, threshold: Option<Duration>) -> Result<(), LockError> {
        let threshold = threshold.unwrap_or(DEFAULT_EXTENSION_THRESHOLD);
        if threshold.is_zero() {
            return Err(LockError::InvalidParameter(
                "auto-extension threshold must be a positive duration".into(),
            ));
        }

        let stale_task = {
            let mut state = self.inner.state.lock();
            if state.released {
                return Err(LockError::InvalidParameter(
                    "cannot auto-extend a released lock".into(),
                ));
            }
            state.renewal_threshold = threshold;
            state.renewal = RenewalPhase::Scheduled;
            let stale = state.renewal_task.take();
            let worker = self.clone();
            state.renewal_task = Some(tokio::spawn(async move { worker.renewal_loop().await }));
            stale
        };
        if let Some(task) = stale_task {
            task.abort();
        }
        Ok(())
    }

    /// Cancel any pending renewal. Implied by `release`.
    pub fn stop_auto_extension(&self) {
        let stale_task = {
            let mut state = self.inner.state.lock();
            state.renewal = RenewalPhase::Stopped;
            state.renewal_task.take()
        };
        if let Some(task) = stale_task {
            task.abort();
        }
    }

    async fn renewal_loop(self) {
        loop {
            let wait = {
                let state = self.inner.state.lock();
                if state.released || state.renewal == RenewalPhase::Stopped {
                    return;
                }
                state
                    .expires_at
                    .checked_sub(state.renewal_threshold)
                    .map(|fire_at| fire_at.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            {
                // The timer may have lost a race against release or
                // stop while it slept.
                let mut state = self.inner.state.lock();
                if state.released || state.renewal == RenewalPhase::Stopped {
                    return;
                }
                state.renewal = RenewalPhase::Running;
            }

            match self.extend(None).await {
                Ok(true) => {
                    debug!(keys = ?self.inner.keys, "lock renewed");
                    let mut state = self.inner.state.lock();
                    if state.renewal == RenewalPhase::Running {
                        state.renewal = RenewalPhase::Scheduled;
                    } else {
                        return;
                    }
                }
                Ok(false) => {
                    warn!(
                        keys = ?self.inner.keys,
                        "lock renewal lost quorum; auto-extension stopped"
                    );
                    self.inner.state.lock().renewal = RenewalPhase::Stopped;
                    return;
                }
                Err(error) => {
                    if self.is_released() {
                        // Benign race: released while the renewal was
                        // in flight.
                        return;
                    }
                    warn!(
                        keys = ?self.inner.keys,
                        error = %error,
                        "lock renewal failed; auto-extension stopped"
                    );
                    self.inner.state.lock().renewal = RenewalPhase::Stopped;
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn renewal_phase(&self) -> RenewalPhase {
        self.inner.state.lock().renewal
    }

    #[cfg(test)]
    fn has_renewal_task(&self) -> bool {
        self.inner.state.lock().renewal_task.is_some()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::options::LockOptions;

    use super::*;

    /// 127.0.0.1:1 has no listener; every connection attempt is
    /// refused immediately.
    fn unreachable_manager() -> LockManager {
        let options = LockOptions {
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(2),
            max_retry_attempts: 0,
            ..LockOptions::default()
        };
        LockManager::with_options(vec!["redis://127.0.0.1:1/"], options).unwrap()
    }

    fn held_handle(validity: Duration) -> LockHandle {
        LockHandle::new(
            unreachable_manager(),
            vec!["resource".to_string()],
            "aGVsZC1sb2NrLXRva2Vu00".to_string(),
            Duration::from_secs(1),
            validity,
        )
    }

    #[tokio::test]
    async fn fresh_handle_is_valid() {
        let lock = held_handle(Duration::from_secs(10));
        assert!(lock.is_valid());
        assert!(!lock.is_released());
        assert!(!lock.is_expired());
        assert_eq!(lock.resource_keys(), ["resource"]);
        assert!(lock.remaining_validity() > Duration::from_secs(9));
    }

    #[tokio::test]
    async fn handle_expires_locally() {
        let lock = held_handle(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lock.is_expired());
        assert!(!lock.is_valid());
        assert_eq!(lock.remaining_validity(), Duration::ZERO);
        // Expired is not released; nothing flipped the flag.
        assert!(!lock.is_released());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let lock = held_handle(Duration::from_secs(10));

        // No server is reachable, so the first release cannot report
        // a deletion.
        assert!(!lock.release().await);
        assert!(lock.is_released());
        assert!(!lock.is_valid());

        // The second call short-circuits without touching servers.
        assert!(lock.release().await);
        assert!(lock.is_released());
    }

    #[tokio::test]
    async fn clones_share_released_state() {
        let lock = held_handle(Duration::from_secs(10));
        let observer = lock.clone();

        lock.release().await;
        assert!(observer.is_released());
        assert!(observer.release().await);
    }

    #[tokio::test]
    async fn extend_refuses_released_handle() {
        let lock = held_handle(Duration::from_secs(10));
        lock.release().await;

        let result = lock.extend(None).await;
        assert!(matches!(result, Err(LockError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn extend_validates_ttl() {
        let lock = held_handle(Duration::from_secs(10));
        let result = lock.extend(Some(Duration::ZERO)).await;
        assert!(matches!(result, Err(LockError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn extend_surfaces_total_transport_failure() -> Result<()> {
        let lock = held_handle(Duration::from_millis(500));
        let expiry_before = lock.expiration_instant();

        let result = lock.extend(None).await;
        assert!(matches!(result, Err(LockError::LockExtensionFailed(_))));
        // A failed extension leaves the expiry untouched.
        assert_eq!(lock.expiration_instant(), expiry_before);

        Ok(())
    }

    #[tokio::test]
    async fn auto_extension_rejects_bad_inputs() {
        let lock = held_handle(Duration::from_secs(10));
        assert!(matches!(
            lock.start_auto_extension(Some(Duration::ZERO)),
            Err(LockError::InvalidParameter(_))
        ));

        lock.release().await;
        assert!(matches!(
            lock.start_auto_extension(None),
            Err(LockError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn auto_extension_stops_after_failed_renewal() {
        let lock = held_handle(Duration::from_millis(80));
        lock.start_auto_extension(Some(Duration::from_millis(40)))
            .unwrap();
        assert_eq!(lock.renewal_phase(), RenewalPhase::Scheduled);

        // The timer fires around the 40ms mark; the renewal cannot
        // reach any server and must shut the scheduler down without
        // releasing the lock.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(lock.renewal_phase(), RenewalPhase::Stopped);
        assert!(!lock.is_released());
    }

    #[tokio::test]
    async fn auto_extension_fires_immediately_inside_threshold() {
        let lock = held_handle(Duration::from_millis(50));
        lock.start_auto_extension(Some(Duration::from_secs(10)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(lock.renewal_phase(), RenewalPhase::Stopped);
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_timer() {
        let lock = held_handle(Duration::from_secs(60));
        lock.start_auto_extension(Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(lock.renewal_phase(), RenewalPhase::Scheduled);
        assert!(lock.has_renewal_task());

        lock.stop_auto_extension();
        assert_eq!(lock.renewal_phase(), RenewalPhase::Stopped);
        assert!(!lock.has_renewal_task());
    }

    #[tokio::test]
    async fn release_cancels_a_pending_timer() {
        let lock = held_handle(Duration::from_secs(60));
        lock.start_auto_extension(Some(Duration::from_secs(1)))
            .unwrap();

        lock.release().await;
        assert_eq!(lock.renewal_phase(), RenewalPhase::Stopped);
        assert!(!lock.has_renewal_task());
    }

    #[tokio::test]
    async fn restart_after_stop_rearms_the_timer() {
        let lock = held_handle(Duration::from_secs(60));
        lock.start_auto_extension(Some(Duration::from_secs(1)))
            .unwrap();
        lock.stop_auto_extension();

        lock.start_auto_extension(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(lock.renewal_phase(), RenewalPhase::Scheduled);
        assert!(lock.has_renewal_task());

        lock.stop_auto_extension();
    }
}
