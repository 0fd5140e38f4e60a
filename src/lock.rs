use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::{thread_rng, Rng};
use redis::{Client, IntoConnectionInfo, Script};
use tracing::{debug, warn};

use crate::error::LockError;
use crate::handle::LockHandle;
use crate::options::LockOptions;
use crate::scripts;
use crate::token::generate_token;

/// One or more resource identifiers locked as a unit.
///
/// A set is acquired, extended, and released atomically on each
/// server: the whole key vector travels in a single script
/// invocation, so no server ever exposes a partially locked set.
#[derive(Debug, Clone)]
pub enum Resources {
    /// A single resource key.
    Single(String),
    /// A set of resource keys. The caller's order is preserved here
    /// for messages; operations run on the canonicalized form.
    Many(Vec<String>),
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resources::Single(key) => f.write_str(key),
            Resources::Many(keys) => write!(f, "[{}]", keys.join(", ")),
        }
    }
}

impl From<&str> for Resources {
    fn from(key: &str) -> Resources {
        Resources::Single(key.to_owned())
    }
}

impl From<String> for Resources {
    fn from(key: String) -> Resources {
        Resources::Single(key)
    }
}

impl From<Vec<String>> for Resources {
    fn from(keys: Vec<String>) -> Resources {
        Resources::Many(keys)
    }
}

impl From<Vec<&str>> for Resources {
    fn from(keys: Vec<&str>) -> Resources {
        Resources::Many(keys.into_iter().map(str::to_owned).collect())
    }
}

impl From<&[&str]> for Resources {
    fn from(keys: &[&str]) -> Resources {
        Resources::Many(keys.iter().map(|key| (*key).to_owned()).collect())
    }
}

/// Validate and canonicalize the requested keys: every key must be
/// non-empty and not whitespace-only; the result is sorted ascending
/// with duplicates removed.
fn canonicalize_keys(resources: &Resources) -> Result<Vec<String>, LockError> {
    let requested: &[String] = match resources {
        Resources::Single(key) => std::slice::from_ref(key),
        Resources::Many(keys) => keys,
    };
    if requested.is_empty() {
        return Err(LockError::InvalidParameter(
            "at least one resource key is required".into(),
        ));
    }
    for key in requested {
        if key.trim().is_empty() {
            return Err(LockError::InvalidParameter(
                "resource keys must be non-empty, non-whitespace strings".into(),
            ));
        }
    }

    let mut keys = requested.to_vec();
    keys.sort();
    let mut duplicates: Vec<String> = Vec::new();
    keys.dedup_by(|next, kept| {
        if next == kept {
            if duplicates.last() != Some(next) {
                duplicates.push(next.clone());
            }
            true
        } else {
            false
        }
    });
    if !duplicates.is_empty() {
        warn!(
            removed = ?duplicates,
            "duplicate resource keys removed from lock request"
        );
    }
    Ok(keys)
}

/// Express a TTL in whole milliseconds, refusing zero and values that
/// overflow the wire format.
pub(crate) fn ttl_millis(ttl: Duration) -> Result<u64, LockError> {
    let ms = ttl.as_millis();
    if ms == 0 {
        return Err(LockError::InvalidParameter(
            "TTL must be a positive number of milliseconds".into(),
        ));
    }
    u64::try_from(ms)
        .map_err(|_| LockError::InvalidParameter("TTL exceeds the supported range".into()))
}

/// Outcome of a single quorum round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptVerdict {
    /// Quorum reached with time to spare; the lock may be treated as
    /// held for `validity_ms`.
    Granted { validity_ms: u64 },
    /// Insufficient consensus: fewer than quorum servers said yes.
    NoQuorum,
    /// Timing constraint violated: the grants propagated too slowly
    /// to leave a usable validity window after drift correction.
    OutOfTime,
}

/// Decide a single round from the success count and the timing
/// budget. The validity is `ttl - elapsed - round(drift_factor * ttl)`
/// and must exceed one millisecond for the round to count.
fn evaluate_attempt(
    success_count: usize,
    quorum: usize,
    ttl_ms: u64,
    elapsed_ms: u128,
    drift_factor: f64,
) -> AttemptVerdict {
    if success_count < quorum {
        return AttemptVerdict::NoQuorum;
    }
    let drift_ms = (drift_factor * ttl_ms as f64).round() as i128;
    let validity = ttl_ms as i128 - elapsed_ms as i128 - drift_ms;
    if validity <= 1 {
        return AttemptVerdict::OutOfTime;
    }
    AttemptVerdict::Granted {
        validity_ms: validity as u64,
    }
}

/// The lock manager.
///
/// Fans every operation out to all servers concurrently and treats a
/// lock as held only when a strict majority (`N / 2 + 1`) granted it
/// quickly enough to leave a positive validity window after
/// clock-drift correction.
#[derive(Debug, Clone)]
pub struct LockManager {
    servers: Vec<Client>,
    quorum: usize,
    options: LockOptions,
}

impl LockManager {
    /// Create a manager for the given server URIs with default
    /// options.
    ///
    /// Sample URI: `"redis://127.0.0.1:6379"`
    pub fn new<T: IntoConnectionInfo>(uris: Vec<T>) -> Result<LockManager, LockError> {
        Self::with_options(uris, LockOptions::default())
    }

    /// Create a manager for the given server URIs with explicit
    /// options.
    pub fn with_options<T: IntoConnectionInfo>(
        uris: Vec<T>,
        options: LockOptions,
    ) -> Result<LockManager, LockError> {
        let servers = uris
            .into_iter()
            .map(|uri| {
                Client::open(uri)
                    .map_err(|error| LockError::InvalidParameter(format!("invalid server URI: {error}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_clients(servers, options)
    }

    /// Build a manager over prebuilt clients. The quorum is derived
    /// as `N / 2 + 1` and fixed for the manager's lifetime.
    pub fn from_clients(
        servers: Vec<Client>,
        options: LockOptions,
    ) -> Result<LockManager, LockError> {
        if servers.is_empty() {
            return Err(LockError::InvalidParameter(
                "at least one server is required".into(),
            ));
        }
        options.validate()?;
        let quorum = servers.len() / 2 + 1;
        Ok(LockManager {
            servers,
            quorum,
            options,
        })
    }

    /// Minimum number of servers that must grant an operation.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    async fn open_connection(
        client: &Client,
    ) -> Result<redis::aio::MultiplexedConnection, LockError> {
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(LockError::ServerScriptError)
    }

    async fn acquire_on_instance(
        client: &Client,
        keys: &[String],
        token: &str,
        ttl_ms: u64,
    ) -> Result<i64, LockError> {
        let mut con = Self::open_connection(client).await?;
        let script = Script::new(scripts::ACQUIRE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(token).arg(ttl_ms);
        invocation
            .invoke_async(&mut con)
            .await
            .map_err(LockError::ServerScriptError)
    }

    async fn release_on_instance(
        client: &Client,
        keys: &[String],
        token: &str,
    ) -> Result<i64, LockError> {
        let mut con = Self::open_connection(client).await?;
        let script = Script::new(scripts::RELEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(token);
        invocation
            .invoke_async(&mut con)
            .await
            .map_err(LockError::ServerScriptError)
    }

    async fn extend_on_instance(
        client: &Client,
        keys: &[String],
        token: &str,
        ttl_ms: u64,
    ) -> Result<i64, LockError> {
        let mut con = Self::open_connection(client).await?;
        let script = Script::new(scripts::EXTEND_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(token).arg(ttl_ms);
        invocation
            .invoke_async(&mut con)
            .await
            .map_err(LockError::ServerScriptError)
    }

    /// Try to acquire a lock over the given resource or resource set.
    ///
    /// Runs up to `1 + max_retry_attempts` quorum rounds with a fresh
    /// token per round; rounds that fail leave no partial grants
    /// behind. Returns `Ok(None)` when no round reached quorum with a
    /// usable validity window — contention is not an error.
    pub async fn acquire(
        &self,
        resources: impl Into<Resources>,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let resources = resources.into();
        let keys = canonicalize_keys(&resources)?;
        let ttl_ms = ttl_millis(ttl)?;

        for attempt in 0..=self.options.max_retry_attempts {
            let token = generate_token(self.options.token_length)?;
            let start = Instant::now();
            let replies = join_all(
                self.servers
                    .iter()
                    .map(|client| Self::acquire_on_instance(client, &keys, &token, ttl_ms)),
            )
            .await;
            let elapsed_ms = start.elapsed().as_millis();

            for error in replies.iter().filter_map(|reply| reply.as_ref().err()) {
                debug!(error = %error, "server failed during acquire; counted as refusal");
            }
            let success_count = replies.iter().flatten().filter(|reply| **reply == 1).count();

            match evaluate_attempt(
                success_count,
                self.quorum,
                ttl_ms,
                elapsed_ms,
                self.options.drift_factor,
            ) {
                AttemptVerdict::Granted { validity_ms } => {
                    debug!(resources = %resources, attempt, validity_ms, "lock granted");
                    return Ok(Some(LockHandle::new(
                        self.clone(),
                        keys,
                        token,
                        ttl,
                        Duration::from_millis(validity_ms),
                    )));
                }
                AttemptVerdict::NoQuorum => {
                    debug!(
                        resources = %resources,
                        attempt,
                        success_count,
                        quorum = self.quorum,
                        "insufficient consensus; undoing partial grants"
                    );
                }
                AttemptVerdict::OutOfTime => {
                    debug!(
                        resources = %resources,
                        attempt,
                        elapsed_ms,
                        "timing constraint violated; undoing partial grants"
                    );
                }
            }
            let _ = self.release_keys(&keys, &token).await;

            if attempt < self.options.max_retry_attempts {
                tokio::time::sleep(self.retry_pause()).await;
            }
        }

        Ok(None)
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = self.options.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            thread_rng().gen_range(0..=jitter_ms)
        };
        self.options.retry_delay + Duration::from_millis(jitter)
    }

    /// Best-effort release fan-out.
    ///
    /// True when at least one server reported a deletion. A stricter
    /// criterion would spuriously report failure once keys have
    /// expired on some servers, so per-server failures and misses are
    /// tolerated.
    pub(crate) async fn release_keys(&self, keys: &[String], token: &str) -> bool {
        let replies = join_all(
            self.servers
                .iter()
                .map(|client| Self::release_on_instance(client, keys, token)),
        )
        .await;
        for error in replies.iter().filter_map(|reply| reply.as_ref().err()) {
            debug!(error = %error, "server failed during release; counted as refusal");
        }
        replies.into_iter().flatten().any(|removed| removed >= 1)
    }

    /// Quorum extend fan-out.
    ///
    /// True only when at least `quorum` servers re-armed the expiry
    /// of every key: a handle without a majority is no longer safe to
    /// rely on. When every server failed at the transport level the
    /// last failure is surfaced instead of a clean refusal.
    pub(crate) async fn extend_keys(
        &self,
        keys: &[String],
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, LockError> {
        let mut replies = join_all(
            self.servers
                .iter()
                .map(|client| Self::extend_on_instance(client, keys, token, ttl_ms)),
        )
        .await;
        for error in replies.iter().filter_map(|reply| reply.as_ref().err()) {
            debug!(error = %error, "server failed during extend; counted as refusal");
        }
        let success_count = replies.iter().flatten().filter(|reply| **reply == 1).count();
        if success_count >= self.quorum {
            return Ok(true);
        }
        if replies.iter().all(Result::is_err) {
            if let Some(Err(error)) = replies.pop() {
                return Err(error);
            }
        }
        Ok(false)
    }

    /// Run `routine` inside a scoped critical section over the given
    /// resources.
    ///
    /// Acquisition failure is promoted to
    /// [`LockError::LockAcquisitionFailed`] so the critical section
    /// can never run without the lock. When `extension_threshold` is
    /// supplied the lock is kept alive by the background scheduler
    /// for as long as the routine runs. The lock is released on every
    /// exit path — including cancellation of the returned future —
    /// and release failures are logged and swallowed so they cannot
    /// mask the routine's own outcome.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resources: impl Into<Resources>,
        ttl: Duration,
        extension_threshold: Option<Duration>,
        routine: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(threshold) = extension_threshold {
            if threshold.is_zero() {
                return Err(LockError::InvalidParameter(
                    "auto-extension threshold must be a positive duration".into(),
                ));
            }
        }

        let resources = resources.into();
        let handle = self
            .acquire(resources.clone(), ttl)
            .await?
            .ok_or_else(|| LockError::LockAcquisitionFailed(resources.to_string()))?;

        let guard = ReleaseGuard::arm(handle.clone());
        if let Some(threshold) = extension_threshold {
            handle.start_auto_extension(Some(threshold))?;
        }

        let output = routine(handle).await;
        guard.finish().await;

        Ok(output)
    }
}

/// Releases the guarded handle exactly once: inline on the normal
/// path, or from `Drop` via a spawned task when the scoped section is
/// cancelled or unwinds mid-routine.
struct ReleaseGuard {
    handle: Option<LockHandle>,
}

impl ReleaseGuard {
    fn arm(handle: LockHandle) -> ReleaseGuard {
        ReleaseGuard {
            handle: Some(handle),
        }
    }

    async fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop_auto_extension();
            if !handle.release().await {
                debug!(
                    keys = ?handle.resource_keys(),
                    "scoped release reported no deletions"
                );
            }
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop_auto_extension();
            tokio::spawn(async move {
                let _ = handle.release().await;
            });
        }
    }
}
