//! Bucketed request rate limiter.
//!
//! Outbound work is queued per rate-limit bucket and drained by one flush
//! task per bucket, so distinct buckets never block each other while calls
//! within a bucket stay strictly ordered. The limiter learns quotas from the
//! classification of each raw result: per-bucket counters, late-discovered
//! group aliases (two keys sharing one underlying quota), and an
//! application-wide cooldown that overrides every bucket.
//!
//! Throttled attempts are never surfaced: the item is re-queued at the tail
//! of its own bucket and retried after the advertised reset. There is
//! deliberately no retry cap, so a bucket that is throttled forever stalls
//! its queue forever and the caller's future simply stays pending. Callers
//! that need a bound should race the returned future against their own
//! deadline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::iter::once;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fixed margin added beyond every advertised reset instant to absorb clock
/// skew between this host and the server.
const RESET_MARGIN: Duration = Duration::from_secs(2);

/// Optimistic allowance for buckets that have not reported limits yet.
const DEFAULT_REMAINING: i64 = 999;

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

/// Rate-limit information extracted from one raw result.
///
/// Absent fields leave the previously-known values untouched.
#[derive(Debug, Clone, Default)]
pub struct LimitInfo {
    /// True when the request unexpectedly hit the limit and must be retried.
    pub was_limited: bool,
    /// Calls remaining before the bucket is exhausted.
    pub remaining: Option<i64>,
    /// Instant at which `remaining` replenishes.
    pub reset_at: Option<SystemTime>,
    /// Instant at which an application-wide cooldown lifts, if one was
    /// signalled.
    pub global_reset: Option<SystemTime>,
    /// Shared quota group this bucket was revealed to belong to, if any.
    pub group: Option<String>,
}

/// Error returned when a queued item can no longer complete.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The flush task dropped the work item without resolving it; this only
    /// happens when the runtime is shutting down.
    #[error("dispatcher dropped the queued work item")]
    Abandoned,
}

// ----------------------------------------------------------------------------
// Internal State
// ----------------------------------------------------------------------------

type Execute<T> = Box<dyn Fn() -> Pin<Box<dyn Future<Output = T> + Send>> + Send + Sync>;
type Classify<T> = Box<dyn Fn(&T) -> LimitInfo + Send + Sync>;

struct Queued<T> {
    execute: Execute<T>,
    classify: Classify<T>,
    complete: oneshot::Sender<T>,
}

/// Quota accounting for one bucket (or one shared group record).
#[derive(Debug, Clone, Copy)]
struct Bucket {
    remaining: i64,
    reset_at: SystemTime,
}

impl Bucket {
    fn fresh() -> Self {
        Self {
            remaining: DEFAULT_REMAINING,
            reset_at: SystemTime::now(),
        }
    }

    /// Time left on this bucket's cooldown, if it is exhausted.
    fn cooldown(&self, now: SystemTime) -> Option<Duration> {
        if self.remaining <= 0 {
            self.reset_at.duration_since(now).ok()
        } else {
            None
        }
    }
}

struct LimiterState<T> {
    /// Bucket records, including shared group records, created lazily.
    buckets: HashMap<String, Bucket>,
    /// FIFO queue of pending work per bucket key.
    queues: HashMap<String, VecDeque<Queued<T>>>,
    /// Bucket keys with a flush task currently running.
    flushing: HashSet<String>,
    /// Late-discovered aliases from bucket key to shared group key.
    groups: HashMap<String, String>,
    /// Application-wide cooldown; raised by max-merge, cleared after being
    /// waited out.
    global_reset: Option<SystemTime>,
}

impl<T> LimiterState<T> {
    fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            queues: HashMap::new(),
            flushing: HashSet::new(),
            groups: HashMap::new(),
            global_reset: None,
        }
    }
}

fn lock<T>(state: &Mutex<LimiterState<T>>) -> MutexGuard<'_, LimiterState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Rate Limiter
// ----------------------------------------------------------------------------

/// Request dispatcher enforcing server-advertised per-bucket rate limits.
///
/// Generic over the raw result type so transports other than HTTP can reuse
/// it; the REST client instantiates it with `reqwest` responses.
pub struct RateLimiter<T> {
    state: Arc<Mutex<LimiterState<T>>>,
    margin: Duration,
}

impl<T> Clone for RateLimiter<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            margin: self.margin,
        }
    }
}

impl<T> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RateLimiter<T> {
    /// Create a limiter with the default reset margin.
    pub fn new() -> Self {
        Self::with_margin(RESET_MARGIN)
    }

    /// Create a limiter with a custom reset margin.
    pub fn with_margin(margin: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState::new())),
            margin,
        }
    }
}

impl<T: Send + 'static> RateLimiter<T> {
    /// Queue one unit of work on the given bucket and await its result.
    ///
    /// `execute` performs the work and is re-run on every retry; `classify`
    /// extracts [`LimitInfo`] from the raw result without failing. The call
    /// resolves with the raw result of the first non-throttled attempt and
    /// stays pending while throttled attempts are retried.
    pub async fn submit<F, Fut, C>(
        &self,
        bucket: &str,
        execute: F,
        classify: C,
    ) -> Result<T, SubmitError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        C: Fn(&T) -> LimitInfo + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let start_flush = {
            let mut state = lock(&self.state);
            state
                .queues
                .entry(bucket.to_string())
                .or_default()
                .push_back(Queued {
                    execute: Box::new(move || Box::pin(execute())),
                    classify: Box::new(classify),
                    complete: tx,
                });
            // One flush task per bucket key; a running flush picks the new
            // item up on its own.
            state.flushing.insert(bucket.to_string())
        };

        if start_flush {
            let state = Arc::clone(&self.state);
            let key = bucket.to_string();
            let margin = self.margin;
            tokio::spawn(flush(state, key, margin));
        }

        rx.await.map_err(|_| SubmitError::Abandoned)
    }
}

// ----------------------------------------------------------------------------
// Flush Task
// ----------------------------------------------------------------------------

/// Drain one bucket's queue, sleeping out cooldowns between attempts.
async fn flush<T: Send + 'static>(
    state: Arc<Mutex<LimiterState<T>>>,
    key: String,
    margin: Duration,
) {
    loop {
        // One pass of cooldown waits per attempt, in order: the bucket's
        // own cooldown (or the shared group's when this key is aliased),
        // then the global throttle, each padded by the reset margin.
        let (bucket_wait, global_wait) = {
            let mut st = lock(&state);
            let now = SystemTime::now();
            let bucket = *st.buckets.entry(key.clone()).or_insert_with(Bucket::fresh);
            let group = st
                .groups
                .get(&key)
                .and_then(|group| st.buckets.get(group))
                .copied();

            let bucket_wait = bucket
                .cooldown(now)
                .or_else(|| group.and_then(|b| b.cooldown(now)));
            let global_wait = st
                .global_reset
                .and_then(|at| at.duration_since(now).ok());
            (bucket_wait, global_wait)
        };
        if let Some(left) = bucket_wait {
            debug!(bucket = %key, "waiting out bucket cooldown");
            tokio::time::sleep(left + margin).await;
        }
        if let Some(left) = global_wait {
            debug!(bucket = %key, "waiting out global cooldown");
            tokio::time::sleep(left + margin).await;
            lock(&state).global_reset = None;
        }

        // Dequeue exactly one item, or release the flush lock once drained.
        let item = {
            let mut st = lock(&state);
            match st.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(item) => item,
                None => {
                    st.flushing.remove(&key);
                    return;
                }
            }
        };

        let result = (item.execute)().await;
        let info = (item.classify)(&result);

        let resolve = {
            let mut st = lock(&state);

            // Alias and global signals apply whether or not the attempt was
            // throttled, so future lookups on any aliased key see the
            // latest quota.
            if let Some(group) = info.group.clone() {
                st.groups.insert(key.clone(), group);
            }
            if let Some(at) = info.global_reset {
                st.global_reset = Some(st.global_reset.map_or(at, |cur| cur.max(at)));
            }

            // Update this bucket and, when aliased, the shared group
            // record; absent fields keep their previous values.
            let alias = st.groups.get(&key).cloned();
            for record in once(key.clone()).chain(alias) {
                let bucket = st.buckets.entry(record).or_insert_with(Bucket::fresh);
                if let Some(remaining) = info.remaining {
                    bucket.remaining = remaining;
                }
                if let Some(reset_at) = info.reset_at {
                    bucket.reset_at = reset_at;
                }
            }

            if info.was_limited {
                warn!(bucket = %key, "request was throttled, re-queueing");
                // Force the next iteration to wait out the advertised reset.
                if let Some(bucket) = st.buckets.get_mut(&key) {
                    bucket.remaining = 0;
                }
                st.queues.entry(key.clone()).or_default().push_back(item);
                None
            } else {
                Some(item)
            }
        };

        if let Some(Queued { complete, .. }) = resolve {
            // The receiver may have been dropped; nothing left to do then.
            let _ = complete.send(result);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
