//! Scope instances and their instance caches.
//!
//! Each live scope instance owns one cache keyed by definition name. Entries
//! start as a shared pending-build token so concurrent resolvers of the same
//! definition all await one build, then become ready instances. Every build
//! that completes gets a sequence number; closing releases in reverse
//! sequence order.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::definition::{Built, Instance, ReleaseHook};
use crate::error::{share, DiError, ReleaseFailure};
use crate::scope::Scope;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Single build shared by every concurrent waiter.
pub(crate) type PendingBuild = Shared<BoxFuture<'static, Result<Instance, DiError>>>;

/// Lifecycle of a scope instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Closing,
    Closed,
}

enum Entry {
    Pending(PendingBuild),
    Ready(Instance),
}

struct BuildRecord {
    seq: u64,
    name: String,
    release: Option<ReleaseHook>,
}

struct Inner {
    state: ScopeState,
    cache: HashMap<String, Entry>,
    built: Vec<BuildRecord>,
    next_seq: u64,
}

/// Result of a cache lookup: either the finished instance or the build to await.
pub(crate) enum Lookup {
    Ready(Instance),
    Pending(PendingBuild),
}

/// One live instance of a [`Scope`].
pub struct ScopeInstance {
    id: u64,
    scope: Scope,
    inner: Mutex<Inner>,
}

impl fmt::Debug for ScopeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeInstance")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .finish()
    }
}

impl ScopeInstance {
    pub(crate) fn open(scope: Scope) -> Arc<Self> {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(scope = %scope, instance = id, "Opening scope instance");

        Arc::new(Self {
            id,
            scope,
            inner: Mutex::new(Inner {
                state: ScopeState::Open,
                cache: HashMap::new(),
                built: Vec::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> ScopeState {
        self.lock().state
    }

    /// Names of built entries in build order.
    pub fn built_names(&self) -> Vec<String> {
        let inner = self.lock();
        let mut records: Vec<_> = inner.built.iter().map(|r| (r.seq, r.name.clone())).collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, name)| name).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self, state: ScopeState, name: &str) -> DiError {
        DiError::ManagedScope(format!(
            "cannot resolve '{}': {} scope instance {} is {:?}",
            name, self.scope, self.id, state
        ))
    }

    /// Returns the cached instance, joins the pending build, or starts one.
    ///
    /// `build` is only invoked when no entry exists yet.
    pub(crate) fn lookup_or_build<F>(self: &Arc<Self>, name: &str, build: F) -> Result<Lookup, DiError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Built, DiError>>,
    {
        let mut inner = self.lock();
        if inner.state != ScopeState::Open {
            return Err(self.closed_error(inner.state, name));
        }

        match inner.cache.get(name) {
            Some(Entry::Ready(instance)) => {
                tracing::trace!(dependency = %name, scope = %self.scope, "Cache hit");
                return Ok(Lookup::Ready(instance.clone()));
            }
            Some(Entry::Pending(pending)) => {
                tracing::debug!(dependency = %name, scope = %self.scope, "Joining pending build");
                return Ok(Lookup::Pending(pending.clone()));
            }
            None => {}
        }

        let weak = Arc::downgrade(self);
        let owned_name = name.to_string();
        let fut = build();
        let pending = async move {
            let result = fut.await;
            match weak.upgrade() {
                Some(instance) => instance.complete(&owned_name, result).await,
                None => Err(DiError::UnreachableCodeBlock(format!(
                    "scope instance dropped while building '{owned_name}'"
                ))),
            }
        }
        .boxed()
        .shared();

        inner
            .cache
            .insert(name.to_string(), Entry::Pending(pending.clone()));
        Ok(Lookup::Pending(pending))
    }

    /// Records a finished build, or discards the entry after a failure.
    async fn complete(&self, name: &str, result: Result<Built, DiError>) -> Result<Instance, DiError> {
        let built = match result {
            Ok(built) => built,
            Err(err) => {
                let mut inner = self.lock();
                if inner.state == ScopeState::Open {
                    inner.cache.remove(name);
                }
                return Err(err);
            }
        };

        let Built { instance, release } = built;
        let refused = {
            let mut inner = self.lock();
            if inner.state == ScopeState::Open {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner
                    .cache
                    .insert(name.to_string(), Entry::Ready(instance.clone()));
                inner.built.push(BuildRecord {
                    seq,
                    name: name.to_string(),
                    release,
                });
                tracing::debug!(dependency = %name, scope = %self.scope, seq, "Built instance");
                None
            } else {
                // Closing instances keep their cache as is; close() clears it.
                Some((inner.state, release))
            }
        };

        match refused {
            None => Ok(instance),
            Some((state, release)) => {
                // The scope began closing mid-build; nobody else will release this.
                if let Some(release) = release {
                    if let Err(err) = release().await {
                        tracing::error!(dependency = %name, error = %err, "Release of orphaned instance failed");
                    }
                }
                Err(self.closed_error(state, name))
            }
        }
    }

    /// Registers a release for an uncached (transient) instance.
    pub(crate) async fn adopt(&self, name: &str, release: ReleaseHook) -> Result<(), DiError> {
        let state = {
            let mut inner = self.lock();
            if inner.state == ScopeState::Open {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.built.push(BuildRecord {
                    seq,
                    name: name.to_string(),
                    release: Some(release),
                });
                return Ok(());
            }
            inner.state
        };

        if let Err(err) = release().await {
            tracing::error!(dependency = %name, error = %err, "Release of orphaned instance failed");
        }
        Err(self.closed_error(state, name))
    }

    /// Releases every built entry in reverse build order.
    ///
    /// All releases are attempted; failures are aggregated into one
    /// `ProviderRelease` error. Closing an already closing or closed
    /// instance is a no-op.
    pub(crate) async fn close(&self, release_timeout: Option<Duration>) -> Result<(), DiError> {
        let mut records = {
            let mut inner = self.lock();
            if inner.state != ScopeState::Open {
                return Ok(());
            }
            inner.state = ScopeState::Closing;
            std::mem::take(&mut inner.built)
        };
        records.sort_by_key(|r| Reverse(r.seq));

        tracing::info!(scope = %self.scope, instance = self.id, entries = records.len(), "Closing scope instance");

        let mut failures = Vec::new();
        for record in records {
            let Some(release) = record.release else {
                continue;
            };
            tracing::debug!(dependency = %record.name, seq = record.seq, "Releasing instance");

            let outcome = match release_timeout {
                Some(limit) => match tokio::time::timeout(limit, release()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("release timed out after {limit:?}")),
                },
                None => release().await,
            };

            if let Err(err) = outcome {
                tracing::error!(dependency = %record.name, error = %err, "Release failed");
                failures.push(ReleaseFailure {
                    provider_name: record.name,
                    cause: share(err),
                });
            }
        }

        {
            let mut inner = self.lock();
            inner.state = ScopeState::Closed;
            inner.cache.clear();
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DiError::ProviderRelease { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::definition::Provision;

    fn built_with_log(value: &'static str, log: Arc<Mutex<Vec<String>>>, fail: bool) -> Built {
        Provision::new(value)
            .on_release(move |v| async move {
                log.lock().unwrap().push(v.to_string());
                if fail {
                    anyhow::bail!("{} refused to release", v);
                }
                Ok(())
            })
            .into_built()
    }

    async fn build(instance: &Arc<ScopeInstance>, name: &'static str, built: Built) -> Instance {
        match instance
            .lookup_or_build(name, move || async move { Ok(built) }.boxed())
            .unwrap()
        {
            Lookup::Ready(instance) => instance,
            Lookup::Pending(pending) => pending.await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_release_is_reverse_build_order_and_aggregates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = ScopeInstance::open(Scope::Round);

        build(&scope, "a", built_with_log("a", log.clone(), false)).await;
        build(&scope, "b", built_with_log("b", log.clone(), true)).await;
        build(&scope, "c", built_with_log("c", log.clone(), false)).await;
        assert_eq!(scope.built_names(), vec!["a", "b", "c"]);

        let err = scope.close(None).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(err.provider_names(), vec!["b"]);
        assert_eq!(scope.state(), ScopeState::Closed);
    }

    #[tokio::test]
    async fn test_closed_scope_rejects_lookup() {
        let scope = ScopeInstance::open(Scope::Round);
        scope.close(None).await.unwrap();

        let result = scope.lookup_or_build("x", || async { Err::<Built, _>(DiError::Task("unused".into())) }.boxed());
        assert!(matches!(result, Err(DiError::ManagedScope(_))));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_build() {
        let scope = ScopeInstance::open(Scope::Singleton);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let calls = calls.clone();
            let lookup = scope
                .lookup_or_build("shared", move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(Provision::new(7_u8).into_built())
                    }
                    .boxed()
                })
                .unwrap();
            waiters.push(async move {
                match lookup {
                    Lookup::Ready(instance) => instance,
                    Lookup::Pending(pending) => pending.await.unwrap(),
                }
            });
        }

        let instances = futures::future::join_all(waiters).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_failed_build_is_evicted() {
        let scope = ScopeInstance::open(Scope::Round);
        let lookup = scope
            .lookup_or_build("flaky", || {
                async { Err::<Built, _>(DiError::provider_build("flaky", anyhow::anyhow!("nope"))) }
                    .boxed()
            })
            .unwrap();
        let Lookup::Pending(pending) = lookup else {
            panic!("expected pending build");
        };
        assert!(pending.await.is_err());

        let retry = build(&scope, "flaky", Provision::new(1_i32).into_built()).await;
        assert_eq!(*retry.downcast::<i32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_leaves_closing_cache_untouched() {
        let scope = ScopeInstance::open(Scope::Round);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = Provision::new(1_u8)
            .on_release(move |_| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .into_built();
        build(&scope, "slow", slow).await;

        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel::<()>();
        let lookup = scope
            .lookup_or_build("late", move || {
                async move {
                    let _ = fail_rx.await;
                    Err::<Built, _>(DiError::provider_build("late", anyhow::anyhow!("gave up")))
                }
                .boxed()
            })
            .unwrap();
        let Lookup::Pending(pending) = lookup else {
            panic!("expected pending build");
        };
        let waiter = tokio::spawn(pending);

        let closing = tokio::spawn({
            let scope = scope.clone();
            async move { scope.close(None).await }
        });
        while scope.state() != ScopeState::Closing {
            tokio::task::yield_now().await;
        }

        fail_tx.send(()).unwrap();
        assert!(waiter.await.unwrap().is_err());
        assert!(scope.lock().cache.contains_key("late"));

        release_tx.send(()).unwrap();
        closing.await.unwrap().unwrap();
        assert!(scope.lock().cache.is_empty());
    }
}
