//! Capability registry and notification fan-out.
//!
//! Each capability tag owns a bucket holding the providers and consumers
//! currently registered for it. Inserting into a bucket and taking the
//! snapshot of the opposite side happen under the bucket lock, so every
//! (provider, consumer) pair is announced exactly once, whichever of the two
//! registers first. Notifications themselves run after the lock is released,
//! on the registering task.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

use crate::plugin_system::instance::PluginHandle;
use crate::plugin_system::traits::PluginError;

/// Direction of a capability change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Delivered to consumers when a provider of a consumed tag comes or goes
#[derive(Debug, Clone)]
pub struct CapabilityChange {
    pub tag: String,
    pub kind: ChangeKind,
    pub provider: PluginHandle,
}

/// Handler bound to one capability tag
#[async_trait]
pub trait CapabilityHook: Send + Sync {
    async fn call(&self, change: &CapabilityChange) -> Result<(), PluginError>;
}

type HookFn = dyn Fn(CapabilityChange) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync;

/// Closure-backed hook
struct FnHook {
    handler: Box<HookFn>,
}

#[async_trait]
impl CapabilityHook for FnHook {
    async fn call(&self, change: &CapabilityChange) -> Result<(), PluginError> {
        (self.handler)(change.clone()).await
    }
}

/// Tag → handler dispatch table of one code unit
#[derive(Clone, Default)]
pub struct CapabilityHooks {
    hooks: HashMap<String, Arc<dyn CapabilityHook>>,
}

impl CapabilityHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a hook object to `tag`, replacing any previous one
    pub fn with_hook(mut self, tag: &str, hook: Arc<dyn CapabilityHook>) -> Self {
        self.hooks.insert(tag.to_string(), hook);
        self
    }

    /// Bind a closure to `tag`
    pub fn on<F>(self, tag: &str, handler: F) -> Self
    where
        F: Fn(CapabilityChange) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync + 'static,
    {
        self.with_hook(tag, Arc::new(FnHook { handler: Box::new(handler) }))
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn CapabilityHook>> {
        self.hooks.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for CapabilityHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.tags().collect();
        tags.sort_unstable();
        f.debug_struct("CapabilityHooks").field("tags", &tags).finish()
    }
}

/// A consumer hook that failed while being notified
#[derive(Debug)]
pub struct HookFailure {
    pub consumer_id: String,
    pub tag: String,
    pub kind: ChangeKind,
    pub error: PluginError,
}

struct ProviderEntry {
    handle: PluginHandle,
    /// Removal notifications are in flight; still resolvable, no longer announced
    withdrawing: bool,
}

#[derive(Default)]
struct Bucket {
    providers: BTreeMap<String, ProviderEntry>,
    consumers: BTreeMap<String, PluginHandle>,
}

impl Bucket {
    fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.consumers.is_empty()
    }
}

/// Capability tag → active providers and consumers
#[derive(Default)]
pub struct CapabilityRegistry {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the bucket for `tag`, creating it if needed. The map guard
    /// is held until `f` returns so [`prune`](Self::prune) cannot detach the
    /// bucket in between.
    fn with_bucket<R>(&self, tag: &str, f: impl FnOnce(&mut Bucket) -> R) -> R {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(tag) {
                return f(&mut bucket.lock());
            }
        }
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(tag.to_string()).or_default();
        f(&mut bucket.lock())
    }

    fn existing_bucket(&self, tag: &str) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.read().get(tag).cloned()
    }

    /// Drop the bucket for `tag` if it holds nothing.
    fn prune(&self, tag: &str) {
        let mut buckets = self.buckets.write();
        if buckets.get(tag).is_some_and(|bucket| bucket.lock().is_empty()) {
            buckets.remove(tag);
        }
    }

    /// Register `provider` for `tag` and announce it to every registered
    /// consumer. Failures are reported against the consumers.
    pub async fn register_provider(&self, tag: &str, provider: &PluginHandle) -> Vec<HookFailure> {
        let consumers: Vec<PluginHandle> = self.with_bucket(tag, |bucket| {
            bucket.providers.insert(
                provider.id().to_string(),
                ProviderEntry {
                    handle: provider.clone(),
                    withdrawing: false,
                },
            );
            bucket.consumers.values().cloned().collect()
        });
        log::debug!("Capability '{}': provider '{}' registered, {} consumer(s) to notify", tag, provider.id(), consumers.len());

        let mut failures = Vec::new();
        for consumer in consumers.iter().filter(|consumer| consumer.id() != provider.id()) {
            let change = CapabilityChange {
                tag: tag.to_string(),
                kind: ChangeKind::Added,
                provider: provider.clone(),
            };
            if let Err(error) = consumer.deliver(&change).await {
                failures.push(HookFailure {
                    consumer_id: consumer.id().to_string(),
                    tag: tag.to_string(),
                    kind: ChangeKind::Added,
                    error,
                });
            }
        }
        failures
    }

    /// Announce the removal of `provider` to every consumer, then remove it.
    ///
    /// The provider stays visible to [`providers`](Self::providers) while the
    /// consumers are being notified so they can drop their references cleanly.
    pub async fn unregister_provider(&self, tag: &str, provider: &PluginHandle) -> Vec<HookFailure> {
        let Some(bucket) = self.existing_bucket(tag) else {
            return Vec::new();
        };
        let consumers: Vec<PluginHandle> = {
            let mut bucket = bucket.lock();
            match bucket.providers.get_mut(provider.id()) {
                Some(entry) if entry.handle.ptr_eq(provider) => entry.withdrawing = true,
                _ => return Vec::new(),
            }
            bucket.consumers.values().cloned().collect()
        };

        let mut failures = Vec::new();
        for consumer in consumers.iter().filter(|consumer| consumer.id() != provider.id()) {
            let change = CapabilityChange {
                tag: tag.to_string(),
                kind: ChangeKind::Removed,
                provider: provider.clone(),
            };
            if let Err(error) = consumer.deliver(&change).await {
                failures.push(HookFailure {
                    consumer_id: consumer.id().to_string(),
                    tag: tag.to_string(),
                    kind: ChangeKind::Removed,
                    error,
                });
            }
        }

        {
            let mut bucket = bucket.lock();
            if bucket
                .providers
                .get(provider.id())
                .is_some_and(|entry| entry.handle.ptr_eq(provider))
            {
                bucket.providers.remove(provider.id());
            }
        }
        self.prune(tag);
        log::debug!("Capability '{}': provider '{}' unregistered", tag, provider.id());
        failures
    }

    /// Register `consumer` for `tag` and announce every provider already
    /// present to it. Stops at the first failing hook.
    pub async fn register_consumer(&self, tag: &str, consumer: &PluginHandle) -> Result<(), HookFailure> {
        let providers: Vec<PluginHandle> = self.with_bucket(tag, |bucket| {
            bucket.consumers.insert(consumer.id().to_string(), consumer.clone());
            bucket
                .providers
                .values()
                .filter(|entry| !entry.withdrawing)
                .map(|entry| entry.handle.clone())
                .collect()
        });

        for provider in providers.into_iter().filter(|provider| provider.id() != consumer.id()) {
            let change = CapabilityChange {
                tag: tag.to_string(),
                kind: ChangeKind::Added,
                provider,
            };
            consumer.deliver(&change).await.map_err(|error| HookFailure {
                consumer_id: consumer.id().to_string(),
                tag: tag.to_string(),
                kind: ChangeKind::Added,
                error,
            })?;
        }
        Ok(())
    }

    /// Remove `consumer` from `tag`. No notifications are sent.
    pub fn unregister_consumer(&self, tag: &str, consumer: &PluginHandle) {
        if let Some(bucket) = self.existing_bucket(tag) {
            let mut bucket = bucket.lock();
            if bucket
                .consumers
                .get(consumer.id())
                .is_some_and(|existing| existing.ptr_eq(consumer))
            {
                bucket.consumers.remove(consumer.id());
            }
        }
        consumer.forget_capability(tag);
        self.prune(tag);
    }

    /// Providers currently registered for `tag`, ordered by id
    pub fn providers(&self, tag: &str) -> Vec<PluginHandle> {
        self.existing_bucket(tag)
            .map(|bucket| bucket.lock().providers.values().map(|entry| entry.handle.clone()).collect())
            .unwrap_or_default()
    }

    /// Consumers currently registered for `tag`, ordered by id
    pub fn consumers(&self, tag: &str) -> Vec<PluginHandle> {
        self.existing_bucket(tag)
            .map(|bucket| bucket.lock().consumers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags that currently have at least one provider or consumer
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.buckets.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("tags", &self.tags())
            .finish_non_exhaustive()
    }
}
