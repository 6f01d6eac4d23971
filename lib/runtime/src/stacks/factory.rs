// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executor Factory
//!
//! The factory owns the stack cache, the one piece of mutable state shared by
//! every caller. Stacks are keyed by [`CardinalityMap`] and reference counted
//! through [`ExecutorHandle`]s:
//!
//! - the first request for a map starts a construction; concurrent requests for
//!   the same map wait on that construction instead of starting their own;
//! - a failed construction never enters the cache, the next request builds again;
//! - releasing the last handle tears the stack down (under
//!   [`EvictionPolicy::OnRelease`]);
//! - an operation failure that indicates participant loss retires the entry.
//!   Current holders keep using it until they release; the next request builds a
//!   fresh stack.
//!
//! The cache lock is never held across an await point.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use derive_builder::Builder;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use validator::Validate;

use crate::config::{EvictionPolicy, StackConfig};
use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ValueHandle, async_trait};
use crate::executors::eager::{EagerLeafFactory, LeafFactory};
use crate::placement::CardinalityMap;
use crate::remote::stub::RemoteWorker;
use crate::stacks::builder::{ExecutorStack, StackBuilder};
use crate::stacks::plan::StackPlan;
use crate::utils::worker_pool::WorkerRuntime;
use crate::value::Value;

type BuildFlight = Shared<BoxFuture<'static, Result<Arc<ExecutorStack>>>>;

/// A construction in progress.
///
/// `settled` is set by the first waiter to record the outcome. Only that waiter
/// may hand the stack out as a new entry or close it as an orphan.
#[derive(Clone)]
struct Construction {
    generation: u64,
    flight: BuildFlight,
    settled: Arc<AtomicBool>,
}

/// Everything needed to assemble an [`ExecutorFactory`].
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_options"))]
pub struct ExecutorFactoryOptions {
    #[builder(default)]
    pub config: StackConfig,

    /// Produces coordinator and participant leaves.
    #[builder(default = "Arc::new(EagerLeafFactory) as Arc<dyn LeafFactory>")]
    pub leaf_factory: Arc<dyn LeafFactory>,

    /// When non-empty, participants are served by these workers instead of local
    /// leaves.
    #[builder(default = "Vec::new()")]
    pub remote_workers: Vec<Arc<dyn RemoteWorker>>,

    /// Runtime for worker pools. Derived from `config.worker_threads` when unset.
    #[builder(default, setter(strip_option))]
    pub runtime: Option<WorkerRuntime>,
}

impl ExecutorFactoryOptionsBuilder {
    /// Validate the options and create the factory.
    pub fn build(self) -> Result<ExecutorFactory> {
        let options = self
            .build_options()
            .map_err(|e| ExecutorError::Config(format!("failed to build factory options: {e}")))?;
        ExecutorFactory::from_options(options)
    }
}

/// Snapshot of the stack cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Constructed stacks selectable by new requests.
    pub live: usize,
    /// Constructions in progress.
    pub building: usize,
    /// Stacks no longer selectable but still referenced.
    pub retired: usize,
    /// Constructions started since the factory was created.
    pub constructions: u64,
}

struct CacheEntry {
    generation: u64,
    stack: Arc<ExecutorStack>,
    refs: usize,
}

enum Slot {
    Building(Construction),
    Ready(CacheEntry),
}

#[derive(Default)]
struct CacheState {
    live: HashMap<CardinalityMap, Slot>,
    retired: HashMap<u64, CacheEntry>,
    next_generation: u64,
    constructions: u64,
    closed: bool,
}

struct FactoryInner {
    builder: Arc<StackBuilder>,
    state: Mutex<CacheState>,
}

enum Lookup {
    Hit(u64, Arc<ExecutorStack>),
    Wait(Construction),
}

/// What a waiter does with a finished construction.
enum Settled {
    Acquired(Arc<ExecutorStack>),
    /// The slot went away after another waiter took the stack; look up again.
    Retry,
    /// The slot went away before anyone took the stack; close it, then look up again.
    Orphaned(Arc<ExecutorStack>),
}

impl FactoryInner {
    fn eviction_policy(&self) -> EvictionPolicy {
        self.builder.config().eviction_policy
    }

    fn lookup(&self, key: &CardinalityMap) -> Result<Lookup> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ExecutorError::closed("executor factory"));
        }

        match state.live.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                entry.refs += 1;
                tracing::trace!(cardinalities = %key, refs = entry.refs, "stack cache hit");
                Ok(Lookup::Hit(entry.generation, entry.stack.clone()))
            }
            Some(Slot::Building(construction)) => Ok(Lookup::Wait(construction.clone())),
            None => {
                state.next_generation += 1;
                state.constructions += 1;
                let generation = state.next_generation;
                let builder = self.builder.clone();
                let cardinalities = key.clone();
                let flight = async move { builder.build(cardinalities).await.map(Arc::new) }
                    .boxed()
                    .shared();
                let construction = Construction {
                    generation,
                    flight,
                    settled: Arc::new(AtomicBool::new(false)),
                };
                state
                    .live
                    .insert(key.clone(), Slot::Building(construction.clone()));
                tracing::debug!(cardinalities = %key, generation, "starting stack construction");
                Ok(Lookup::Wait(construction))
            }
        }
    }

    /// Record the outcome of a construction this caller waited on.
    fn complete(
        &self,
        key: &CardinalityMap,
        construction: &Construction,
        outcome: Result<Arc<ExecutorStack>>,
    ) -> Result<Settled> {
        let generation = construction.generation;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let building = matches!(
            state.live.get(key),
            Some(Slot::Building(c)) if c.generation == generation
        );

        let stack = match outcome {
            Ok(stack) => stack,
            Err(e) => {
                if building {
                    state.live.remove(key);
                }
                return Err(e);
            }
        };

        if let Some(Slot::Ready(entry)) = state.live.get_mut(key) {
            if entry.generation == generation {
                entry.refs += 1;
                return Ok(Settled::Acquired(stack));
            }
        }
        if construction.settled.swap(true, Ordering::AcqRel) {
            return Ok(Settled::Retry);
        }
        if building {
            state.live.insert(
                key.clone(),
                Slot::Ready(CacheEntry {
                    generation,
                    stack: stack.clone(),
                    refs: 1,
                }),
            );
            return Ok(Settled::Acquired(stack));
        }
        tracing::debug!(cardinalities = %key, generation, "constructed stack lost its slot");
        Ok(Settled::Orphaned(stack))
    }

    /// Drop one reference. Returns the stack if it must now be torn down.
    fn release(&self, key: &CardinalityMap, generation: u64) -> Option<Arc<ExecutorStack>> {
        let eager = self.eviction_policy() == EvictionPolicy::OnRelease;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(Slot::Ready(entry)) = state.live.get_mut(key) {
            if entry.generation == generation {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs > 0 || !(eager || state.closed) {
                    return None;
                }
                return match state.live.remove(key) {
                    Some(Slot::Ready(entry)) => Some(entry.stack),
                    _ => None,
                };
            }
        }

        if let Some(entry) = state.retired.get_mut(&generation) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                return state.retired.remove(&generation).map(|entry| entry.stack);
            }
        }
        None
    }

    /// Retire the entry so the next request rebuilds.
    fn invalidate(&self, key: &CardinalityMap, generation: u64) -> Option<Arc<ExecutorStack>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !matches!(state.live.get(key), Some(Slot::Ready(entry)) if entry.generation == generation) {
            return None;
        }
        match state.live.remove(key) {
            Some(Slot::Ready(entry)) => {
                tracing::warn!(
                    cardinalities = %key,
                    generation,
                    holders = entry.refs,
                    "participant loss; retiring cached stack"
                );
                if entry.refs == 0 {
                    return Some(entry.stack);
                }
                state.retired.insert(generation, entry);
                None
            }
            _ => None,
        }
    }

    fn take_idle(&self) -> Vec<Arc<ExecutorStack>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let idle: Vec<CardinalityMap> = state
            .live
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(entry) if entry.refs == 0))
            .map(|(key, _)| key.clone())
            .collect();
        idle.iter()
            .filter_map(|key| match state.live.remove(key) {
                Some(Slot::Ready(entry)) => Some(entry.stack),
                _ => None,
            })
            .collect()
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let building = state
            .live
            .values()
            .filter(|slot| matches!(slot, Slot::Building(_)))
            .count();
        CacheStats {
            live: state.live.len() - building,
            building,
            retired: state.retired.len(),
            constructions: state.constructions,
        }
    }
}

async fn close_all(stacks: Vec<Arc<ExecutorStack>>) {
    join_all(stacks.iter().map(|stack| stack.close())).await;
}

/// Builds, caches and hands out executor stacks.
///
/// ```rust,ignore
/// let factory = ExecutorFactory::new(StackConfig::from_env()?)?;
/// let executor = factory.get_executor(&CardinalityMap::clients(25)).await?;
/// // ...
/// executor.release().await;
/// ```
#[derive(Clone)]
pub struct ExecutorFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorFactory")
            .field("config", self.inner.builder.config())
            .field("stats", &self.inner.stats())
            .finish()
    }
}

impl ExecutorFactory {
    pub fn builder() -> ExecutorFactoryOptionsBuilder {
        ExecutorFactoryOptionsBuilder::default()
    }

    /// A factory with local eager leaves.
    pub fn new(config: StackConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn from_options(options: ExecutorFactoryOptions) -> Result<Self> {
        options.config.validate()?;
        let runtime = match options.runtime {
            Some(runtime) => runtime,
            None => WorkerRuntime::from_threads(options.config.worker_threads)?,
        };
        tracing::debug!(
            fan_out_threshold = options.config.fan_out_threshold,
            remote_workers = options.remote_workers.len(),
            "creating executor factory"
        );
        let builder = StackBuilder::new(
            options.config,
            options.leaf_factory,
            options.remote_workers,
            runtime,
        );
        Ok(Self {
            inner: Arc::new(FactoryInner {
                builder: Arc::new(builder),
                state: Mutex::new(CacheState::default()),
            }),
        })
    }

    pub fn config(&self) -> &StackConfig {
        self.inner.builder.config()
    }

    /// The topology a stack for `cardinalities` has, without building it.
    pub fn plan(&self, cardinalities: &CardinalityMap) -> Result<StackPlan> {
        self.check_capacity(cardinalities)?;
        self.inner.builder.plan(cardinalities)
    }

    fn check_capacity(&self, cardinalities: &CardinalityMap) -> Result<()> {
        let requested = cardinalities.participants();
        let limit = self.config().max_participants;
        if requested > limit {
            return Err(ExecutorError::CapacityExceeded { requested, limit });
        }
        Ok(())
    }

    /// Return a handle to the stack serving `cardinalities`, building it if needed.
    pub async fn get_executor(&self, cardinalities: &CardinalityMap) -> Result<ExecutorHandle> {
        self.check_capacity(cardinalities)?;

        loop {
            let (generation, stack) = match self.inner.lookup(cardinalities)? {
                Lookup::Hit(generation, stack) => (generation, stack),
                Lookup::Wait(construction) => {
                    let outcome = construction.flight.clone().await;
                    match self.inner.complete(cardinalities, &construction, outcome)? {
                        Settled::Acquired(stack) => (construction.generation, stack),
                        Settled::Retry => continue,
                        Settled::Orphaned(stack) => {
                            stack.close().await;
                            continue;
                        }
                    }
                }
            };

            return Ok(ExecutorHandle {
                factory: self.inner.clone(),
                key: cardinalities.clone(),
                generation,
                stack,
                released: AtomicBool::new(false),
            });
        }
    }

    /// [`get_executor`](Self::get_executor) for untrusted `(placement, count)` pairs.
    pub async fn get_executor_for<'a, I>(&self, pairs: I) -> Result<ExecutorHandle>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let cardinalities = CardinalityMap::from_pairs(pairs)?;
        self.get_executor(&cardinalities).await
    }

    /// Tear down every cached stack without holders. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let idle = self.inner.take_idle();
        let count = idle.len();
        close_all(idle).await;
        if count > 0 {
            tracing::debug!(evicted = count, "evicted idle stacks");
        }
        count
    }

    /// Refuse new requests, tear down idle stacks and retire referenced ones.
    ///
    /// Retired stacks are torn down when their last holder releases.
    pub async fn shutdown(&self) {
        let idle = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;

            let mut idle = Vec::new();
            for (key, slot) in state.live.drain() {
                match slot {
                    Slot::Ready(entry) if entry.refs == 0 => idle.push(entry.stack),
                    Slot::Ready(entry) => {
                        tracing::debug!(cardinalities = %key, holders = entry.refs, "retiring stack at shutdown");
                        state.retired.insert(entry.generation, entry);
                    }
                    Slot::Building(_) => {}
                }
            }
            idle
        };
        tracing::debug!(idle = idle.len(), "shutting down executor factory");
        close_all(idle).await;
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

/// A reference to a cached stack.
///
/// Implements [`Executor`] against the stack root. Release with
/// [`ExecutorHandle::release`] to await teardown; dropping the handle releases it
/// too, with teardown spawned on the current runtime.
pub struct ExecutorHandle {
    factory: Arc<FactoryInner>,
    key: CardinalityMap,
    generation: u64,
    stack: Arc<ExecutorStack>,
    released: AtomicBool,
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("cardinalities", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ExecutorHandle {
    pub fn cardinalities(&self) -> &CardinalityMap {
        &self.key
    }

    pub fn plan(&self) -> &StackPlan {
        self.stack.plan()
    }

    /// Identifies the construction behind this handle; a rebuilt stack has a new one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// See [`ReferenceResolvingExecutor::resolve_or_create`](crate::executors::reference_resolving::ReferenceResolvingExecutor::resolve_or_create).
    pub async fn resolve_or_create<F, Fut>(&self, name: &str, create: F) -> Result<ValueHandle>
    where
        F: FnOnce(Arc<dyn Executor>) -> Fut,
        Fut: Future<Output = Result<ValueHandle>> + Send + 'static,
    {
        let result = self.stack.root().resolve_or_create(name, create).await;
        self.observe(result)
    }

    pub fn bind(&self, name: &str, handle: ValueHandle) -> Result<()> {
        self.stack.root().bind(name, handle)
    }

    pub async fn lookup(&self, name: &str) -> Result<ValueHandle> {
        self.stack.root().lookup(name).await
    }

    /// Give up this reference, tearing the stack down if it was the last one.
    pub async fn release(self) {
        if let Some(stack) = self.release_ref() {
            stack.close().await;
        }
    }

    fn release_ref(&self) -> Option<Arc<ExecutorStack>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.factory.release(&self.key, self.generation)
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.indicates_participant_loss() {
                if let Some(stack) = self.factory.invalidate(&self.key, self.generation) {
                    spawn_teardown(stack);
                }
            }
        }
        result
    }
}

fn spawn_teardown(stack: Arc<ExecutorStack>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { stack.close().await });
        }
        Err(_) => {
            tracing::debug!(
                cardinalities = %stack.cardinalities(),
                "no runtime for teardown; dropping stack"
            );
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        if let Some(stack) = self.release_ref() {
            spawn_teardown(stack);
        }
    }
}

#[async_trait]
impl Executor for ExecutorHandle {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        let result = self.stack.root().create_value(value).await;
        self.observe(result)
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        let result = self.stack.root().create_call(function, argument).await;
        self.observe(result)
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        let result = self.stack.root().create_struct(elements).await;
        self.observe(result)
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        let result = self.stack.root().create_selection(source, index).await;
        self.observe(result)
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        let result = self.stack.root().materialize(value).await;
        self.observe(result)
    }

    /// Releases this reference; the stack closes only when it was the last one.
    async fn close(&self) {
        if let Some(stack) = self.release_ref() {
            stack.close().await;
        }
    }
}
