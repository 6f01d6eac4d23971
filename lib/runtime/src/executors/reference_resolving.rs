// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reference-resolving layer.
//!
//! Binds names to values of the wrapped executor and memoizes materialization.
//! Both are single-flight: concurrent callers share one in-flight future and
//! observe the identical handle, or the identical failure. A failed flight is
//! forgotten once it resolves so the next caller starts over.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, ValueHandle, downcast_value};
use crate::value::Value;

type HandleFlight = Shared<BoxFuture<'static, Result<ValueHandle>>>;
type ValueFlight = Shared<BoxFuture<'static, Result<Value>>>;

pub struct ResolvedValue {
    owner: ExecutorId,
    inner: ValueHandle,
    materialized: Mutex<Option<ValueFlight>>,
}

impl std::fmt::Debug for ResolvedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedValue")
            .field("owner", &self.owner)
            .field("inner", &self.inner)
            .field("memoized", &self.materialized.lock().is_some())
            .finish()
    }
}

impl ExecutorValue for ResolvedValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn owner(&self) -> ExecutorId {
        self.owner
    }
}

impl std::fmt::Debug for ReferenceResolvingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolvingExecutor")
            .field("id", &self.id)
            .field("bindings", &self.bindings.lock().len())
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct ReferenceResolvingExecutor {
    id: ExecutorId,
    inner: Arc<dyn Executor>,
    bindings: Mutex<HashMap<String, HandleFlight>>,
    closed: AtomicBool,
}

impl ReferenceResolvingExecutor {
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self {
            id: ExecutorId::next(),
            inner,
            bindings: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn wrap(owner: ExecutorId, inner: ValueHandle) -> ValueHandle {
        Arc::new(ResolvedValue {
            owner,
            inner,
            materialized: Mutex::new(None),
        })
    }

    fn resolve<'a>(&self, handle: &'a ValueHandle) -> Result<&'a ResolvedValue> {
        downcast_value::<ResolvedValue>(handle, self.id, "reference_resolving")
    }

    fn inner_handle(&self, handle: &ValueHandle) -> Result<ValueHandle> {
        Ok(self.resolve(handle)?.inner.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::closed("reference resolving executor"));
        }
        Ok(())
    }

    /// Resolve `name`, running `create` against the inner executor if no value is
    /// bound yet.
    ///
    /// `create` runs at most once per successful binding, however many callers
    /// race on the same name.
    pub async fn resolve_or_create<F, Fut>(&self, name: &str, create: F) -> Result<ValueHandle>
    where
        F: FnOnce(Arc<dyn Executor>) -> Fut,
        Fut: Future<Output = Result<ValueHandle>> + Send + 'static,
    {
        let flight = {
            let mut bindings = self.bindings.lock();
            self.ensure_open()?;
            match bindings.get(name) {
                Some(flight) => flight.clone(),
                None => {
                    let owner = self.id;
                    let creating = create(self.inner.clone());
                    let flight = creating
                        .map(move |created| created.map(|handle| Self::wrap(owner, handle)))
                        .boxed()
                        .shared();
                    bindings.insert(name.to_string(), flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;
        if result.is_err() {
            let mut bindings = self.bindings.lock();
            if bindings
                .get(name)
                .is_some_and(|current| current.ptr_eq(&flight))
            {
                tracing::debug!(reference = name, "evicting failed resolution");
                bindings.remove(name);
            }
        }
        result
    }

    /// Bind `name` to a handle produced by this executor, replacing any prior binding.
    pub fn bind(&self, name: &str, handle: ValueHandle) -> Result<()> {
        self.resolve(&handle)?;
        let mut bindings = self.bindings.lock();
        self.ensure_open()?;
        bindings.insert(
            name.to_string(),
            futures::future::ready(Ok(handle)).boxed().shared(),
        );
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Result<ValueHandle> {
        let flight = {
            let bindings = self.bindings.lock();
            self.ensure_open()?;
            bindings
                .get(name)
                .cloned()
                .ok_or_else(|| ExecutorError::UnknownReference(name.to_string()))?
        };
        flight.await
    }

    pub fn bound_names(&self) -> usize {
        self.bindings.lock().len()
    }
}

#[async_trait]
impl Executor for ReferenceResolvingExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        self.ensure_open()?;
        let inner = self.inner.create_value(value).await?;
        Ok(Self::wrap(self.id, inner))
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        self.ensure_open()?;
        let function = self.inner_handle(function)?;
        let argument = argument.map(|a| self.inner_handle(a)).transpose()?;
        let inner = self
            .inner
            .create_call(&function, argument.as_ref())
            .await?;
        Ok(Self::wrap(self.id, inner))
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        self.ensure_open()?;
        let elements = elements
            .into_iter()
            .map(|(name, handle)| Ok((name, self.inner_handle(&handle)?)))
            .collect::<Result<Vec<_>>>()?;
        let inner = self.inner.create_struct(elements).await?;
        Ok(Self::wrap(self.id, inner))
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        self.ensure_open()?;
        let source = self.inner_handle(source)?;
        let inner = self.inner.create_selection(&source, index).await?;
        Ok(Self::wrap(self.id, inner))
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        self.ensure_open()?;
        let resolved = self.resolve(value)?;
        let flight = {
            let mut memo = resolved.materialized.lock();
            match memo.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let inner = self.inner.clone();
                    let handle = resolved.inner.clone();
                    let flight = async move { inner.materialize(&handle).await }
                        .boxed()
                        .shared();
                    *memo = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;
        if result.is_err() {
            let mut memo = resolved.materialized.lock();
            if memo.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
                *memo = None;
            }
        }
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut bindings = self.bindings.lock();
            std::mem::take(&mut *bindings)
        };
        tracing::debug!(bindings = dropped.len(), "clearing references");
        drop(dropped);
        self.inner.close().await;
    }
}
