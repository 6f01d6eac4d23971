// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Thread-delegating layer.
//!
//! Every operation on the wrapped executor is submitted to a [`WorkerPool`] and a
//! [`Completion`] is handed back at once. Handles are passed through untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::{Executor, ValueHandle};
use crate::utils::worker_pool::{Completion, WorkerPool};
use crate::value::Value;

#[derive(Debug)]
pub struct ThreadDelegatingExecutor {
    inner: Arc<dyn Executor>,
    pool: WorkerPool,
    drain_timeout: Option<Duration>,
}

impl ThreadDelegatingExecutor {
    pub fn new(inner: Arc<dyn Executor>, pool: WorkerPool, drain_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            pool,
            drain_timeout,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn submit_create_value(&self, value: Value) -> Completion<ValueHandle> {
        let inner = self.inner.clone();
        self.pool
            .submit(async move { inner.create_value(value).await })
    }

    pub fn submit_create_call(
        &self,
        function: ValueHandle,
        argument: Option<ValueHandle>,
    ) -> Completion<ValueHandle> {
        let inner = self.inner.clone();
        self.pool.submit(async move {
            inner.create_call(&function, argument.as_ref()).await
        })
    }

    pub fn submit_create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Completion<ValueHandle> {
        let inner = self.inner.clone();
        self.pool
            .submit(async move { inner.create_struct(elements).await })
    }

    pub fn submit_create_selection(
        &self,
        source: ValueHandle,
        index: usize,
    ) -> Completion<ValueHandle> {
        let inner = self.inner.clone();
        self.pool
            .submit(async move { inner.create_selection(&source, index).await })
    }

    pub fn submit_materialize(&self, value: ValueHandle) -> Completion<Value> {
        let inner = self.inner.clone();
        self.pool
            .submit(async move { inner.materialize(&value).await })
    }
}

#[async_trait]
impl Executor for ThreadDelegatingExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        self.submit_create_value(value).await
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        self.submit_create_call(function.clone(), argument.cloned())
            .await
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        self.submit_create_struct(elements).await
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        self.submit_create_selection(source.clone(), index).await
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        self.submit_materialize(value.clone()).await
    }

    async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.shutdown(self.drain_timeout).await;
        self.inner.close().await;
    }
}
