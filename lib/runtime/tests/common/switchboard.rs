// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Leaf factory whose participants can be disconnected individually.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fedexec_runtime::executor::{Executor, ValueHandle};
use fedexec_runtime::executors::{EagerExecutor, LeafFactory, LeafRole};
use fedexec_runtime::{ExecutorError, Result, Value};

#[derive(Debug, Clone, Default)]
pub struct SwitchboardLeaves {
    offline: Arc<Mutex<HashSet<usize>>>,
    created: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl SwitchboardLeaves {
    /// Every leaf creation sleeps for `delay`, widening construction races.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn disconnect(&self, index: usize) {
        self.offline.lock().insert(index);
    }

    pub fn reconnect(&self, index: usize) {
        self.offline.lock().remove(&index);
    }

    /// Leaves created so far, coordinators included.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeafFactory for SwitchboardLeaves {
    async fn create_leaf(&self, role: LeafRole) -> Result<Arc<dyn Executor>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        match role {
            LeafRole::Participant { index } => Ok(Arc::new(SwitchedLeaf {
                index,
                inner: EagerExecutor::new(),
                offline: self.offline.clone(),
            })),
            LeafRole::Coordinator { .. } => Ok(Arc::new(EagerExecutor::new())),
        }
    }
}

#[derive(Debug)]
struct SwitchedLeaf {
    index: usize,
    inner: EagerExecutor,
    offline: Arc<Mutex<HashSet<usize>>>,
}

impl SwitchedLeaf {
    fn check(&self) -> Result<()> {
        if self.offline.lock().contains(&self.index) {
            return Err(ExecutorError::connectivity(
                format!("participant-{}", self.index),
                "connection lost",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for SwitchedLeaf {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        self.check()?;
        self.inner.create_value(value).await
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        self.check()?;
        self.inner.create_call(function, argument).await
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        self.check()?;
        self.inner.create_struct(elements).await
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        self.check()?;
        self.inner.create_selection(source, index).await
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        self.check()?;
        self.inner.materialize(value).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
