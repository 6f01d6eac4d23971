// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The executor capability.
//!
//! Every node of an executor stack, from a leaf kernel up to the handle returned
//! by the factory, implements [`Executor`]. Layers compose by wrapping an inner
//! `Arc<dyn Executor>` and translating handles on the way through.
//!
//! Handles are type-erased [`ExecutorValue`]s. A node recovers its own handle type
//! with [`downcast_value`], which also checks that the handle was produced by that
//! very node instance.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use async_trait::async_trait;

use crate::error::{ExecutorError, Result};
use crate::value::Value;

/// Process-unique identity of an executor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

impl ExecutorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ExecutorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value living inside an executor node.
///
/// The backing resources are released when the last [`ValueHandle`] is dropped.
pub trait ExecutorValue: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;

    /// The node that produced this value.
    fn owner(&self) -> ExecutorId;
}

pub type ValueHandle = Arc<dyn ExecutorValue>;

/// Recover a node's own handle type, rejecting handles from any other node.
pub fn downcast_value<'a, T: ExecutorValue>(
    handle: &'a ValueHandle,
    owner: ExecutorId,
    executor: &str,
) -> Result<&'a T> {
    if handle.owner() != owner {
        return Err(ExecutorError::ForeignHandle {
            executor: format!("{executor}#{owner}"),
        });
    }
    handle
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ExecutorError::ForeignHandle {
            executor: format!("{executor}#{owner}"),
        })
}

#[async_trait]
pub trait Executor: Send + Sync + Debug {
    /// Embed a host value.
    async fn create_value(&self, value: Value) -> Result<ValueHandle>;

    /// Invoke a function value, with an optional argument.
    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle>;

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle>;

    /// Select the element at `index` of a struct value.
    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle>;

    /// Compute a handle down to a host value.
    async fn materialize(&self, value: &ValueHandle) -> Result<Value>;

    /// Release everything this node owns. Idempotent.
    async fn close(&self);
}
