// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process leaf executor.
//!
//! Holds host values directly and evaluates [`LeafFunction`](crate::value::LeafFunction)s
//! on the calling task. Intrinsics are not understood here; they are interpreted
//! by the layers stacked above a leaf.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ExecutorError, ParticipantRange, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, ValueHandle, downcast_value};
use crate::value::{Computation, Value};

/// The position a leaf occupies in a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafRole {
    /// The coordinator of the node serving `range`.
    Coordinator { range: ParticipantRange },
    /// The participant with this absolute index.
    Participant { index: usize },
}

/// Produces the leaves of a stack.
#[async_trait]
pub trait LeafFactory: Send + Sync + std::fmt::Debug {
    async fn create_leaf(&self, role: LeafRole) -> Result<Arc<dyn Executor>>;
}

/// Hands out a fresh [`EagerExecutor`] for every role.
#[derive(Debug, Default, Clone)]
pub struct EagerLeafFactory;

#[async_trait]
impl LeafFactory for EagerLeafFactory {
    async fn create_leaf(&self, _role: LeafRole) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(EagerExecutor::new()))
    }
}

#[derive(Debug)]
pub struct EagerValue {
    owner: ExecutorId,
    value: Value,
}

impl EagerValue {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl ExecutorValue for EagerValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn owner(&self) -> ExecutorId {
        self.owner
    }
}

#[derive(Debug)]
pub struct EagerExecutor {
    id: ExecutorId,
}

impl Default for EagerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl EagerExecutor {
    pub fn new() -> Self {
        Self {
            id: ExecutorId::next(),
        }
    }

    fn wrap(&self, value: Value) -> ValueHandle {
        Arc::new(EagerValue {
            owner: self.id,
            value,
        })
    }

    fn lookup<'a>(&self, handle: &'a ValueHandle) -> Result<&'a Value> {
        downcast_value::<EagerValue>(handle, self.id, "eager").map(EagerValue::value)
    }
}

#[async_trait]
impl Executor for EagerExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        if let Value::Federated { .. } = value {
            return Err(ExecutorError::invalid_argument(
                "a leaf executor cannot hold federated values",
            ));
        }
        Ok(self.wrap(value))
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        let function = match self.lookup(function)? {
            Value::Function(Computation::Function(f)) => f.clone(),
            Value::Function(Computation::Intrinsic(i)) => {
                return Err(ExecutorError::invalid_argument(format!(
                    "intrinsic {i} is not supported by a leaf executor"
                )));
            }
            other => {
                return Err(ExecutorError::invalid_argument(format!(
                    "cannot call a value of kind {}",
                    other.kind()
                )));
            }
        };
        let argument = argument.map(|a| self.lookup(a).cloned()).transpose()?;
        let result = function.call(argument)?;
        Ok(self.wrap(result))
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        let elements = elements
            .iter()
            .map(|(name, handle)| Ok((name.clone(), self.lookup(handle)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.wrap(Value::Struct(elements)))
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        match self.lookup(source)? {
            Value::Struct(elements) => {
                let (_, element) = elements.get(index).ok_or_else(|| {
                    ExecutorError::invalid_argument(format!(
                        "index {index} out of range for struct of {}",
                        elements.len()
                    ))
                })?;
                Ok(self.wrap(element.clone()))
            }
            other => Err(ExecutorError::invalid_argument(format!(
                "cannot select from a value of kind {}",
                other.kind()
            ))),
        }
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        self.lookup(value).cloned()
    }

    async fn close(&self) {}
}
