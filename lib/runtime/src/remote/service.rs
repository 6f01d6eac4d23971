// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Serves [`Request`]s against a stack obtained from a local [`ExecutorFactory`].
//!
//! One service backs one remote session. Values created for the session are kept
//! in a table keyed by [`ValueId`] until the caller disposes of them, clears the
//! session or selects a different cardinality.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ValueHandle};
use crate::remote::protocol::{Request, Response, ValueId};
use crate::stacks::factory::{ExecutorFactory, ExecutorHandle};

#[derive(Debug)]
pub struct ExecutorService {
    factory: ExecutorFactory,
    executor: RwLock<Option<Arc<ExecutorHandle>>>,
    values: DashMap<ValueId, ValueHandle>,
}

impl ExecutorService {
    pub fn new(factory: ExecutorFactory) -> Self {
        Self {
            factory,
            executor: RwLock::new(None),
            values: DashMap::new(),
        }
    }

    pub fn factory(&self) -> &ExecutorFactory {
        &self.factory
    }

    /// Number of values held for the session.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    fn executor(&self) -> Result<Arc<ExecutorHandle>> {
        self.executor
            .read()
            .clone()
            .ok_or_else(|| ExecutorError::invalid_argument("cardinalities have not been set"))
    }

    fn value(&self, id: &ValueId) -> Result<ValueHandle> {
        self.values
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExecutorError::UnknownReference(id.to_string()))
    }

    fn insert(&self, handle: ValueHandle) -> Response {
        let id = ValueId::new();
        self.values.insert(id, handle);
        Response::Created(id)
    }

    pub async fn handle(&self, request: Request) -> Result<Response> {
        tracing::trace!(request = request.name(), "executor service request");
        match request {
            Request::SetCardinalities(cardinalities) => {
                let executor = Arc::new(self.factory.get_executor(&cardinalities).await?);
                let previous = self.executor.write().replace(executor);
                self.values.clear();
                if let Some(previous) = previous {
                    previous.close().await;
                }
                tracing::debug!(cardinalities = %cardinalities, "service stack selected");
                Ok(Response::Ack)
            }
            Request::CreateValue(value) => {
                let handle = self.executor()?.create_value(value).await?;
                Ok(self.insert(handle))
            }
            Request::CreateCall { function, argument } => {
                let function = self.value(&function)?;
                let argument = argument.map(|id| self.value(&id)).transpose()?;
                let handle = self
                    .executor()?
                    .create_call(&function, argument.as_ref())
                    .await?;
                Ok(self.insert(handle))
            }
            Request::CreateStruct(elements) => {
                let elements = elements
                    .into_iter()
                    .map(|(name, id)| Ok((name, self.value(&id)?)))
                    .collect::<Result<Vec<_>>>()?;
                let handle = self.executor()?.create_struct(elements).await?;
                Ok(self.insert(handle))
            }
            Request::CreateSelection { source, index } => {
                let source = self.value(&source)?;
                let handle = self.executor()?.create_selection(&source, index).await?;
                Ok(self.insert(handle))
            }
            Request::Compute(id) => {
                let value = self.value(&id)?;
                Ok(Response::Value(self.executor()?.materialize(&value).await?))
            }
            Request::Dispose(ids) => {
                for id in ids {
                    self.values.remove(&id);
                }
                Ok(Response::Ack)
            }
            Request::Clear => {
                self.close().await;
                Ok(Response::Ack)
            }
        }
    }

    /// Drop every value and release the selected stack.
    pub async fn close(&self) {
        self.values.clear();
        let executor = self.executor.write().take();
        if let Some(executor) = executor {
            executor.close().await;
        }
    }
}
