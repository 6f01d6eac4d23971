// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executor that forwards every operation to an executor service through a stub.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, ValueHandle, downcast_value};
use crate::placement::CardinalityMap;
use crate::remote::protocol::{Request, Response, ValueId};
use crate::remote::stub::RemoteStub;
use crate::value::Value;

/// A value held by the service on the other side of the stub.
///
/// Dropping the last handle disposes the remote value.
#[derive(Debug)]
pub struct RemoteValue {
    owner: ExecutorId,
    id: ValueId,
    stub: Weak<dyn RemoteStub>,
}

impl RemoteValue {
    pub fn id(&self) -> ValueId {
        self.id
    }
}

impl ExecutorValue for RemoteValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn owner(&self) -> ExecutorId {
        self.owner
    }
}

impl Drop for RemoteValue {
    fn drop(&mut self) {
        let Some(stub) = self.stub.upgrade() else {
            return;
        };
        if !stub.is_ready() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = stub.dispatch(Request::Dispose(vec![id])).await {
                tracing::debug!(value = %id, error = %e, "remote dispose failed");
            }
        });
    }
}

#[derive(Debug)]
pub struct RemoteExecutor {
    id: ExecutorId,
    stub: Arc<dyn RemoteStub>,
    closed: AtomicBool,
}

impl RemoteExecutor {
    pub fn new(stub: Box<dyn RemoteStub>) -> Self {
        Self {
            id: ExecutorId::next(),
            stub: Arc::from(stub),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.stub.endpoint()
    }

    pub async fn connect(&self) -> Result<()> {
        self.stub.connect().await
    }

    /// Select the stack the service runs requests against.
    pub async fn set_cardinalities(&self, cardinalities: &CardinalityMap) -> Result<()> {
        match self
            .dispatch(Request::SetCardinalities(cardinalities.clone()))
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected("set_cardinalities", &other)),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::closed(format!(
                "remote executor for {}",
                self.stub.endpoint()
            )));
        }
        if !self.stub.is_ready() {
            return Err(ExecutorError::connectivity(
                self.stub.endpoint(),
                format!("stub not ready for {}", request.name()),
            ));
        }
        self.stub.dispatch(request).await
    }

    fn remote_id(&self, handle: &ValueHandle) -> Result<ValueId> {
        downcast_value::<RemoteValue>(handle, self.id, "remote").map(RemoteValue::id)
    }

    async fn create(&self, request: Request) -> Result<ValueHandle> {
        let operation = request.name();
        match self.dispatch(request).await? {
            Response::Created(id) => Ok(Arc::new(RemoteValue {
                owner: self.id,
                id,
                stub: Arc::downgrade(&self.stub),
            })),
            other => Err(unexpected(operation, &other)),
        }
    }
}

fn unexpected(operation: &str, response: &Response) -> ExecutorError {
    ExecutorError::Internal(format!("unexpected response to {operation}: {response:?}"))
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        self.create(Request::CreateValue(value)).await
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        let function = self.remote_id(function)?;
        let argument = argument.map(|a| self.remote_id(a)).transpose()?;
        self.create(Request::CreateCall { function, argument })
            .await
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        let elements = elements
            .iter()
            .map(|(name, handle)| Ok((name.clone(), self.remote_id(handle)?)))
            .collect::<Result<Vec<_>>>()?;
        self.create(Request::CreateStruct(elements)).await
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        let source = self.remote_id(source)?;
        self.create(Request::CreateSelection { source, index })
            .await
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        let id = self.remote_id(value)?;
        match self.dispatch(Request::Compute(id)).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected("compute", &other)),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stub.is_ready() {
            if let Err(e) = self.stub.dispatch(Request::Clear).await {
                tracing::debug!(endpoint = self.stub.endpoint(), error = %e, "clear on close failed");
            }
        }
        self.stub.close().await;
    }
}
