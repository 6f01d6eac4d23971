// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sequence layer.
//!
//! Sequences are held as lazy sources. `sequence_map` only records the mapping;
//! elements are produced one at a time through the inner executor when a
//! reduction or materialization pulls them.

use std::any::Any;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, ValueHandle, downcast_value};
use crate::value::{Computation, Intrinsic, Value};

#[derive(Debug, Clone)]
enum SequenceSource {
    Literal(Arc<Vec<Value>>),
    Mapped {
        /// Function handle of the inner executor.
        function: ValueHandle,
        source: Arc<SequenceSource>,
    },
}

#[derive(Debug)]
enum Payload {
    Inner(ValueHandle),
    Sequence(SequenceSource),
    Intrinsic(Intrinsic),
    Struct(Vec<(Option<String>, ValueHandle)>),
}

#[derive(Debug)]
pub struct SequenceValue {
    owner: ExecutorId,
    payload: Payload,
}

impl ExecutorValue for SequenceValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn owner(&self) -> ExecutorId {
        self.owner
    }
}

fn elements(inner: Arc<dyn Executor>, source: SequenceSource) -> BoxStream<'static, Result<ValueHandle>> {
    match source {
        SequenceSource::Literal(values) => literal_elements(inner, values).boxed(),
        SequenceSource::Mapped { function, source } => {
            let upstream = elements(inner.clone(), source.as_ref().clone());
            mapped_elements(inner, function, upstream).boxed()
        }
    }
}

fn literal_elements(
    inner: Arc<dyn Executor>,
    values: Arc<Vec<Value>>,
) -> impl Stream<Item = Result<ValueHandle>> + Send + 'static {
    try_stream! {
        for value in values.iter() {
            let handle = inner.create_value(value.clone()).await?;
            yield handle;
        }
    }
}

fn mapped_elements(
    inner: Arc<dyn Executor>,
    function: ValueHandle,
    upstream: BoxStream<'static, Result<ValueHandle>>,
) -> impl Stream<Item = Result<ValueHandle>> + Send + 'static {
    try_stream! {
        for await element in upstream {
            let element = element?;
            let mapped = inner.create_call(&function, Some(&element)).await?;
            yield mapped;
        }
    }
}

#[derive(Debug)]
pub struct SequenceExecutor {
    id: ExecutorId,
    inner: Arc<dyn Executor>,
}

impl SequenceExecutor {
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self {
            id: ExecutorId::next(),
            inner,
        }
    }

    fn wrap(&self, payload: Payload) -> ValueHandle {
        Arc::new(SequenceValue {
            owner: self.id,
            payload,
        })
    }

    fn payload<'a>(&self, handle: &'a ValueHandle) -> Result<&'a Payload> {
        downcast_value::<SequenceValue>(handle, self.id, "sequence").map(|v| &v.payload)
    }

    fn inner_only<'a>(&self, handle: &'a ValueHandle, what: &str) -> Result<&'a ValueHandle> {
        match self.payload(handle)? {
            Payload::Inner(h) => Ok(h),
            _ => Err(ExecutorError::invalid_argument(format!(
                "{what} must be a plain value"
            ))),
        }
    }

    fn sequence_of<'a>(&self, handle: &'a ValueHandle) -> Result<&'a SequenceSource> {
        match self.payload(handle)? {
            Payload::Sequence(source) => Ok(source),
            _ => Err(ExecutorError::invalid_argument("expected a sequence")),
        }
    }

    fn struct_members<'a>(
        &self,
        handle: Option<&'a ValueHandle>,
        arity: usize,
        intrinsic: Intrinsic,
    ) -> Result<&'a [(Option<String>, ValueHandle)]> {
        let payload = match handle {
            Some(h) => self.payload(h)?,
            None => {
                return Err(ExecutorError::invalid_argument(format!(
                    "{intrinsic} requires an argument"
                )));
            }
        };
        match payload {
            Payload::Struct(members) if members.len() == arity => Ok(members),
            _ => Err(ExecutorError::invalid_argument(format!(
                "{intrinsic} expects a struct of {arity} elements"
            ))),
        }
    }

    /// Move a value of this layer into the inner executor, collecting any sequence.
    async fn lower(&self, handle: &ValueHandle) -> Result<ValueHandle> {
        match self.payload(handle)? {
            Payload::Inner(h) => Ok(h.clone()),
            Payload::Intrinsic(i) => self.inner.create_value(Value::intrinsic(*i)).await,
            Payload::Sequence(_) | Payload::Struct(_) => {
                let value = self.materialize(handle).await?;
                self.inner.create_value(value).await
            }
        }
    }

    async fn sequence_map(&self, argument: Option<&ValueHandle>) -> Result<ValueHandle> {
        let members = self.struct_members(argument, 2, Intrinsic::SequenceMap)?;
        let function = self.inner_only(&members[0].1, "the mapping function")?.clone();
        let source = self.sequence_of(&members[1].1)?.clone();
        Ok(self.wrap(Payload::Sequence(SequenceSource::Mapped {
            function,
            source: Arc::new(source),
        })))
    }

    async fn sequence_reduce(&self, argument: Option<&ValueHandle>) -> Result<ValueHandle> {
        let members = self.struct_members(argument, 3, Intrinsic::SequenceReduce)?;
        let source = self.sequence_of(&members[0].1)?.clone();
        let mut accumulator = self.lower(&members[1].1).await?;
        let op = self.inner_only(&members[2].1, "the reduction operator")?;

        let mut stream = elements(self.inner.clone(), source);
        while let Some(element) = stream.next().await {
            let pair = self
                .inner
                .create_struct(vec![(None, accumulator), (None, element?)])
                .await?;
            accumulator = self.inner.create_call(op, Some(&pair)).await?;
        }
        Ok(self.wrap(Payload::Inner(accumulator)))
    }
}

#[async_trait]
impl Executor for SequenceExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        match value {
            Value::Sequence(items) => Ok(self.wrap(Payload::Sequence(SequenceSource::Literal(
                Arc::new(items),
            )))),
            Value::Function(Computation::Intrinsic(i)) if !i.is_federated() => {
                Ok(self.wrap(Payload::Intrinsic(i)))
            }
            Value::Struct(elements)
                if elements
                    .iter()
                    .any(|(_, v)| matches!(v, Value::Sequence(_))) =>
            {
                let mut members = Vec::with_capacity(elements.len());
                for (name, element) in elements {
                    members.push((name, self.create_value(element).await?));
                }
                Ok(self.wrap(Payload::Struct(members)))
            }
            other => Ok(self.wrap(Payload::Inner(self.inner.create_value(other).await?))),
        }
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        match self.payload(function)? {
            Payload::Intrinsic(Intrinsic::SequenceMap) => self.sequence_map(argument).await,
            Payload::Intrinsic(Intrinsic::SequenceReduce) => self.sequence_reduce(argument).await,
            Payload::Intrinsic(other) => Err(ExecutorError::invalid_argument(format!(
                "intrinsic {other} is not handled by the sequence layer"
            ))),
            Payload::Inner(f) => {
                let argument = match argument {
                    Some(a) => Some(self.lower(a).await?),
                    None => None,
                };
                let result = self.inner.create_call(f, argument.as_ref()).await?;
                Ok(self.wrap(Payload::Inner(result)))
            }
            Payload::Sequence(_) | Payload::Struct(_) => Err(ExecutorError::invalid_argument(
                "cannot call a sequence or struct",
            )),
        }
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        let mut plain = Vec::with_capacity(elements.len());
        for (name, handle) in &elements {
            match self.payload(handle)? {
                Payload::Inner(h) => plain.push((name.clone(), h.clone())),
                _ => return Ok(self.wrap(Payload::Struct(elements))),
            }
        }
        let inner = self.inner.create_struct(plain).await?;
        Ok(self.wrap(Payload::Inner(inner)))
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        match self.payload(source)? {
            Payload::Inner(h) => {
                let selected = self.inner.create_selection(h, index).await?;
                Ok(self.wrap(Payload::Inner(selected)))
            }
            Payload::Struct(members) => members
                .get(index)
                .map(|(_, h)| h.clone())
                .ok_or_else(|| {
                    ExecutorError::invalid_argument(format!(
                        "index {index} out of range for struct of {}",
                        members.len()
                    ))
                }),
            _ => Err(ExecutorError::invalid_argument(
                "selection requires a struct",
            )),
        }
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        match self.payload(value)? {
            Payload::Inner(h) => self.inner.materialize(h).await,
            Payload::Intrinsic(i) => Ok(Value::intrinsic(*i)),
            Payload::Sequence(source) => {
                let mut stream = elements(self.inner.clone(), source.clone());
                let mut items = Vec::new();
                while let Some(element) = stream.next().await {
                    items.push(self.inner.materialize(&element?).await?);
                }
                Ok(Value::Sequence(items))
            }
            Payload::Struct(members) => {
                let mut elements = Vec::with_capacity(members.len());
                for (name, handle) in members {
                    elements.push((name.clone(), self.materialize(handle).await?));
                }
                Ok(Value::Struct(elements))
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::eager::EagerExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> SequenceExecutor {
        SequenceExecutor::new(Arc::new(EagerExecutor::new()))
    }

    fn sum() -> Value {
        Value::function("sum", |arg| {
            let (a, b) = arg
                .ok_or_else(|| ExecutorError::invalid_argument("sum needs a pair"))?
                .into_pair()?;
            Ok(Value::Int(a.as_int()? + b.as_int()?))
        })
    }

    fn ints(range: std::ops::Range<i64>) -> Value {
        Value::Sequence(range.map(Value::Int).collect())
    }

    #[tokio::test]
    async fn test_map_is_lazy_until_reduced() {
        let ex = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let double = ex
            .create_value(Value::function("double", move |arg| {
                counted.fetch_add(1, Ordering::SeqCst);
                let v = arg
                    .ok_or_else(|| ExecutorError::invalid_argument("missing"))?
                    .as_int()?;
                Ok(Value::Int(v * 2))
            }))
            .await
            .unwrap();
        let seq = ex.create_value(ints(1..5)).await.unwrap();
        let map = ex
            .create_value(Value::intrinsic(Intrinsic::SequenceMap))
            .await
            .unwrap();
        let arg = ex
            .create_struct(vec![(None, double), (None, seq)])
            .await
            .unwrap();
        let mapped = ex.create_call(&map, Some(&arg)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let reduce = ex
            .create_value(Value::intrinsic(Intrinsic::SequenceReduce))
            .await
            .unwrap();
        let zero = ex.create_value(Value::Int(0)).await.unwrap();
        let op = ex.create_value(sum()).await.unwrap();
        let arg = ex
            .create_struct(vec![(None, mapped), (None, zero), (None, op)])
            .await
            .unwrap();
        let total = ex.create_call(&reduce, Some(&arg)).await.unwrap();

        assert_eq!(ex.materialize(&total).await.unwrap(), Value::Int(20));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_materialize_sequence() {
        let ex = executor();
        let seq = ex.create_value(ints(0..3)).await.unwrap();
        assert_eq!(ex.materialize(&seq).await.unwrap(), ints(0..3));
    }

    #[tokio::test]
    async fn test_reduce_of_empty_sequence_is_zero() {
        let ex = executor();
        let reduce = ex
            .create_value(Value::intrinsic(Intrinsic::SequenceReduce))
            .await
            .unwrap();
        let arg = ex
            .create_value(Value::tuple([ints(0..0), Value::Int(11), sum()]))
            .await
            .unwrap();
        let out = ex.create_call(&reduce, Some(&arg)).await.unwrap();
        assert_eq!(ex.materialize(&out).await.unwrap(), Value::Int(11));
    }

    #[tokio::test]
    async fn test_leaf_function_receives_collected_sequence() {
        let ex = executor();
        let len = ex
            .create_value(Value::function("len", |arg| match arg {
                Some(Value::Sequence(items)) => Ok(Value::Int(items.len() as i64)),
                _ => Err(ExecutorError::invalid_argument("expected a sequence")),
            }))
            .await
            .unwrap();
        let seq = ex.create_value(ints(0..6)).await.unwrap();
        let out = ex.create_call(&len, Some(&seq)).await.unwrap();
        assert_eq!(ex.materialize(&out).await.unwrap(), Value::Int(6));
    }
}
