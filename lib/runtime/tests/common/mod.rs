// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for executor stack integration tests.

#![allow(dead_code)]

mod switchboard;

use fedexec_runtime::executor::{Executor, ValueHandle};
use fedexec_runtime::{Intrinsic, Result, Value};

pub use switchboard::SwitchboardLeaves;

/// Binary integer addition over a pair.
pub fn sum() -> Value {
    Value::function("sum", |arg| {
        let (a, b) = arg
            .ok_or_else(|| fedexec_runtime::ExecutorError::invalid_argument("sum needs a pair"))?
            .into_pair()?;
        Ok(Value::Int(a.as_int()? + b.as_int()?))
    })
}

pub fn identity() -> Value {
    Value::Function(fedexec_runtime::Computation::Function(std::sync::Arc::new(
        fedexec_runtime::LeafFunction::identity(),
    )))
}

pub fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(Value::Int).collect()
}

pub async fn place(executor: &dyn Executor, members: Vec<Value>) -> Result<ValueHandle> {
    executor.create_value(Value::at_clients(members)).await
}

async fn call(
    executor: &dyn Executor,
    intrinsic: Intrinsic,
    arguments: Vec<ValueHandle>,
) -> Result<ValueHandle> {
    let function = executor.create_value(Value::intrinsic(intrinsic)).await?;
    let argument = executor
        .create_struct(arguments.into_iter().map(|a| (None, a)).collect())
        .await?;
    executor.create_call(&function, Some(&argument)).await
}

/// Sum a participant-placed integer value at the coordinator.
pub async fn aggregate_sum(executor: &dyn Executor, placed: &ValueHandle) -> Result<i64> {
    let zero = executor.create_value(Value::Int(0)).await?;
    let accumulate = executor.create_value(sum()).await?;
    let merge = executor.create_value(sum()).await?;
    let report = executor.create_value(identity()).await?;
    let result = call(
        executor,
        Intrinsic::FederatedAggregate,
        vec![placed.clone(), zero, accumulate, merge, report],
    )
    .await?;
    match executor.materialize(&result).await? {
        Value::Federated { members, .. } if members.len() == 1 => members[0].as_int(),
        other => panic!("aggregate returned {other:?}"),
    }
}

/// Apply `function` at every participant.
pub async fn map(
    executor: &dyn Executor,
    function: Value,
    placed: &ValueHandle,
) -> Result<ValueHandle> {
    let function = executor.create_value(function).await?;
    call(
        executor,
        Intrinsic::FederatedMap,
        vec![function, placed.clone()],
    )
    .await
}

/// Place `value` at the coordinator and broadcast it to every participant.
pub async fn broadcast(executor: &dyn Executor, value: Value) -> Result<ValueHandle> {
    let at_server = executor.create_value(Value::at_server(value)).await?;
    let function = executor
        .create_value(Value::intrinsic(Intrinsic::FederatedBroadcast))
        .await?;
    executor.create_call(&function, Some(&at_server)).await
}

/// Members of a materialized participant-placed value.
pub async fn members(executor: &dyn Executor, placed: &ValueHandle) -> Result<Vec<Value>> {
    match executor.materialize(placed).await? {
        Value::Federated { members, .. } => Ok(members),
        other => panic!("expected a federated value, got {other:?}"),
    }
}
