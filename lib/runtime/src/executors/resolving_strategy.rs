// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flat strategy: one directly addressed executor per participant.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::config::PartialFailurePolicy;
use crate::error::{ExecutorError, ParticipantRange, Result};
use crate::executor::{Executor, ValueHandle};
use crate::executors::federating::{
    AggregateFns, BranchFailure, FederatingStrategy, PlacedValue, fold_at, join_branches,
    single_member,
};
use crate::placement::Placement;
use crate::value::{Computation, Value};

#[derive(Debug)]
pub struct ResolvingStrategy {
    coordinator: Arc<dyn Executor>,
    participants: Vec<Arc<dyn Executor>>,
    /// Absolute index of the first participant.
    offset: usize,
    policy: PartialFailurePolicy,
}

impl ResolvingStrategy {
    pub fn new(
        coordinator: Arc<dyn Executor>,
        participants: Vec<Arc<dyn Executor>>,
        offset: usize,
        policy: PartialFailurePolicy,
    ) -> Self {
        Self {
            coordinator,
            participants,
            offset,
            policy,
        }
    }

    fn range_of(&self, index: usize) -> ParticipantRange {
        ParticipantRange::single(self.offset + index)
    }

    fn check_members(&self, value: &PlacedValue) -> Result<()> {
        if value.members.len() != self.participants.len() {
            return Err(ExecutorError::invalid_argument(format!(
                "value has {} members, stack has {} participants",
                value.members.len(),
                self.participants.len()
            )));
        }
        Ok(())
    }

    async fn create_everywhere(&self, values: Vec<Value>) -> Result<Vec<ValueHandle>> {
        let branches = self
            .participants
            .iter()
            .zip(values)
            .enumerate()
            .map(|(i, (participant, value))| {
                (self.range_of(i), async move { participant.create_value(value).await })
            })
            .collect();
        join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)
    }
}

#[async_trait]
impl FederatingStrategy for ResolvingStrategy {
    fn kind(&self) -> &'static str {
        "resolving"
    }

    fn coordinator(&self) -> &Arc<dyn Executor> {
        &self.coordinator
    }

    fn participants(&self) -> usize {
        self.participants.len()
    }

    async fn ingest(&self, all_equal: bool, members: Vec<Value>) -> Result<PlacedValue> {
        let n = self.participants.len();
        let values = if all_equal {
            if n == 0 && members.is_empty() {
                Vec::new()
            } else {
                vec![single_member(members, Placement::Clients)?; n]
            }
        } else {
            if members.len() != n {
                return Err(ExecutorError::invalid_argument(format!(
                    "expected {n} participant values, got {}",
                    members.len()
                )));
            }
            members
        };
        Ok(PlacedValue {
            all_equal,
            members: self.create_everywhere(values).await?,
        })
    }

    async fn broadcast(&self, value: Value) -> Result<PlacedValue> {
        let values = vec![value; self.participants.len()];
        Ok(PlacedValue {
            all_equal: true,
            members: self.create_everywhere(values).await?,
        })
    }

    async fn map(&self, function: &Computation, value: &PlacedValue) -> Result<PlacedValue> {
        self.check_members(value)?;
        let branches = self
            .participants
            .iter()
            .zip(&value.members)
            .enumerate()
            .map(|(i, (participant, member))| {
                let function = Value::Function(function.clone());
                (self.range_of(i), async move {
                    let function = participant.create_value(function).await?;
                    participant.create_call(&function, Some(member)).await
                })
            })
            .collect();
        let members = join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)?;
        Ok(PlacedValue {
            all_equal: false,
            members,
        })
    }

    async fn select(&self, value: &PlacedValue, index: usize) -> Result<PlacedValue> {
        self.check_members(value)?;
        let branches = self
            .participants
            .iter()
            .zip(&value.members)
            .enumerate()
            .map(|(i, (participant, member))| {
                (self.range_of(i), async move {
                    participant.create_selection(member, index).await
                })
            })
            .collect();
        let members = join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)?;
        Ok(PlacedValue {
            all_equal: value.all_equal,
            members,
        })
    }

    async fn materialize(&self, value: &PlacedValue) -> Result<Vec<Value>> {
        self.check_members(value)?;
        let branches = self
            .participants
            .iter()
            .zip(&value.members)
            .enumerate()
            .map(|(i, (participant, member))| {
                (self.range_of(i), async move { participant.materialize(member).await })
            })
            .collect();
        join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)
    }

    async fn aggregate(&self, value: &PlacedValue, fns: &AggregateFns) -> Result<ValueHandle> {
        self.check_members(value)?;
        let branches = self
            .participants
            .iter()
            .zip(&value.members)
            .enumerate()
            .map(|(i, (participant, member))| {
                (self.range_of(i), async move { participant.materialize(member).await })
            })
            .collect();

        match join_branches(self.policy, branches).await {
            Ok(values) => {
                fold_at(
                    &self.coordinator,
                    &fns.zero,
                    &fns.accumulate,
                    values,
                    Some(&fns.report),
                )
                .await
            }
            Err(BranchFailure { error, completed }) => {
                if self.policy == PartialFailurePolicy::BestEffort {
                    tracing::warn!(%error, healthy = completed.len(), "aggregating healthy participants only");
                    let partial = fold_at(
                        &self.coordinator,
                        &fns.zero,
                        &fns.accumulate,
                        completed,
                        Some(&fns.report),
                    )
                    .await;
                    if let Ok(partial) = partial {
                        if let Ok(partial) = self.coordinator.materialize(&partial).await {
                            return Err(error.with_partial(partial));
                        }
                    }
                }
                Err(error)
            }
        }
    }

    async fn close(&self) {
        join_all(self.participants.iter().map(|p| p.close())).await;
        self.coordinator.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::eager::EagerExecutor;
    use crate::executors::federating::FederatingExecutor;
    use crate::value::{Intrinsic, LeafFunction};

    fn federating(n: usize, policy: PartialFailurePolicy) -> FederatingExecutor {
        let participants = (0..n)
            .map(|_| Arc::new(EagerExecutor::new()) as Arc<dyn Executor>)
            .collect();
        let strategy = ResolvingStrategy::new(Arc::new(EagerExecutor::new()), participants, 0, policy);
        FederatingExecutor::new(Arc::new(strategy))
    }

    fn sum() -> Value {
        Value::function("sum", |arg| {
            let (a, b) = arg
                .ok_or_else(|| ExecutorError::invalid_argument("sum needs a pair"))?
                .into_pair()?;
            Ok(Value::Int(a.as_int()? + b.as_int()?))
        })
    }

    fn identity() -> Value {
        Value::Function(Computation::Function(Arc::new(LeafFunction::identity())))
    }

    async fn aggregate(ex: &FederatingExecutor, value: &ValueHandle) -> Result<Value> {
        let aggregate = ex
            .create_value(Value::intrinsic(Intrinsic::FederatedAggregate))
            .await?;
        let zero = ex.create_value(Value::Int(0)).await?;
        let accumulate = ex.create_value(sum()).await?;
        let merge = ex.create_value(sum()).await?;
        let report = ex.create_value(identity()).await?;
        let arg = ex
            .create_struct(vec![
                (None, value.clone()),
                (None, zero),
                (None, accumulate),
                (None, merge),
                (None, report),
            ])
            .await?;
        let result = ex.create_call(&aggregate, Some(&arg)).await?;
        ex.materialize(&result).await
    }

    #[tokio::test]
    async fn test_aggregate_of_three_participants() {
        let ex = federating(3, PartialFailurePolicy::AbortAll);
        let values = ex
            .create_value(Value::at_clients(vec![1.into(), 2.into(), 3.into()]))
            .await
            .unwrap();
        assert_eq!(
            aggregate(&ex, &values).await.unwrap(),
            Value::at_server(Value::Int(6))
        );
    }

    #[tokio::test]
    async fn test_zero_participants_aggregate_reports_zero() {
        let ex = federating(0, PartialFailurePolicy::AbortAll);
        let values = ex.create_value(Value::at_clients(vec![])).await.unwrap();
        assert_eq!(
            aggregate(&ex, &values).await.unwrap(),
            Value::at_server(Value::Int(0))
        );
    }

    #[tokio::test]
    async fn test_broadcast_then_map() {
        let ex = federating(4, PartialFailurePolicy::AbortAll);
        let server = ex
            .create_value(Value::at_server(Value::Int(10)))
            .await
            .unwrap();
        let broadcast = ex
            .create_value(Value::intrinsic(Intrinsic::FederatedBroadcast))
            .await
            .unwrap();
        let everywhere = ex.create_call(&broadcast, Some(&server)).await.unwrap();
        assert_eq!(
            ex.materialize(&everywhere).await.unwrap(),
            Value::Federated {
                placement: Placement::Clients,
                all_equal: true,
                members: vec![Value::Int(10)],
            }
        );

        let inc = ex
            .create_value(Value::function("inc", |arg| {
                Ok(Value::Int(
                    arg.ok_or_else(|| ExecutorError::invalid_argument("missing"))?
                        .as_int()?
                        + 1,
                ))
            }))
            .await
            .unwrap();
        let map = ex
            .create_value(Value::intrinsic(Intrinsic::FederatedMap))
            .await
            .unwrap();
        let arg = ex
            .create_struct(vec![(None, inc), (None, everywhere)])
            .await
            .unwrap();
        let mapped = ex.create_call(&map, Some(&arg)).await.unwrap();
        assert_eq!(
            ex.materialize(&mapped).await.unwrap(),
            Value::at_clients(vec![Value::Int(11); 4])
        );
    }

    #[tokio::test]
    async fn test_map_failure_names_participant() {
        let ex = federating(3, PartialFailurePolicy::AbortAll);
        let values = ex
            .create_value(Value::at_clients(vec![1.into(), 0.into(), 3.into()]))
            .await
            .unwrap();
        let invert = ex
            .create_value(Value::function("invert", |arg| {
                let v = arg
                    .ok_or_else(|| ExecutorError::invalid_argument("missing"))?
                    .as_int()?;
                if v == 0 {
                    return Err(ExecutorError::computation("division by zero"));
                }
                Ok(Value::Int(100 / v))
            }))
            .await
            .unwrap();
        let map = ex
            .create_value(Value::intrinsic(Intrinsic::FederatedMap))
            .await
            .unwrap();
        let arg = ex
            .create_struct(vec![(None, invert), (None, values)])
            .await
            .unwrap();
        let err = ex.create_call(&map, Some(&arg)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::RangeFailed { .. }));
        assert_eq!(err.range(), Some(&ParticipantRange::single(1)));
    }

    #[tokio::test]
    async fn test_ingest_checks_member_count() {
        let ex = federating(3, PartialFailurePolicy::AbortAll);
        assert!(matches!(
            ex.create_value(Value::at_clients(vec![1.into()])).await,
            Err(ExecutorError::InvalidArgument(_))
        ));
    }
}
