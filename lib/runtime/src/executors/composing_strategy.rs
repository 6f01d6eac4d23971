// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Composed strategy: participants are served by child stacks, each covering a
//! contiguous range.
//!
//! Every operation is re-expressed as the same federated intrinsic on each child
//! and the per-child results are combined, so a composed stack is observably the
//! same as a flat one. Aggregation runs in two levels: children fold their own
//! participants with `accumulate` and an identity report, then the coordinator
//! folds the child results with `merge` and applies `report` once.

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
use crate::value::{Computation, Intrinsic, LeafFunction, Value};

/// A child stack and the absolute participant range it serves.
#[derive(Debug, Clone)]
pub struct ChildStack {
    pub range: ParticipantRange,
    pub executor: Arc<dyn Executor>,
}

#[derive(Debug)]
pub struct ComposingStrategy {
    coordinator: Arc<dyn Executor>,
    children: Vec<ChildStack>,
    policy: PartialFailurePolicy,
}

impl ComposingStrategy {
    /// `children` must cover contiguous, disjoint ranges in ascending order.
    pub fn new(
        coordinator: Arc<dyn Executor>,
        children: Vec<ChildStack>,
        policy: PartialFailurePolicy,
    ) -> Result<Self> {
        for pair in children.windows(2) {
            if pair[0].range.end != pair[1].range.start {
                return Err(ExecutorError::construction(
                    format!(
                        "child ranges {} and {} are not contiguous",
                        pair[0].range, pair[1].range
                    ),
                    None,
                ));
            }
        }
        Ok(Self {
            coordinator,
            children,
            policy,
        })
    }

    pub fn children(&self) -> &[ChildStack] {
        &self.children
    }

    fn check_members(&self, value: &PlacedValue) -> Result<()> {
        if value.members.len() != self.children.len() {
            return Err(ExecutorError::invalid_argument(format!(
                "value has {} members, stack has {} children",
                value.members.len(),
                self.children.len()
            )));
        }
        Ok(())
    }

    async fn call_on_child(
        child: &Arc<dyn Executor>,
        intrinsic: Intrinsic,
        arguments: Vec<ValueHandle>,
    ) -> Result<ValueHandle> {
        let function = child.create_value(Value::intrinsic(intrinsic)).await?;
        let argument = match arguments.len() {
            1 => arguments.into_iter().next(),
            _ => Some(
                child
                    .create_struct(arguments.into_iter().map(|a| (None, a)).collect())
                    .await?,
            ),
        };
        child.create_call(&function, argument.as_ref()).await
    }

    async fn create_in_children(&self, values: Vec<Value>) -> Result<Vec<ValueHandle>> {
        let branches = self
            .children
            .iter()
            .zip(values)
            .map(|(child, value)| {
                (child.range.clone(), async move {
                    child.executor.create_value(value).await
                })
            })
            .collect();
        join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)
    }

    /// Aggregate inside one child, returning the unreported partial result.
    async fn aggregate_child(
        child: &ChildStack,
        member: &ValueHandle,
        fns: &AggregateFns,
        identity: &Computation,
    ) -> Result<Value> {
        let executor = &child.executor;
        let zero = executor.create_value(fns.zero.clone()).await?;
        let accumulate = executor
            .create_value(Value::Function(fns.accumulate.clone()))
            .await?;
        let merge = executor
            .create_value(Value::Function(fns.merge.clone()))
            .await?;
        let report = executor
            .create_value(Value::Function(identity.clone()))
            .await?;
        let result = Self::call_on_child(
            executor,
            Intrinsic::FederatedAggregate,
            vec![member.clone(), zero, accumulate, merge, report],
        )
        .await?;
        match executor.materialize(&result).await? {
            Value::Federated {
                placement: Placement::Server,
                members,
                ..
            } => single_member(members, Placement::Server),
            other => Err(ExecutorError::Internal(format!(
                "child aggregate returned {}",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl FederatingStrategy for ComposingStrategy {
    fn kind(&self) -> &'static str {
        "composing"
    }

    fn coordinator(&self) -> &Arc<dyn Executor> {
        &self.coordinator
    }

    fn participants(&self) -> usize {
        self.children.iter().map(|c| c.range.len()).sum()
    }

    async fn ingest(&self, all_equal: bool, members: Vec<Value>) -> Result<PlacedValue> {
        let values = if all_equal && self.children.is_empty() && members.is_empty() {
            Vec::new()
        } else if all_equal {
            let member = single_member(members, Placement::Clients)?;
            self.children
                .iter()
                .map(|_| Value::Federated {
                    placement: Placement::Clients,
                    all_equal: true,
                    members: vec![member.clone()],
                })
                .collect()
        } else {
            let n = self.participants();
            if members.len() != n {
                return Err(ExecutorError::invalid_argument(format!(
                    "expected {n} participant values, got {}",
                    members.len()
                )));
            }
            let mut members = members.into_iter();
            self.children
                .iter()
                .map(|child| Value::at_clients(members.by_ref().take(child.range.len()).collect()))
                .collect()
        };
        Ok(PlacedValue {
            all_equal,
            members: self.create_in_children(values).await?,
        })
    }

    async fn broadcast(&self, value: Value) -> Result<PlacedValue> {
        let branches = self
            .children
            .iter()
            .map(|child| {
                let value = value.clone();
                (child.range.clone(), async move {
                    let server = child.executor.create_value(Value::at_server(value)).await?;
                    Self::call_on_child(&child.executor, Intrinsic::FederatedBroadcast, vec![server])
                        .await
                })
            })
            .collect();
        let members = join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)?;
        Ok(PlacedValue {
            all_equal: true,
            members,
        })
    }

    async fn map(&self, function: &Computation, value: &PlacedValue) -> Result<PlacedValue> {
        self.check_members(value)?;
        let branches = self
            .children
            .iter()
            .zip(&value.members)
            .map(|(child, member)| {
                let function = Value::Function(function.clone());
                (child.range.clone(), async move {
                    let function = child.executor.create_value(function).await?;
                    Self::call_on_child(
                        &child.executor,
                        Intrinsic::FederatedMap,
                        vec![function, member.clone()],
                    )
                    .await
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
            .children
            .iter()
            .zip(&value.members)
            .map(|(child, member)| {
                (child.range.clone(), async move {
                    child.executor.create_selection(member, index).await
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
            .children
            .iter()
            .zip(&value.members)
            .map(|(child, member)| {
                (child.range.clone(), async move {
                    match child.executor.materialize(member).await? {
                        Value::Federated {
                            placement: Placement::Clients,
                            all_equal,
                            members,
                        } => {
                            if all_equal {
                                let member = single_member(members, Placement::Clients)?;
                                Ok(vec![member; child.range.len()])
                            } else if members.len() == child.range.len() {
                                Ok(members)
                            } else {
                                Err(ExecutorError::Internal(format!(
                                    "child returned {} values for {} participants",
                                    members.len(),
                                    child.range.len()
                                )))
                            }
                        }
                        other => Err(ExecutorError::Internal(format!(
                            "child materialized {} instead of a participant value",
                            other.kind()
                        ))),
                    }
                })
            })
            .collect();
        let per_child = join_branches(self.policy, branches)
            .await
            .map_err(|failure| failure.error)?;
        Ok(per_child.into_iter().flatten().collect())
    }

    async fn aggregate(&self, value: &PlacedValue, fns: &AggregateFns) -> Result<ValueHandle> {
        self.check_members(value)?;
        let identity = Computation::Function(Arc::new(LeafFunction::identity()));
        let branches = self
            .children
            .iter()
            .zip(&value.members)
            .map(|(child, member)| {
                let identity = &identity;
                (child.range.clone(), async move {
                    Self::aggregate_child(child, member, fns, identity).await
                })
            })
            .collect();

        match join_branches(self.policy, branches).await {
            Ok(partials) => {
                fold_at(
                    &self.coordinator,
                    &fns.zero,
                    &fns.merge,
                    partials,
                    Some(&fns.report),
                )
                .await
            }
            Err(BranchFailure { error, completed }) => {
                if self.policy == PartialFailurePolicy::BestEffort {
                    tracing::warn!(
                        %error,
                        healthy_children = completed.len(),
                        "reporting partial aggregate"
                    );
                    let partial = fold_at(
                        &self.coordinator,
                        &fns.zero,
                        &fns.merge,
                        completed,
                        Some(&fns.report),
                    )
                    .await;
                    if let Ok(partial) = partial {
                        if let Ok(partial) = self.coordinator.materialize(&partial).await {
                            return Err(error.with_partial(partial));
                        }
                    }
                } else if error.indicates_participant_loss() {
                    tracing::warn!(%error, "participant loss during aggregate");
                }
                Err(error)
            }
        }
    }

    async fn close(&self) {
        join_all(self.children.iter().map(|c| c.executor.close())).await;
        self.coordinator.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::eager::EagerExecutor;
    use crate::executors::federating::FederatingExecutor;
    use crate::executors::resolving_strategy::ResolvingStrategy;

    fn flat(range: ParticipantRange) -> Arc<dyn Executor> {
        let participants = range
            .as_range()
            .map(|_| Arc::new(EagerExecutor::new()) as Arc<dyn Executor>)
            .collect();
        let strategy = ResolvingStrategy::new(
            Arc::new(EagerExecutor::new()),
            participants,
            range.start,
            PartialFailurePolicy::AbortAll,
        );
        Arc::new(FederatingExecutor::new(Arc::new(strategy)))
    }

    fn composed(sizes: &[usize]) -> FederatingExecutor {
        let mut start = 0;
        let children = sizes
            .iter()
            .map(|size| {
                let range = ParticipantRange::new(start, start + size);
                start += size;
                ChildStack {
                    executor: flat(range.clone()),
                    range,
                }
            })
            .collect();
        let strategy = ComposingStrategy::new(
            Arc::new(EagerExecutor::new()),
            children,
            PartialFailurePolicy::AbortAll,
        )
        .unwrap();
        FederatingExecutor::new(Arc::new(strategy))
    }

    #[test]
    fn test_rejects_gapped_children() {
        let children = vec![
            ChildStack {
                range: ParticipantRange::new(0, 2),
                executor: flat(ParticipantRange::new(0, 2)),
            },
            ChildStack {
                range: ParticipantRange::new(3, 4),
                executor: flat(ParticipantRange::new(3, 4)),
            },
        ];
        assert!(
            ComposingStrategy::new(
                Arc::new(EagerExecutor::new()),
                children,
                PartialFailurePolicy::AbortAll
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_ingest_and_materialize_preserve_order() {
        let ex = composed(&[2, 2, 1]);
        let values: Vec<Value> = (0..5).map(Value::Int).collect();
        let handle = ex
            .create_value(Value::at_clients(values.clone()))
            .await
            .unwrap();
        assert_eq!(
            ex.materialize(&handle).await.unwrap(),
            Value::at_clients(values)
        );
    }

    #[tokio::test]
    async fn test_all_equal_value_without_children() {
        let ex = composed(&[]);
        let empty = Value::Federated {
            placement: Placement::Clients,
            all_equal: true,
            members: vec![],
        };
        let handle = ex.create_value(empty.clone()).await.unwrap();
        assert_eq!(ex.materialize(&handle).await.unwrap(), empty);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_child() {
        let ex = composed(&[3, 3]);
        let value = ex
            .create_value(Value::at_server(Value::Str("model".into())))
            .await
            .unwrap();
        let broadcast = ex
            .create_value(Value::intrinsic(Intrinsic::FederatedBroadcast))
            .await
            .unwrap();
        let everywhere = ex.create_call(&broadcast, Some(&value)).await.unwrap();

        let strategy = ex.strategy();
        assert_eq!(strategy.participants(), 6);
        let members = match ex.materialize(&everywhere).await.unwrap() {
            Value::Federated {
                all_equal: true,
                members,
                ..
            } => members,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(members, vec![Value::Str("model".into())]);
    }
}
