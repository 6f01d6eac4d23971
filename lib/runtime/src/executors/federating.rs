// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Federating executor.
//!
//! Interprets the federated intrinsics over two placements. Unplaced and
//! coordinator-placed values live on the strategy's coordinator executor;
//! participant-placed values are owned by the [`FederatingStrategy`], which
//! decides how participants are addressed (flat or composed).

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all, try_join_all};

use crate::config::PartialFailurePolicy;
use crate::error::{ExecutorError, ParticipantRange, Result};
use crate::executor::{Executor, ExecutorId, ExecutorValue, ValueHandle, downcast_value};
use crate::placement::Placement;
use crate::value::{Computation, Intrinsic, Value};

/// A participant-placed value as held by a strategy.
///
/// The meaning of `members` belongs to the strategy: one handle per participant
/// for a flat strategy, one handle per child stack for a composed one.
#[derive(Debug, Clone)]
pub struct PlacedValue {
    pub all_equal: bool,
    pub members: Vec<ValueHandle>,
}

/// Functions of a `federated_aggregate`, already resolved to host form.
#[derive(Debug, Clone)]
pub struct AggregateFns {
    pub zero: Value,
    pub accumulate: Computation,
    pub merge: Computation,
    pub report: Computation,
}

/// How a federating executor reaches its participants.
#[async_trait]
pub trait FederatingStrategy: Send + Sync + Debug {
    fn kind(&self) -> &'static str;

    fn coordinator(&self) -> &Arc<dyn Executor>;

    /// Number of participants served.
    fn participants(&self) -> usize;

    /// Place host values at the participants. `members` holds one value per
    /// participant, or a single value when `all_equal`.
    async fn ingest(&self, all_equal: bool, members: Vec<Value>) -> Result<PlacedValue>;

    async fn broadcast(&self, value: Value) -> Result<PlacedValue>;

    async fn map(&self, function: &Computation, value: &PlacedValue) -> Result<PlacedValue>;

    async fn select(&self, value: &PlacedValue, index: usize) -> Result<PlacedValue>;

    /// One host value per participant, in participant order.
    async fn materialize(&self, value: &PlacedValue) -> Result<Vec<Value>>;

    /// Fold every participant value into a coordinator value.
    async fn aggregate(&self, value: &PlacedValue, fns: &AggregateFns) -> Result<ValueHandle>;

    async fn close(&self);
}

/// Failure of a fan-out, with the results of the branches that completed.
#[derive(Debug)]
pub(crate) struct BranchFailure<T> {
    pub error: ExecutorError,
    pub completed: Vec<T>,
}

/// Run one future per participant range under the partial failure policy.
///
/// Futures are polled in the order given. Branch errors are scoped to the
/// branch's range.
pub(crate) async fn join_branches<T, F>(
    policy: PartialFailurePolicy,
    branches: Vec<(ParticipantRange, F)>,
) -> std::result::Result<Vec<T>, BranchFailure<T>>
where
    F: Future<Output = Result<T>>,
{
    let scoped = branches
        .into_iter()
        .map(|(range, branch)| async move { branch.await.map_err(|e| e.scoped_to(range)) });

    match policy {
        PartialFailurePolicy::AbortAll => try_join_all(scoped).await.map_err(|error| BranchFailure {
            error,
            completed: Vec::new(),
        }),
        PartialFailurePolicy::BestEffort => {
            let mut completed = Vec::new();
            let mut failure = None;
            for result in join_all(scoped).await {
                match result {
                    Ok(value) => completed.push(value),
                    Err(error) if failure.is_none() => failure = Some(error),
                    Err(error) => {
                        tracing::warn!(%error, "additional branch failure");
                    }
                }
            }
            match failure {
                None => Ok(completed),
                Some(error) => Err(BranchFailure { error, completed }),
            }
        }
    }
}

/// Fold `items` on `executor` with `op` starting from `zero`, then apply `report`.
pub(crate) async fn fold_at(
    executor: &Arc<dyn Executor>,
    zero: &Value,
    op: &Computation,
    items: Vec<Value>,
    report: Option<&Computation>,
) -> Result<ValueHandle> {
    let op = executor.create_value(Value::Function(op.clone())).await?;
    let mut accumulator = executor.create_value(zero.clone()).await?;
    for item in items {
        let item = executor.create_value(item).await?;
        let pair = executor
            .create_struct(vec![(None, accumulator), (None, item)])
            .await?;
        accumulator = executor.create_call(&op, Some(&pair)).await?;
    }
    if let Some(report) = report {
        let report = executor
            .create_value(Value::Function(report.clone()))
            .await?;
        accumulator = executor.create_call(&report, Some(&accumulator)).await?;
    }
    Ok(accumulator)
}

#[derive(Debug)]
enum Payload {
    /// Lives on the coordinator, not placed.
    Unplaced(ValueHandle),
    Function(Computation),
    /// Placed at the coordinator.
    Server(ValueHandle),
    Clients(PlacedValue),
    Struct(Vec<(Option<String>, ValueHandle)>),
}

#[derive(Debug)]
pub struct FederatedValue {
    owner: ExecutorId,
    payload: Payload,
}

impl ExecutorValue for FederatedValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn owner(&self) -> ExecutorId {
        self.owner
    }
}

#[derive(Debug)]
pub struct FederatingExecutor {
    id: ExecutorId,
    strategy: Arc<dyn FederatingStrategy>,
    closed: AtomicBool,
}

impl FederatingExecutor {
    pub fn new(strategy: Arc<dyn FederatingStrategy>) -> Self {
        Self {
            id: ExecutorId::next(),
            strategy,
            closed: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> &Arc<dyn FederatingStrategy> {
        &self.strategy
    }

    fn coordinator(&self) -> &Arc<dyn Executor> {
        self.strategy.coordinator()
    }

    fn wrap(&self, payload: Payload) -> ValueHandle {
        Arc::new(FederatedValue {
            owner: self.id,
            payload,
        })
    }

    fn payload<'a>(&self, handle: &'a ValueHandle) -> Result<&'a Payload> {
        downcast_value::<FederatedValue>(handle, self.id, "federating").map(|v| &v.payload)
    }

    fn members<'a>(
        &self,
        argument: Option<&'a ValueHandle>,
        arity: usize,
        intrinsic: Intrinsic,
    ) -> Result<&'a [(Option<String>, ValueHandle)]> {
        let payload = match argument {
            Some(handle) => self.payload(handle)?,
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

    fn single<'a>(&self, argument: Option<&'a ValueHandle>, intrinsic: Intrinsic) -> Result<&'a Payload> {
        match argument {
            Some(handle) => self.payload(handle),
            None => Err(ExecutorError::invalid_argument(format!(
                "{intrinsic} requires an argument"
            ))),
        }
    }

    /// Move an unplaced value onto the coordinator.
    fn lower<'a>(&'a self, handle: &'a ValueHandle) -> BoxFuture<'a, Result<ValueHandle>> {
        async move {
            match self.payload(handle)? {
                Payload::Unplaced(h) => Ok(h.clone()),
                Payload::Function(c) => {
                    self.coordinator()
                        .create_value(Value::Function(c.clone()))
                        .await
                }
                Payload::Struct(members) => {
                    let mut lowered = Vec::with_capacity(members.len());
                    for (name, member) in members {
                        lowered.push((name.clone(), self.lower(member).await?));
                    }
                    self.coordinator().create_struct(lowered).await
                }
                Payload::Server(_) | Payload::Clients(_) => Err(ExecutorError::invalid_argument(
                    "placed values cannot be used as unplaced arguments",
                )),
            }
        }
        .boxed()
    }

    /// Host form of an unplaced value.
    async fn host_value(&self, handle: &ValueHandle) -> Result<Value> {
        match self.payload(handle)? {
            Payload::Server(_) | Payload::Clients(_) => Err(ExecutorError::invalid_argument(
                "expected an unplaced value",
            )),
            _ => self.materialize(handle).await,
        }
    }

    async fn computation(&self, handle: &ValueHandle) -> Result<Computation> {
        match self.host_value(handle).await? {
            Value::Function(c) => Ok(c),
            other => Err(ExecutorError::invalid_argument(format!(
                "expected a function, got {}",
                other.kind()
            ))),
        }
    }

    async fn coordinator_function(&self, handle: &ValueHandle) -> Result<ValueHandle> {
        match self.payload(handle)? {
            Payload::Function(_) | Payload::Unplaced(_) => self.lower(handle).await,
            _ => Err(ExecutorError::invalid_argument("expected a function")),
        }
    }

    async fn call_intrinsic(
        &self,
        intrinsic: Intrinsic,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        tracing::trace!(%intrinsic, "federated call");
        match intrinsic {
            Intrinsic::FederatedValue(Placement::Server) => {
                let handle = argument.ok_or_else(|| {
                    ExecutorError::invalid_argument(format!("{intrinsic} requires an argument"))
                })?;
                Ok(self.wrap(Payload::Server(self.lower(handle).await?)))
            }
            Intrinsic::FederatedValue(Placement::Clients) => {
                let handle = argument.ok_or_else(|| {
                    ExecutorError::invalid_argument(format!("{intrinsic} requires an argument"))
                })?;
                let value = self.host_value(handle).await?;
                Ok(self.wrap(Payload::Clients(self.strategy.broadcast(value).await?)))
            }
            Intrinsic::FederatedBroadcast => match self.single(argument, intrinsic)? {
                Payload::Server(h) => {
                    let value = self.coordinator().materialize(h).await?;
                    Ok(self.wrap(Payload::Clients(self.strategy.broadcast(value).await?)))
                }
                _ => Err(ExecutorError::invalid_argument(
                    "federated_broadcast expects a coordinator-placed value",
                )),
            },
            Intrinsic::FederatedApply => {
                let members = self.members(argument, 2, intrinsic)?;
                self.apply_at_server(&members[0].1, &members[1].1).await
            }
            Intrinsic::FederatedMap => {
                let members = self.members(argument, 2, intrinsic)?;
                match self.payload(&members[1].1)? {
                    Payload::Clients(placed) => {
                        let function = self.computation(&members[0].1).await?;
                        let mapped = self.strategy.map(&function, placed).await?;
                        Ok(self.wrap(Payload::Clients(mapped)))
                    }
                    Payload::Server(_) => self.apply_at_server(&members[0].1, &members[1].1).await,
                    _ => Err(ExecutorError::invalid_argument(
                        "federated_map expects a placed value",
                    )),
                }
            }
            Intrinsic::FederatedAggregate => {
                let members = self.members(argument, 5, intrinsic)?;
                let placed = match self.payload(&members[0].1)? {
                    Payload::Clients(placed) => placed,
                    _ => {
                        return Err(ExecutorError::invalid_argument(
                            "federated_aggregate expects a participant-placed value",
                        ));
                    }
                };
                let fns = AggregateFns {
                    zero: self.host_value(&members[1].1).await?,
                    accumulate: self.computation(&members[2].1).await?,
                    merge: self.computation(&members[3].1).await?,
                    report: self.computation(&members[4].1).await?,
                };
                let result = self.strategy.aggregate(placed, &fns).await?;
                Ok(self.wrap(Payload::Server(result)))
            }
            Intrinsic::SequenceMap | Intrinsic::SequenceReduce => {
                let function = self
                    .coordinator()
                    .create_value(Value::intrinsic(intrinsic))
                    .await?;
                self.call_on_coordinator(&function, argument).await
            }
        }
    }

    async fn apply_at_server(
        &self,
        function: &ValueHandle,
        value: &ValueHandle,
    ) -> Result<ValueHandle> {
        let server_value = match self.payload(value)? {
            Payload::Server(h) => h.clone(),
            _ => {
                return Err(ExecutorError::invalid_argument(
                    "federated_apply expects a coordinator-placed value",
                ));
            }
        };
        let function = self.coordinator_function(function).await?;
        let result = self
            .coordinator()
            .create_call(&function, Some(&server_value))
            .await?;
        Ok(self.wrap(Payload::Server(result)))
    }

    async fn call_on_coordinator(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        let argument = match argument {
            Some(a) => Some(self.lower(a).await?),
            None => None,
        };
        let result = self
            .coordinator()
            .create_call(function, argument.as_ref())
            .await?;
        Ok(self.wrap(Payload::Unplaced(result)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::closed("federating executor"));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for FederatingExecutor {
    async fn create_value(&self, value: Value) -> Result<ValueHandle> {
        self.ensure_open()?;
        match value {
            Value::Function(c) => Ok(self.wrap(Payload::Function(c))),
            Value::Federated {
                placement: Placement::Server,
                members,
                ..
            } => {
                let member = single_member(members, Placement::Server)?;
                let handle = self.coordinator().create_value(member).await?;
                Ok(self.wrap(Payload::Server(handle)))
            }
            Value::Federated {
                placement: Placement::Clients,
                all_equal,
                members,
            } => {
                let placed = self.strategy.ingest(all_equal, members).await?;
                Ok(self.wrap(Payload::Clients(placed)))
            }
            Value::Struct(elements) => {
                let mut members = Vec::with_capacity(elements.len());
                for (name, element) in elements {
                    members.push((name, self.create_value(element).await?));
                }
                Ok(self.wrap(Payload::Struct(members)))
            }
            other => {
                let handle = self.coordinator().create_value(other).await?;
                Ok(self.wrap(Payload::Unplaced(handle)))
            }
        }
    }

    async fn create_call(
        &self,
        function: &ValueHandle,
        argument: Option<&ValueHandle>,
    ) -> Result<ValueHandle> {
        self.ensure_open()?;
        match self.payload(function)? {
            Payload::Function(Computation::Intrinsic(intrinsic)) => {
                self.call_intrinsic(*intrinsic, argument).await
            }
            Payload::Function(_) | Payload::Unplaced(_) => {
                let function = self.lower(function).await?;
                self.call_on_coordinator(&function, argument).await
            }
            _ => Err(ExecutorError::invalid_argument(
                "cannot call a placed value or struct",
            )),
        }
    }

    async fn create_struct(
        &self,
        elements: Vec<(Option<String>, ValueHandle)>,
    ) -> Result<ValueHandle> {
        self.ensure_open()?;
        for (_, handle) in &elements {
            self.payload(handle)?;
        }
        Ok(self.wrap(Payload::Struct(elements)))
    }

    async fn create_selection(&self, source: &ValueHandle, index: usize) -> Result<ValueHandle> {
        self.ensure_open()?;
        match self.payload(source)? {
            Payload::Struct(members) => members
                .get(index)
                .map(|(_, h)| h.clone())
                .ok_or_else(|| {
                    ExecutorError::invalid_argument(format!(
                        "index {index} out of range for struct of {}",
                        members.len()
                    ))
                }),
            Payload::Unplaced(h) => {
                let selected = self.coordinator().create_selection(h, index).await?;
                Ok(self.wrap(Payload::Unplaced(selected)))
            }
            Payload::Server(h) => {
                let selected = self.coordinator().create_selection(h, index).await?;
                Ok(self.wrap(Payload::Server(selected)))
            }
            Payload::Clients(placed) => {
                let selected = self.strategy.select(placed, index).await?;
                Ok(self.wrap(Payload::Clients(selected)))
            }
            Payload::Function(_) => Err(ExecutorError::invalid_argument(
                "cannot select from a function",
            )),
        }
    }

    async fn materialize(&self, value: &ValueHandle) -> Result<Value> {
        self.ensure_open()?;
        match self.payload(value)? {
            Payload::Unplaced(h) => self.coordinator().materialize(h).await,
            Payload::Function(c) => Ok(Value::Function(c.clone())),
            Payload::Server(h) => Ok(Value::at_server(self.coordinator().materialize(h).await?)),
            Payload::Clients(placed) => {
                let mut members = self.strategy.materialize(placed).await?;
                if placed.all_equal {
                    members.truncate(1);
                }
                Ok(Value::Federated {
                    placement: Placement::Clients,
                    all_equal: placed.all_equal,
                    members,
                })
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
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            strategy = self.strategy.kind(),
            participants = self.strategy.participants(),
            "closing federating executor"
        );
        self.strategy.close().await;
    }
}

/// The single member of an all-equal federated value.
pub(crate) fn single_member(members: Vec<Value>, placement: Placement) -> Result<Value> {
    let count = members.len();
    let mut members = members.into_iter();
    match (members.next(), count) {
        (Some(member), 1) => Ok(member),
        _ => Err(ExecutorError::invalid_argument(format!(
            "a value at {placement} must have exactly one member, got {count}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_all_reports_scoped_failure() {
        let branches = vec![
            (ParticipantRange::new(0, 10), futures::future::ready(Ok(1)).boxed()),
            (
                ParticipantRange::new(10, 20),
                futures::future::ready(Err(ExecutorError::connectivity("w1", "reset"))).boxed(),
            ),
        ];
        let failure = join_branches(PartialFailurePolicy::AbortAll, branches)
            .await
            .unwrap_err();
        assert_eq!(failure.error.range(), Some(&ParticipantRange::new(10, 20)));
        assert!(matches!(
            failure.error,
            ExecutorError::ParticipantUnavailable { .. }
        ));
        assert!(failure.completed.is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_keeps_completed_branches() {
        let branches = vec![
            (ParticipantRange::new(0, 1), futures::future::ready(Ok(1)).boxed()),
            (
                ParticipantRange::new(1, 2),
                futures::future::ready(Err(ExecutorError::computation("bad"))).boxed(),
            ),
            (ParticipantRange::new(2, 3), futures::future::ready(Ok(3)).boxed()),
        ];
        let failure = join_branches(PartialFailurePolicy::BestEffort, branches)
            .await
            .unwrap_err();
        assert_eq!(failure.completed, vec![1, 3]);
        assert!(matches!(failure.error, ExecutorError::RangeFailed { .. }));
    }

    #[tokio::test]
    async fn test_branches_over_executor_calls_are_send() {
        let leaf: Arc<dyn Executor> = Arc::new(crate::executors::eager::EagerExecutor::new());
        let run = async {
            let branches = (0..3)
                .map(|i| (ParticipantRange::single(i), leaf.create_value(Value::Int(i as i64))))
                .collect();
            join_branches(PartialFailurePolicy::AbortAll, branches).await
        };
        let boxed: BoxFuture<'_, _> = run.boxed();
        let handles = boxed.await.map_err(|failure| failure.error).unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(leaf.materialize(&handles[2]).await.unwrap(), Value::Int(2));
    }

    #[test]
    fn test_single_member() {
        assert_eq!(
            single_member(vec![Value::Int(1)], Placement::Server).unwrap(),
            Value::Int(1)
        );
        assert!(single_member(vec![], Placement::Server).is_err());
        assert!(single_member(vec![1.into(), 2.into()], Placement::Server).is_err());
    }
}
