// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Instantiates a [`StackPlan`] into a layered executor tree.
//!
//! Leaves become `reference_resolving(thread_delegating([sequence](leaf)))`.
//! Federated nodes become `reference_resolving(thread_delegating(federating(strategy)))`.
//! Remote children are connected and configured during construction and used
//! as they are.
//!
//! Construction is all-or-nothing: when any part fails, the parts already built
//! are closed before the error is returned.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, join_all};

use crate::config::StackConfig;
use crate::error::{ExecutorError, ParticipantRange, Result};
use crate::executor::Executor;
use crate::executors::composing_strategy::{ChildStack, ComposingStrategy};
use crate::executors::eager::{LeafFactory, LeafRole};
use crate::executors::federating::{FederatingExecutor, FederatingStrategy};
use crate::executors::reference_resolving::ReferenceResolvingExecutor;
use crate::executors::remote::RemoteExecutor;
use crate::executors::resolving_strategy::ResolvingStrategy;
use crate::executors::sequence::SequenceExecutor;
use crate::executors::thread_delegating::ThreadDelegatingExecutor;
use crate::placement::CardinalityMap;
use crate::remote::stub::RemoteWorker;
use crate::stacks::plan::StackPlan;
use crate::utils::worker_pool::{WorkerPool, WorkerRuntime};

/// A fully constructed stack for one cardinality map.
#[derive(Debug)]
pub struct ExecutorStack {
    cardinalities: CardinalityMap,
    plan: StackPlan,
    root: Arc<ReferenceResolvingExecutor>,
}

impl ExecutorStack {
    pub fn cardinalities(&self) -> &CardinalityMap {
        &self.cardinalities
    }

    pub fn plan(&self) -> &StackPlan {
        &self.plan
    }

    pub fn root(&self) -> &Arc<ReferenceResolvingExecutor> {
        &self.root
    }

    /// Tear down the whole tree: bindings, worker pools, leaves and remote
    /// connections.
    pub async fn close(&self) {
        tracing::debug!(cardinalities = %self.cardinalities, "tearing down stack");
        self.root.close().await;
    }
}

#[derive(Debug)]
pub struct StackBuilder {
    config: StackConfig,
    leaf_factory: Arc<dyn LeafFactory>,
    remote_workers: Vec<Arc<dyn RemoteWorker>>,
    runtime: WorkerRuntime,
}

impl StackBuilder {
    pub fn new(
        config: StackConfig,
        leaf_factory: Arc<dyn LeafFactory>,
        remote_workers: Vec<Arc<dyn RemoteWorker>>,
        runtime: WorkerRuntime,
    ) -> Self {
        Self {
            config,
            leaf_factory,
            remote_workers,
            runtime,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The topology a stack for `cardinalities` would have.
    pub fn plan(&self, cardinalities: &CardinalityMap) -> Result<StackPlan> {
        let participants = cardinalities.participants();
        if self.remote_workers.is_empty() {
            StackPlan::local(participants, self.config.fan_out_threshold)
        } else {
            StackPlan::remote(
                participants,
                self.remote_workers.len(),
                self.config.fan_out_threshold,
            )
        }
    }

    pub async fn build(&self, cardinalities: CardinalityMap) -> Result<ExecutorStack> {
        let plan = self.plan(&cardinalities)?;
        tracing::debug!(
            cardinalities = %cardinalities,
            depth = plan.depth(),
            "building executor stack"
        );

        let root = self.build_federated(&plan).await.map_err(|e| {
            tracing::warn!(cardinalities = %cardinalities, error = %e, "stack construction failed");
            match e {
                ExecutorError::ExecutorConstruction { .. } => e,
                other => ExecutorError::construction(
                    format!("failed to build stack for {cardinalities}"),
                    Some(other),
                ),
            }
        })?;

        Ok(ExecutorStack {
            cardinalities,
            plan,
            root,
        })
    }

    fn delegating(&self, name: String, inner: Arc<dyn Executor>) -> Arc<ReferenceResolvingExecutor> {
        let pool = WorkerPool::new(name, self.runtime.clone(), self.config.max_in_flight);
        let delegating =
            ThreadDelegatingExecutor::new(inner, pool, self.config.shutdown_drain_timeout());
        Arc::new(ReferenceResolvingExecutor::new(Arc::new(delegating)))
    }

    async fn build_leaf(&self, role: LeafRole) -> Result<Arc<dyn Executor>> {
        let name = match &role {
            LeafRole::Coordinator { range } => format!("coordinator{range}"),
            LeafRole::Participant { index } => format!("participant-{index}"),
        };
        let leaf = self.leaf_factory.create_leaf(role).await?;
        let leaf: Arc<dyn Executor> = if self.config.support_sequence_ops {
            Arc::new(SequenceExecutor::new(leaf))
        } else {
            leaf
        };
        Ok(self.delegating(name, leaf))
    }

    fn build_federated<'a>(
        &'a self,
        plan: &'a StackPlan,
    ) -> BoxFuture<'a, Result<Arc<ReferenceResolvingExecutor>>> {
        async move {
            let range = plan.range();
            let coordinator = self
                .build_leaf(LeafRole::Coordinator {
                    range: range.clone(),
                })
                .await?;

            let strategy: Result<Arc<dyn FederatingStrategy>> = match plan {
                StackPlan::Resolving { .. } => {
                    let leaves = range
                        .as_range()
                        .map(|index| self.build_leaf(LeafRole::Participant { index }));
                    let participants = all_or_nothing(join_all(leaves).await).await;
                    participants.map(|participants| {
                        Arc::new(ResolvingStrategy::new(
                            coordinator.clone(),
                            participants,
                            range.start,
                            self.config.partial_failure_policy,
                        )) as Arc<dyn FederatingStrategy>
                    })
                }
                StackPlan::Composing { children, .. } => {
                    let built = join_all(children.iter().map(|child| async move {
                        self.build_child(child).await.map(|executor| ChildStack {
                            range: child.range(),
                            executor,
                        })
                    }))
                    .await;
                    match all_or_nothing_children(built).await {
                        Ok(children) => {
                            let executors: Vec<_> =
                                children.iter().map(|c| c.executor.clone()).collect();
                            match ComposingStrategy::new(
                                coordinator.clone(),
                                children,
                                self.config.partial_failure_policy,
                            ) {
                                Ok(strategy) => Ok(Arc::new(strategy) as Arc<dyn FederatingStrategy>),
                                Err(e) => {
                                    join_all(executors.iter().map(|executor| executor.close())).await;
                                    Err(e)
                                }
                            }
                        }
                        Err(e) => Err(e),
                    }
                }
                StackPlan::Remote { .. } => Err(ExecutorError::Internal(
                    "remote node cannot be a federated root".into(),
                )),
            };

            match strategy {
                Ok(strategy) => {
                    let federating = Arc::new(FederatingExecutor::new(strategy));
                    Ok(self.delegating(format!("federating{range}"), federating))
                }
                Err(e) => {
                    coordinator.close().await;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn build_child(&self, plan: &StackPlan) -> Result<Arc<dyn Executor>> {
        match plan {
            StackPlan::Remote { worker, .. } => self.build_remote(plan.range(), *worker).await,
            _ => Ok(self.build_federated(plan).await?),
        }
    }

    async fn build_remote(&self, range: ParticipantRange, worker: usize) -> Result<Arc<dyn Executor>> {
        let worker = self.remote_workers.get(worker).ok_or_else(|| {
            ExecutorError::Internal(format!("plan names unknown remote worker {worker}"))
        })?;
        let executor = RemoteExecutor::new(worker.stub());

        let setup = async {
            executor.connect().await?;
            executor
                .set_cardinalities(&CardinalityMap::clients(range.len()))
                .await
        };
        match setup.await {
            Ok(()) => {
                tracing::debug!(endpoint = worker.endpoint(), %range, "remote child ready");
                Ok(Arc::new(executor))
            }
            Err(e) => {
                executor.close().await;
                Err(e.scoped_to(range))
            }
        }
    }
}

/// Collect built parts, closing the successful ones if any failed.
async fn all_or_nothing(results: Vec<Result<Arc<dyn Executor>>>) -> Result<Vec<Arc<dyn Executor>>> {
    let mut built = Vec::with_capacity(results.len());
    let mut failure = None;
    for result in results {
        match result {
            Ok(executor) => built.push(executor),
            Err(e) if failure.is_none() => failure = Some(e),
            Err(_) => {}
        }
    }
    match failure {
        None => Ok(built),
        Some(e) => {
            join_all(built.iter().map(|executor| executor.close())).await;
            Err(e)
        }
    }
}

async fn all_or_nothing_children(results: Vec<Result<ChildStack>>) -> Result<Vec<ChildStack>> {
    let mut ranges = Vec::with_capacity(results.len());
    let executors = results
        .into_iter()
        .map(|result| {
            result.map(|child| {
                ranges.push(child.range);
                child.executor
            })
        })
        .collect();
    let executors = all_or_nothing(executors).await?;
    Ok(ranges
        .into_iter()
        .zip(executors)
        .map(|(range, executor)| ChildStack { range, executor })
        .collect())
}
