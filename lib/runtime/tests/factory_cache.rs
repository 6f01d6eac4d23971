// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stack cache behavior under concurrent callers.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;

use common::SwitchboardLeaves;
use fedexec_runtime::{
    CardinalityMap, Executor, ExecutorError, ExecutorFactory, StackConfig, Value,
};

fn factory(leaves: &SwitchboardLeaves) -> ExecutorFactory {
    fedexec_runtime::logging::init();
    ExecutorFactory::builder()
        .config(StackConfig {
            fan_out_threshold: 10,
            ..Default::default()
        })
        .leaf_factory(Arc::new(leaves.clone()))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_construction() {
    let leaves = SwitchboardLeaves::with_delay(Duration::from_millis(20));
    let factory = factory(&leaves);
    let cardinalities = CardinalityMap::clients(3);

    let handles = join_all((0..8).map(|_| factory.get_executor(&cardinalities))).await;
    let handles: Vec<_> = handles.into_iter().map(|h| h.unwrap()).collect();

    // one coordinator and three participants
    assert_eq!(leaves.created(), 4);
    assert_eq!(factory.stats().constructions, 1);
    assert!(handles.iter().all(|h| h.generation() == handles[0].generation()));

    for handle in handles {
        handle.release().await;
    }
    assert_eq!(factory.stats().live, 0);
}

#[tokio::test]
async fn test_rebuild_after_release() {
    let leaves = SwitchboardLeaves::default();
    let factory = factory(&leaves);
    let cardinalities = CardinalityMap::clients(3);

    let first = factory.get_executor(&cardinalities).await.unwrap();
    let generation = first.generation();
    let value = first.create_value(Value::Int(1)).await.unwrap();
    first.release().await;

    // handles from a torn down stack are rejected by the new one
    let second = factory.get_executor(&cardinalities).await.unwrap();
    assert_ne!(second.generation(), generation);
    assert_eq!(leaves.created(), 8);
    assert!(matches!(
        second.materialize(&value).await,
        Err(ExecutorError::ForeignHandle { .. })
    ));

    let placed = common::place(&second, common::ints([4, 5, 6])).await.unwrap();
    assert_eq!(common::aggregate_sum(&second, &placed).await.unwrap(), 15);
}

#[tokio::test]
async fn test_different_maps_get_different_stacks() {
    let leaves = SwitchboardLeaves::default();
    let factory = factory(&leaves);

    let a = factory.get_executor(&CardinalityMap::clients(2)).await.unwrap();
    let b = factory.get_executor(&CardinalityMap::clients(3)).await.unwrap();
    assert_ne!(a.generation(), b.generation());
    assert_eq!(factory.stats().live, 2);

    let value = a.create_value(Value::Int(1)).await.unwrap();
    assert!(matches!(
        b.materialize(&value).await,
        Err(ExecutorError::ForeignHandle { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_resolution() {
    let leaves = SwitchboardLeaves::default();
    let factory = factory(&leaves);
    let executor = factory
        .get_executor(&CardinalityMap::clients(5))
        .await
        .unwrap();
    let creations = Arc::new(AtomicUsize::new(0));

    let resolutions = (0..16).map(|_| {
        let creations = creations.clone();
        executor.resolve_or_create("weights", move |inner| async move {
            creations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner.create_value(Value::at_server(Value::Int(9))).await
        })
    });
    let handles: Vec<_> = join_all(resolutions)
        .await
        .into_iter()
        .map(|h| h.unwrap())
        .collect();

    assert_eq!(creations.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(
        executor.materialize(&handles[0]).await.unwrap(),
        Value::at_server(Value::Int(9))
    );

    let looked_up = executor.lookup("weights").await.unwrap();
    assert!(Arc::ptr_eq(&looked_up, &handles[0]));
}

#[tokio::test]
async fn test_failed_resolution_is_shared_then_retried() {
    let leaves = SwitchboardLeaves::default();
    let factory = factory(&leaves);
    let executor = factory
        .get_executor(&CardinalityMap::clients(2))
        .await
        .unwrap();

    let failures = (0..4).map(|_| {
        executor.resolve_or_create("config", |_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(ExecutorError::computation("not ready"))
        })
    });
    for result in join_all(failures).await {
        assert!(matches!(result, Err(ExecutorError::Computation(_))));
    }
    assert!(matches!(
        executor.lookup("config").await,
        Err(ExecutorError::UnknownReference(_))
    ));

    let handle = executor
        .resolve_or_create("config", |inner| async move {
            inner.create_value(Value::Bool(true)).await
        })
        .await
        .unwrap();
    assert_eq!(executor.materialize(&handle).await.unwrap(), Value::Bool(true));
}

#[tokio::test]
async fn test_request_validation() {
    let leaves = SwitchboardLeaves::default();
    let factory = ExecutorFactory::builder()
        .config(StackConfig {
            max_participants: 50,
            ..Default::default()
        })
        .leaf_factory(Arc::new(leaves.clone()))
        .build()
        .unwrap();

    assert!(matches!(
        factory.get_executor_for([("clients", 3), ("server", 2)]).await,
        Err(ExecutorError::InvalidCardinality(_))
    ));
    assert!(matches!(
        factory.get_executor(&CardinalityMap::clients(51)).await,
        Err(ExecutorError::CapacityExceeded {
            requested: 51,
            limit: 50
        })
    ));
    assert_eq!(leaves.created(), 0);

    let executor = factory
        .get_executor_for([("server", 1), ("clients", 50)])
        .await
        .unwrap();
    assert_eq!(executor.cardinalities(), &CardinalityMap::clients(50));
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = ExecutorFactory::new(StackConfig {
        fan_out_threshold: 1,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ExecutorError::Config(_)));
}
