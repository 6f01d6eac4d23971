// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Federated executor stacks.
//!
//! An [`ExecutorFactory`] turns a [`CardinalityMap`] into a cached, layered stack of
//! [`Executor`]s. Small participant counts are served by one leaf per participant;
//! larger ones are composed into a tree whose nodes never fan out to more than
//! `fan_out_threshold` children. Callers see the same [`Executor`] interface either way.

pub mod config;
pub mod error;
pub mod executor;
pub mod executors;
pub mod logging;
pub mod placement;
pub mod remote;
pub mod stacks;
pub mod utils;
pub mod value;

pub use config::{EvictionPolicy, PartialFailurePolicy, StackConfig};
pub use error::{ExecutorError, ParticipantRange, Result};
pub use executor::{Executor, ExecutorId, ExecutorValue, ValueHandle};
pub use placement::{CardinalityMap, Placement};
pub use stacks::{CacheStats, ExecutorFactory, ExecutorHandle, StackPlan};
pub use value::{Computation, Intrinsic, LeafFunction, Value};
