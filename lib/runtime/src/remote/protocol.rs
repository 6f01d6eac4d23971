// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Messages exchanged between a remote executor and an executor service.
//!
//! Values created on behalf of a caller are named by [`ValueId`]; the service keeps
//! the backing handle until it receives a matching [`Request::Dispose`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::placement::CardinalityMap;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(Uuid);

impl ValueId {
    pub fn new() -> Self {
        ValueId(Uuid::new_v4())
    }
}

impl Default for ValueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    /// Select the stack that serves the following requests.
    SetCardinalities(CardinalityMap),
    CreateValue(Value),
    CreateCall {
        function: ValueId,
        argument: Option<ValueId>,
    },
    CreateStruct(Vec<(Option<String>, ValueId)>),
    CreateSelection {
        source: ValueId,
        index: usize,
    },
    Compute(ValueId),
    Dispose(Vec<ValueId>),
    /// Drop every value and the selected stack.
    Clear,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SetCardinalities(_) => "set_cardinalities",
            Request::CreateValue(_) => "create_value",
            Request::CreateCall { .. } => "create_call",
            Request::CreateStruct(_) => "create_struct",
            Request::CreateSelection { .. } => "create_selection",
            Request::Compute(_) => "compute",
            Request::Dispose(_) => "dispose",
            Request::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Created(ValueId),
    Value(Value),
    Ack,
}
