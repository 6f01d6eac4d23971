// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side values exchanged with an executor stack.
//!
//! Executors never expose their internal representation. Callers hand a [`Value`]
//! to `create_value` and get one back from `materialize`; everything in between is
//! an opaque handle owned by the executor that produced it.
//!
//! Functions are either leaf closures ([`LeafFunction`]) evaluated by a leaf
//! executor, or [`Intrinsic`]s interpreted by the federating and sequence layers.
//! Multi-argument functions receive a positional [`Value::Struct`].

use std::fmt;
use std::sync::Arc;

use crate::error::{ExecutorError, Result};
use crate::placement::Placement;

/// Signature of a leaf closure.
pub type LeafFn = dyn Fn(Option<Value>) -> Result<Value> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Ordered elements with optional names.
    Struct(Vec<(Option<String>, Value)>),
    Sequence(Vec<Value>),
    Function(Computation),
    /// A value distributed over a placement. All-equal values carry a single member.
    Federated {
        placement: Placement,
        all_equal: bool,
        members: Vec<Value>,
    },
}

impl Value {
    /// Positional struct of two elements, the argument shape of binary leaf functions.
    pub fn pair(first: Value, second: Value) -> Self {
        Value::Struct(vec![(None, first), (None, second)])
    }

    /// Positional struct of any arity.
    pub fn tuple(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Struct(elements.into_iter().map(|v| (None, v)).collect())
    }

    pub fn function(
        name: impl Into<String>,
        body: impl Fn(Option<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Value::Function(Computation::Function(Arc::new(LeafFunction::new(name, body))))
    }

    pub fn intrinsic(intrinsic: Intrinsic) -> Self {
        Value::Function(Computation::Intrinsic(intrinsic))
    }

    /// Participant-placed value with one member per participant.
    pub fn at_clients(members: Vec<Value>) -> Self {
        Value::Federated {
            placement: Placement::Clients,
            all_equal: false,
            members,
        }
    }

    pub fn at_server(value: Value) -> Self {
        Value::Federated {
            placement: Placement::Server,
            all_equal: true,
            members: vec![value],
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(ExecutorError::invalid_argument(format!(
                "expected an int, got {}",
                other.kind()
            ))),
        }
    }

    /// Split a two-element struct into its members.
    pub fn into_pair(self) -> Result<(Value, Value)> {
        match self {
            Value::Struct(elements) if elements.len() == 2 => {
                let mut iter = elements.into_iter().map(|(_, v)| v);
                match (iter.next(), iter.next()) {
                    (Some(a), Some(b)) => Ok((a, b)),
                    _ => Err(ExecutorError::Internal("pair lost an element".into())),
                }
            }
            other => Err(ExecutorError::invalid_argument(format!(
                "expected a pair, got {}",
                other.kind()
            ))),
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Struct(_) => "struct",
            Value::Sequence(_) => "sequence",
            Value::Function(_) => "function",
            Value::Federated { .. } => "federated",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Computation {
    Intrinsic(Intrinsic),
    Function(Arc<LeafFunction>),
}

impl Computation {
    pub fn is_federated(&self) -> bool {
        matches!(self, Computation::Intrinsic(i) if i.is_federated())
    }
}

/// Operations interpreted by the executor layers rather than by a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// `value -> value@placement` (all-equal).
    FederatedValue(Placement),
    /// `value@server -> value@clients` (all-equal).
    FederatedBroadcast,
    /// `<fn, value@clients> -> value@clients`.
    FederatedMap,
    /// `<fn, value@server> -> value@server`.
    FederatedApply,
    /// `<value@clients, zero, accumulate, merge, report> -> value@server`.
    FederatedAggregate,
    /// `<fn, sequence> -> sequence`, lazily.
    SequenceMap,
    /// `<sequence, zero, op> -> value`.
    SequenceReduce,
}

impl Intrinsic {
    pub fn is_federated(&self) -> bool {
        !matches!(self, Intrinsic::SequenceMap | Intrinsic::SequenceReduce)
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intrinsic::FederatedValue(p) => write!(f, "federated_value_at_{p}"),
            Intrinsic::FederatedBroadcast => write!(f, "federated_broadcast"),
            Intrinsic::FederatedMap => write!(f, "federated_map"),
            Intrinsic::FederatedApply => write!(f, "federated_apply"),
            Intrinsic::FederatedAggregate => write!(f, "federated_aggregate"),
            Intrinsic::SequenceMap => write!(f, "sequence_map"),
            Intrinsic::SequenceReduce => write!(f, "sequence_reduce"),
        }
    }
}

/// A named host closure. Two leaf functions are equal only if they share a body.
pub struct LeafFunction {
    name: String,
    body: Arc<LeafFn>,
}

impl LeafFunction {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(Option<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    /// The function returning its argument unchanged.
    pub fn identity() -> Self {
        Self::new("identity", |arg| {
            arg.ok_or_else(|| ExecutorError::invalid_argument("identity requires an argument"))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, argument: Option<Value>) -> Result<Value> {
        (self.body)(argument)
    }
}

impl fmt::Debug for LeafFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for LeafFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.body, &other.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_function_call() {
        let add = LeafFunction::new("add", |arg| {
            let (a, b) = arg
                .ok_or_else(|| ExecutorError::invalid_argument("missing"))?
                .into_pair()?;
            Ok(Value::Int(a.as_int()? + b.as_int()?))
        });
        let out = add.call(Some(Value::pair(2.into(), 3.into()))).unwrap();
        assert_eq!(out, Value::Int(5));
    }

    #[test]
    fn test_leaf_function_equality_is_by_body() {
        let a = Arc::new(LeafFunction::identity());
        let b = LeafFunction::identity();
        assert_eq!(
            Computation::Function(a.clone()),
            Computation::Function(a.clone())
        );
        assert_ne!(*a, b);
    }

    #[test]
    fn test_into_pair_rejects_other_shapes() {
        assert!(Value::Int(1).into_pair().is_err());
        assert!(Value::tuple([1.into(), 2.into(), 3.into()]).into_pair().is_err());
    }

    #[test]
    fn test_intrinsic_classification() {
        assert!(Intrinsic::FederatedAggregate.is_federated());
        assert!(!Intrinsic::SequenceReduce.is_federated());
        assert!(Computation::Intrinsic(Intrinsic::FederatedMap).is_federated());
        assert_eq!(
            Intrinsic::FederatedValue(Placement::Clients).to_string(),
            "federated_value_at_clients"
        );
    }
}
