// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Placements and cardinality maps.
//!
//! A federated computation distributes values over two logical placements: the
//! single coordinator ([`Placement::Server`]) and the participant set
//! ([`Placement::Clients`]). A [`CardinalityMap`] records how many participants
//! exist for one execution and is the key under which executor stacks are cached.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// The coordinator. Always exactly one.
    Server,
    /// The participant set.
    Clients,
}

impl Placement {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Placement::Server)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Server => write!(f, "server"),
            Placement::Clients => write!(f, "clients"),
        }
    }
}

impl FromStr for Placement {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "server" => Ok(Placement::Server),
            "clients" => Ok(Placement::Clients),
            _ => Err(ExecutorError::InvalidCardinality(format!(
                "unknown placement '{s}'; valid placements are 'server' and 'clients'"
            ))),
        }
    }
}

/// Participant count per placement.
///
/// The coordinator is implicit and never stored. Equality and hashing are by value,
/// so two maps built independently with the same counts select the same cached stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardinalityMap(BTreeMap<Placement, usize>);

impl CardinalityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a map with only a participant count.
    pub fn clients(count: usize) -> Self {
        let mut map = BTreeMap::new();
        map.insert(Placement::Clients, count);
        Self(map)
    }

    /// Build a map from untrusted `(placement name, count)` pairs.
    ///
    /// Rejects unknown placement names, negative counts, duplicate placements and a
    /// coordinator count other than 1. An explicit `server = 1` entry is accepted and
    /// dropped.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut map = BTreeMap::new();
        let mut seen_server = false;
        for (name, count) in pairs {
            let placement: Placement = name.parse()?;
            if count < 0 {
                return Err(ExecutorError::InvalidCardinality(format!(
                    "count for placement '{placement}' must be non-negative, got {count}"
                )));
            }
            if placement.is_coordinator() {
                if count != 1 || seen_server {
                    return Err(ExecutorError::InvalidCardinality(format!(
                        "the coordinator placement is implicitly 1, got {count}"
                    )));
                }
                seen_server = true;
                continue;
            }
            if map.insert(placement, count as usize).is_some() {
                return Err(ExecutorError::InvalidCardinality(format!(
                    "placement '{placement}' given more than once"
                )));
            }
        }
        Ok(Self(map))
    }

    /// Count for a placement; the coordinator always reports 1, missing
    /// participant placements report 0.
    pub fn get(&self, placement: Placement) -> usize {
        if placement.is_coordinator() {
            return 1;
        }
        self.0.get(&placement).copied().unwrap_or(0)
    }

    /// Total number of participants across all non-coordinator placements.
    pub fn participants(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Placement, usize)> + '_ {
        self.0.iter().map(|(p, c)| (*p, *c))
    }
}

impl fmt::Display for CardinalityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (placement, count)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{placement}: {count}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_placement() {
        assert_eq!("clients".parse::<Placement>().unwrap(), Placement::Clients);
        assert_eq!("SERVER".parse::<Placement>().unwrap(), Placement::Server);
        assert!(matches!(
            "edge".parse::<Placement>(),
            Err(ExecutorError::InvalidCardinality(_))
        ));
    }

    #[test]
    fn test_from_pairs_normalizes_coordinator() {
        let map = CardinalityMap::from_pairs([("server", 1), ("clients", 3)]).unwrap();
        assert_eq!(map, CardinalityMap::clients(3));
        assert_eq!(map.get(Placement::Server), 1);
        assert_eq!(map.participants(), 3);
    }

    #[test]
    fn test_from_pairs_rejects_bad_input() {
        assert!(CardinalityMap::from_pairs([("clients", -1)]).is_err());
        assert!(CardinalityMap::from_pairs([("server", 2)]).is_err());
        assert!(CardinalityMap::from_pairs([("clients", 1), ("clients", 2)]).is_err());
        assert!(CardinalityMap::from_pairs([("gateways", 4)]).is_err());
    }

    #[test]
    fn test_zero_participants_is_legal() {
        let map = CardinalityMap::from_pairs([("clients", 0)]).unwrap();
        assert_eq!(map.participants(), 0);
    }

    #[test]
    fn test_value_equality_and_hash() {
        let a = CardinalityMap::from_pairs([("clients", 5)]).unwrap();
        let b = CardinalityMap::clients(5);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_eq!(b.to_string(), "{clients: 5}");
    }
}
