// BgpMcast: Multicast distribution-tree engine written in Rust
// Copyright 2023-2025 The bgp-mcast developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Module containing all shared type definitions.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An MPLS-style label. The value 0 means "no label assigned".
pub type Label = u32;

/// Index of one route-table partition.
pub type PartitionId = usize;

/// A route distinguisher: eight opaque bytes that identify the originator of a
/// route. The bytewise ordering on route distinguishers is the total order
/// used to shape distribution trees, so two engines that see the same set of
/// route distinguishers always agree on the tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteDistinguisher([u8; 8]);

impl RouteDistinguisher {
    /// The all-zero route distinguisher, used by synthesized routes that do
    /// not belong to any peer.
    pub const NULL: RouteDistinguisher = RouteDistinguisher([0; 8]);

    /// Create a type-0 route distinguisher from an AS number and an assigned
    /// number.
    pub fn new(asn: u16, assigned: u32) -> Self {
        let a = asn.to_be_bytes();
        let n = assigned.to_be_bytes();
        Self([0, 0, a[0], a[1], n[0], n[1], n[2], n[3]])
    }

    /// Create a route distinguisher from its raw byte representation.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the raw byte representation.
    pub fn bytes(&self) -> [u8; 8] {
        self.0
    }

    /// Returns true if this is the all-zero route distinguisher.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ty = u16::from_be_bytes([self.0[0], self.0[1]]);
        if ty == 0 {
            let asn = u16::from_be_bytes([self.0[2], self.0[3]]);
            let assigned = u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]);
            write!(f, "{asn}:{assigned}")
        } else {
            write!(f, "{:016x}", u64::from_be_bytes(self.0))
        }
    }
}

impl std::fmt::Debug for RouteDistinguisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RD({self})")
    }
}

impl std::str::FromStr for RouteDistinguisher {
    type Err = ParseRdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((asn, assigned)) = s.split_once(':') else {
            return Err(ParseRdError::MissingColon(s.to_string()));
        };
        Ok(Self::new(asn.parse()?, assigned.parse()?))
    }
}

impl From<(u16, u32)> for RouteDistinguisher {
    fn from(value: (u16, u32)) -> Self {
        Self::new(value.0, value.1)
    }
}

/// Error returned when parsing a route distinguisher.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseRdError {
    /// Number parsing error
    #[error("{0}")]
    Int(#[from] std::num::ParseIntError),
    /// The string is not of the form `asn:assigned`.
    #[error("`{0}` is not of the form `asn:assigned`")]
    MissingColon(String),
}

/// A multicast (group, source) pair. Each pair owns one distribution tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SgKey {
    /// The multicast group address.
    pub group: Ipv4Addr,
    /// The multicast source address.
    pub source: Ipv4Addr,
}

impl SgKey {
    /// Create a new (group, source) pair.
    pub fn new(group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self { group, source }
    }
}

impl std::fmt::Display for SgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.group, self.source)
    }
}

impl std::fmt::Debug for SgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SG({self})")
    }
}

/// The tier at which a forwarder participates in tree construction.
///
/// Trees are only built at the [`Level::Local`] tier. The [`Level::Global`]
/// tier tracks forwarders learned from synthesized tree-root routes; it is a
/// placeholder for a future multi-tier peering extension and never drives
/// tree construction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Level {
    /// Forwarders joined directly through a peer membership advertisement.
    Local,
    /// Forwarders learned from synthesized tree-root advertisements.
    Global,
}

impl Level {
    /// Both levels, in rebuild order.
    pub const ALL: [Level; 2] = [Level::Local, Level::Global];

    /// Index into per-level arrays.
    pub fn index(&self) -> usize {
        match self {
            Level::Local => 0,
            Level::Global => 1,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Local => write!(f, "local"),
            Level::Global => write!(f, "global"),
        }
    }
}

/// Failure of a tree rebuild due to an exhausted external resource.
///
/// These never cross the library boundary: the worker releases everything the
/// failed rebuild allocated and leaves the entry marked for a retry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RebuildError {
    /// The label block of the given forwarder has no free label.
    #[error("label block exhausted for forwarder {0}")]
    LabelExhausted(RouteDistinguisher),
    /// The attribute database is at capacity.
    #[error("attribute database is at capacity")]
    AttrDbFull,
}
