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

//! The interned attribute database.
//!
//! Route attributes are immutable and shared: [`AttrDb::locate`] returns a
//! handle to the unique interned copy of an attribute, creating it on first
//! use. Handles keep the attribute alive; once the last handle is dropped the
//! slot is reclaimed lazily on a later `locate`.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::types::{Label, RebuildError, RouteDistinguisher};

/// A tunnel encapsulation advertised through an extended community.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum TunnelEncap {
    /// MPLS over GRE
    Gre,
    /// MPLS over UDP
    Udp,
    /// VXLAN
    Vxlan,
}

impl std::fmt::Display for TunnelEncap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelEncap::Gre => write!(f, "gre"),
            TunnelEncap::Udp => write!(f, "udp"),
            TunnelEncap::Vxlan => write!(f, "vxlan"),
        }
    }
}

/// One replication target in an outbound list: a peer to copy traffic to,
/// the label it expects, and the encapsulations it supports.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OListElem {
    /// Address of the peer forwarder.
    pub address: Ipv4Addr,
    /// The label allocated by the peer forwarder.
    pub label: Label,
    /// Encapsulations the peer supports; may be empty.
    pub encap: BTreeSet<TunnelEncap>,
}

/// An outbound replication list: the tree adjacencies of one forwarder,
/// rendered as an attribute for re-advertisement.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct OList(
    /// The replication targets, in tree-link order.
    pub Vec<OListElem>,
);

impl std::fmt::Display for OList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]",
            self.0.iter().map(|e| format!("{}:{}", e.address, e.label)).join(" ")
        )
    }
}

/// An immutable, interned set of route attributes.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Attr {
    /// NEXT-HOP for reaching the originator.
    pub next_hop: Option<Ipv4Addr>,
    /// The route distinguisher of the route this one was derived from.
    pub source_rd: Option<RouteDistinguisher>,
    /// The outbound replication list.
    pub olist: Option<OList>,
}

/// Shared handle to an interned [`Attr`].
pub type AttrHandle = Arc<Attr>;

/// The attribute database. Cloning is cheap and yields a handle to the same
/// underlying database; all operations take `&self` and may be called from
/// any partition context.
#[derive(Clone, Debug, Default)]
pub struct AttrDb {
    inner: Arc<Mutex<AttrDbInner>>,
}

#[derive(Debug, Default)]
struct AttrDbInner {
    attrs: HashMap<Attr, Weak<Attr>>,
    limit: Option<usize>,
}

impl AttrDb {
    /// Create a new, empty attribute database without a capacity limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of live interned attributes. `locate` fails with
    /// [`RebuildError::AttrDbFull`] once the limit is reached.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.inner.lock().unwrap().limit = limit;
    }

    /// Find or create the unique interned copy of the given attribute.
    pub fn locate(&self, attr: Attr) -> Result<AttrHandle, RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.attrs.retain(|_, weak| weak.strong_count() > 0);
        if let Some(handle) = inner.attrs.get(&attr).and_then(Weak::upgrade) {
            return Ok(handle);
        }
        if inner.limit.is_some_and(|limit| inner.attrs.len() >= limit) {
            return Err(RebuildError::AttrDbFull);
        }
        let handle = Arc::new(attr.clone());
        inner.attrs.insert(attr, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// The number of live interned attributes.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.attrs.retain(|_, weak| weak.strong_count() > 0);
        inner.attrs.len()
    }

    /// Returns true if no attribute is currently interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
