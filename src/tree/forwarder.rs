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

//! One joined forwarder: a leaf of the distribution tree plus its local
//! state (peer address, label block, current label, and tree links).

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use crate::attr::{Attr, AttrDb, AttrHandle, OList, OListElem, TunnelEncap};
use crate::label::{LabelBlock, LabelBlockRef};
use crate::table::{McastPrefix, McastRoute, RouteType};
use crate::types::{Label, Level, RebuildError, RouteDistinguisher};

/// Identity of a forwarder within its (group, source) pair. Ordered by route
/// distinguisher first, so iterating a [`ForwarderSet`] yields the total
/// order that shapes the tree; the router-id disambiguates synthesized
/// routes, which all carry the null route distinguisher.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ForwarderKey {
    /// The route distinguisher of the forwarder's route.
    pub rd: RouteDistinguisher,
    /// The router-id of the forwarder's route.
    pub router_id: Ipv4Addr,
}

/// The forwarders of one level of a group entry, in tree order.
pub type ForwarderSet = BTreeMap<ForwarderKey, Forwarder>;

/// The outbound attribute re-advertised towards a forwarder's peer: the
/// replication list of its tree links, plus its own label as the out-label.
#[derive(Clone, Debug)]
pub struct OutboundAttr {
    /// The interned attribute carrying the replication list.
    pub attr: AttrHandle,
    /// The label under which the forwarder expects traffic.
    pub label: Label,
}

/// A remote endpoint that joined one (group, source) pair.
#[derive(Debug)]
pub struct Forwarder {
    key: ForwarderKey,
    prefix: McastPrefix,
    level: Level,
    address: Option<Ipv4Addr>,
    label_block: Option<LabelBlockRef>,
    encap: BTreeSet<TunnelEncap>,
    label: Label,
    links: Vec<ForwarderKey>,
}

impl Forwarder {
    /// Build a forwarder from a route. The peer address and label block come
    /// from the best path of membership advertisements; synthesized
    /// tree-root routes carry neither. Returns `None` for a route that has
    /// no best path or a membership advertisement missing its address or
    /// label range (a malformed advertisement the listener must ignore).
    pub(crate) fn from_route(route: &McastRoute) -> Option<Self> {
        let prefix = *route.prefix();
        let path = route.best_path()?;
        let (address, label_block) = match prefix.route_type {
            RouteType::Join => (Some(path.next_hop()?), Some(path.label_block.clone()?)),
            RouteType::ForestNode => (None, None),
        };
        Some(Self {
            key: ForwarderKey { rd: prefix.rd, router_id: prefix.router_id },
            prefix,
            level: prefix.level(),
            address,
            label_block,
            encap: path.encap.clone(),
            label: 0,
            links: Vec::new(),
        })
    }

    /// Refresh the forwarder from its route. Returns true if the label
    /// block, address, or encapsulation set changed, in which case the
    /// caller schedules a tree rebuild.
    pub(crate) fn update_from(&mut self, route: &McastRoute) -> bool {
        let Some(fresh) = Self::from_route(route) else {
            return false;
        };
        let mut changed = false;
        let same_block = match (&self.label_block, &fresh.label_block) {
            (Some(a), Some(b)) => LabelBlock::same(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same_block {
            // the current label belongs to the block that issued it
            self.release_label();
            self.label_block = fresh.label_block;
            changed = true;
        }
        if self.address != fresh.address {
            self.address = fresh.address;
            changed = true;
        }
        if self.encap != fresh.encap {
            self.encap = fresh.encap;
            changed = true;
        }
        changed
    }

    /// The identity of the forwarder within its group entry.
    pub fn key(&self) -> ForwarderKey {
        self.key
    }

    /// The key of the forwarder's route.
    pub fn prefix(&self) -> &McastPrefix {
        &self.prefix
    }

    /// The level the forwarder participates at.
    pub fn level(&self) -> Level {
        self.level
    }

    /// The peer address; `None` for global-level forwarders.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    /// The currently allocated label; 0 while not part of a tree.
    pub fn label(&self) -> Label {
        self.label
    }

    /// The encapsulations the peer supports.
    pub fn encap(&self) -> &BTreeSet<TunnelEncap> {
        &self.encap
    }

    /// The current tree links.
    pub fn links(&self) -> &[ForwarderKey] {
        &self.links
    }

    /// Allocate a label from the peer's block.
    pub(crate) fn allocate_label(&mut self) -> Result<(), RebuildError> {
        let block = self.label_block.as_ref().expect("local forwarder carries a label block");
        self.label = block
            .allocate()
            .ok_or(RebuildError::LabelExhausted(self.key.rd))?;
        Ok(())
    }

    /// Release the current label, if any. Idempotent.
    pub(crate) fn release_label(&mut self) {
        if self.label != 0 {
            let block = self.label_block.as_ref().expect("labelled forwarder carries a label block");
            block.release(self.label);
            self.label = 0;
        }
    }

    /// Add a tree link towards a peer forwarder. The caller keeps links
    /// symmetric. The k-ary construction never links a forwarder to itself;
    /// a debug build rejects it.
    ///
    /// # Panics
    /// Panics on a duplicate link.
    pub(crate) fn add_link(&mut self, peer: ForwarderKey) {
        debug_assert!(peer != self.key, "forwarder {self} linked to itself");
        assert!(!self.links.contains(&peer), "forwarder {self} linked twice to {}", peer.rd);
        self.links.push(peer);
    }

    /// Remove the link towards a peer forwarder, if present.
    pub(crate) fn remove_link(&mut self, peer: ForwarderKey) {
        self.links.retain(|k| *k != peer);
    }

    /// Drop all tree links. The caller clears the whole level, so symmetry
    /// is preserved.
    pub(crate) fn clear_links(&mut self) {
        self.links.clear();
    }

    /// Build the outbound attribute for this forwarder, or `None` while it
    /// is not part of the current tree.
    pub(crate) fn export(&self, siblings: &ForwarderSet, attr_db: &AttrDb) -> Option<OutboundAttr> {
        if self.links.is_empty() || self.label == 0 {
            return None;
        }
        let elems = self
            .links
            .iter()
            .map(|key| {
                let peer = &siblings[key];
                OListElem {
                    address: peer.address.expect("tree links only join local forwarders"),
                    label: peer.label,
                    encap: peer.encap.clone(),
                }
            })
            .collect();
        let attr = match attr_db.locate(Attr { olist: Some(OList(elems)), ..Default::default() }) {
            Ok(attr) => attr,
            Err(e) => {
                log::warn!("cannot intern outbound attribute for {self}: {e}");
                return None;
            }
        };
        Some(OutboundAttr { attr, label: self.label })
    }
}

impl std::fmt::Display for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.key.rd, self.label)
    }
}
