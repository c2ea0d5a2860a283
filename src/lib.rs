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

#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # BgpMcast
//!
//! A deterministic multicast distribution-tree engine for overlay
//! virtual-network control planes. The engine consumes the stream of
//! per-peer multicast membership routes from a partitioned route table and
//! maintains, for every active (group, source) pair, a k-ary distribution
//! tree over the joined forwarders: each forwarder gets the set of peers it
//! must replicate to, together with a freshly allocated MPLS-style label,
//! ready to be re-advertised to its originating peer.
//!
//! The tree shape depends only on the *set* of joined forwarders, never on
//! the order they joined in: forwarders are arranged breadth-first in tree
//! order (the bytewise order of their route distinguishers), so two engines
//! fed the same routes always agree on the tree. This predictability is
//! traded against tree cost and traffic disruption on rebuilds, which the
//! engine does not optimize.
//!
//! ## Main Concepts
//!
//! The [`table::McastTable`] shards multicast routes over a fixed number of
//! partitions and exposes the listener protocol the engine is driven by:
//! registered listeners observe route changes through per-partition
//! notification lists and may attach per-route state.
//!
//! The [`tree::TreeManager`] is the engine itself. It pairs one
//! [`tree::ManagerPartition`] with every table partition; the listener
//! callback translates route changes into forwarder changes and enqueues the
//! affected [`tree::GroupEntry`] on the partition work queue, which collapses
//! any number of changes into at most one tree rebuild per drain.
//! [`tree::TreeManager::run`] pumps notifications and work queues until the
//! engine is quiescent.
//!
//! Labels come from peer-owned [`label::LabelBlock`]s, and route attributes
//! are interned in an [`attr::AttrDb`]; when either runs out of capacity the
//! affected rebuild is rolled back and retried on a later drain. Teardown is
//! cooperative and modeled by [`lifetime::DeleteActor`]: a requested deletion
//! completes exactly when the last partition drains.
//!
//! ## Example usage
//!
//! Two peers join the same group; after a run, each forwards to the other:
//!
//! ```
//! use bgp_mcast::prelude::*;
//! use std::net::Ipv4Addr;
//!
//! let attr_db = AttrDb::new();
//! let mut table = TreeTable::new(4);
//! let router_id = Ipv4Addr::new(10, 0, 0, 1);
//! let mut manager = TreeManager::new(ServerContext::new(router_id, attr_db.clone()));
//! manager.initialize(&mut table);
//!
//! let group = Ipv4Addr::new(224, 1, 1, 1);
//! let source = Ipv4Addr::new(10, 1, 0, 9);
//! let peers = [(1, Ipv4Addr::new(10, 0, 1, 1)), (2, Ipv4Addr::new(10, 0, 1, 2))];
//! for (n, peer) in peers {
//!     let attr = attr_db
//!         .locate(Attr { next_hop: Some(peer), ..Default::default() })
//!         .unwrap();
//!     table.add(
//!         McastPrefix::join(RouteDistinguisher::new(65000, n), peer, group, source),
//!         Path::peer(attr, Some(LabelBlock::new(1000, 1999)), Default::default()),
//!     );
//! }
//! manager.run(&mut table);
//!
//! let first = McastPrefix::join(
//!     RouteDistinguisher::new(65000, 1),
//!     Ipv4Addr::new(10, 0, 1, 1),
//!     group,
//!     source,
//! );
//! let update = manager.export_update(&table, &first).unwrap();
//! assert_ne!(update.label, 0);
//! assert_eq!(update.attr.olist.as_ref().unwrap().0.len(), 1);
//! ```

pub mod attr;
pub mod label;
pub mod lifetime;
pub mod prelude;
pub mod table;
pub mod tree;
pub mod types;

#[cfg(test)]
mod test;
