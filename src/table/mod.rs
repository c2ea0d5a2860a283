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

//! The partitioned multicast route table.
//!
//! The table stores one [`McastRoute`] per [`McastPrefix`], sharded over a
//! fixed number of [`TablePartition`]s so that all routes of one
//! (group, source) pair land in the same partition. Listeners register with
//! the table and observe mutations through per-partition notification lists:
//! a mutation never re-enters a listener synchronously; the listener drains
//! its pending route keys with [`McastTable::take_notifications`] strictly
//! after the mutating call returned.
//!
//! Each listener may attach one opaque state value to a route. A route that
//! has been deleted lingers until every listener has detached its state, and
//! is then swept from the partition.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::attr::{AttrHandle, TunnelEncap};
use crate::label::LabelBlockRef;
use crate::types::{Level, PartitionId, RouteDistinguisher, SgKey};

/// Identifier of a registered table listener.
pub type ListenerId = usize;

/// The role of a route within the multicast table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum RouteType {
    /// A membership advertisement from a peer that wants to join the tree.
    Join,
    /// A synthesized advertisement of the chosen tree root.
    ForestNode,
}

/// The key of a multicast route.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct McastPrefix {
    /// The role of the route.
    pub route_type: RouteType,
    /// The route distinguisher of the originator; null for synthesized routes.
    pub rd: RouteDistinguisher,
    /// The router-id of the BGP speaker that produced the route.
    pub router_id: Ipv4Addr,
    /// The multicast group address.
    pub group: Ipv4Addr,
    /// The multicast source address.
    pub source: Ipv4Addr,
}

impl McastPrefix {
    /// Create the prefix of a peer membership advertisement.
    pub fn join(
        rd: RouteDistinguisher,
        router_id: Ipv4Addr,
        group: Ipv4Addr,
        source: Ipv4Addr,
    ) -> Self {
        Self { route_type: RouteType::Join, rd, router_id, group, source }
    }

    /// Create the prefix of a synthesized tree-root advertisement. Such
    /// routes carry the null route distinguisher.
    pub fn forest_node(router_id: Ipv4Addr, group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self {
            route_type: RouteType::ForestNode,
            rd: RouteDistinguisher::NULL,
            router_id,
            group,
            source,
        }
    }

    /// The (group, source) pair the route belongs to.
    pub fn sg(&self) -> SgKey {
        SgKey::new(self.group, self.source)
    }

    /// The tier at which a forwarder created from this route participates.
    pub fn level(&self) -> Level {
        match self.route_type {
            RouteType::Join => Level::Local,
            RouteType::ForestNode => Level::Global,
        }
    }
}

impl std::fmt::Display for McastPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ty = match self.route_type {
            RouteType::Join => "join",
            RouteType::ForestNode => "forest",
        };
        write!(f, "{ty}:{}:{}:{}", self.rd, self.router_id, self.sg())
    }
}

/// Where a path was learned from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum PathSource {
    /// Originated by this engine.
    Local,
    /// Learned from a remote peer.
    Peer,
}

/// One path of a multicast route.
#[derive(Clone, Debug)]
pub struct Path {
    /// Where the path was learned from.
    pub source: PathSource,
    /// The interned attributes of the path.
    pub attr: AttrHandle,
    /// The label range advertised by the peer, if any.
    pub label_block: Option<LabelBlockRef>,
    /// Encapsulations from the extended community; empty if none were sent.
    pub encap: BTreeSet<TunnelEncap>,
}

impl Path {
    /// Create a path learned from a peer.
    pub fn peer(
        attr: AttrHandle,
        label_block: Option<LabelBlockRef>,
        encap: BTreeSet<TunnelEncap>,
    ) -> Self {
        Self { source: PathSource::Peer, attr, label_block, encap }
    }

    /// Create a locally originated path.
    pub fn local(attr: AttrHandle) -> Self {
        Self { source: PathSource::Local, attr, label_block: None, encap: BTreeSet::new() }
    }

    /// The next-hop carried by the path attributes.
    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.attr.next_hop
    }
}

/// A multicast route: a prefix plus the paths currently advertising it.
#[derive(Clone, Debug)]
pub struct McastRoute {
    prefix: McastPrefix,
    paths: Vec<Path>,
    deleted: bool,
}

impl McastRoute {
    fn new(prefix: McastPrefix) -> Self {
        Self { prefix, paths: Vec::new(), deleted: false }
    }

    /// The key of the route.
    pub fn prefix(&self) -> &McastPrefix {
        &self.prefix
    }

    /// The currently best path, or `None` if the route has no paths.
    pub fn best_path(&self) -> Option<&Path> {
        self.paths.first()
    }

    /// Returns true once the route has been marked deleted. A deleted route
    /// lingers in its partition until all listener state is detached.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn upsert_path(&mut self, path: Path) {
        match self.paths.iter_mut().find(|p| p.source == path.source) {
            Some(slot) => *slot = path,
            None => self.paths.push(path),
        }
    }
}

/// One shard of the route table. All mutation of the routes, listener
/// states, and notification lists of a partition happens behind `&mut`, so
/// exactly one caller at a time can operate on a partition.
#[derive(Debug)]
pub struct TablePartition<S> {
    index: PartitionId,
    routes: BTreeMap<McastPrefix, McastRoute>,
    states: BTreeMap<McastPrefix, BTreeMap<ListenerId, S>>,
    listeners: BTreeSet<ListenerId>,
    pending: BTreeMap<ListenerId, VecDeque<McastPrefix>>,
}

impl<S> TablePartition<S> {
    fn new(index: PartitionId) -> Self {
        Self {
            index,
            routes: BTreeMap::new(),
            states: BTreeMap::new(),
            listeners: BTreeSet::new(),
            pending: BTreeMap::new(),
        }
    }

    /// The index of this partition.
    pub fn index(&self) -> PartitionId {
        self.index
    }

    /// Find a route by its prefix.
    pub fn find(&self, prefix: &McastPrefix) -> Option<&McastRoute> {
        self.routes.get(prefix)
    }

    /// The number of routes in the partition, deleted ones included.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if the partition holds no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Insert a path for the given prefix, creating the route on first use
    /// and reviving it if it was marked deleted. A path from the same source
    /// replaces the existing one. Listeners are notified.
    pub fn add(&mut self, prefix: McastPrefix, path: Path) {
        let route = self.routes.entry(prefix).or_insert_with(|| McastRoute::new(prefix));
        route.deleted = false;
        route.upsert_path(path);
        self.notify(&prefix);
    }

    /// Remove the path from the given source. When no path remains the route
    /// is marked deleted. Listeners are notified either way.
    pub fn remove_path(&mut self, prefix: &McastPrefix, source: PathSource) {
        let Some(route) = self.routes.get_mut(prefix) else {
            return;
        };
        route.paths.retain(|p| p.source != source);
        if route.paths.is_empty() {
            route.deleted = true;
        }
        self.notify(prefix);
        self.sweep(prefix);
    }

    /// Mark the route deleted and drop all of its paths. Listeners are
    /// notified; the route is swept once no listener state remains.
    pub fn delete(&mut self, prefix: &McastPrefix) {
        let Some(route) = self.routes.get_mut(prefix) else {
            return;
        };
        route.deleted = true;
        route.paths.clear();
        self.notify(prefix);
        self.sweep(prefix);
    }

    /// Queue a change notification for the given route on every listener.
    /// A route already pending for a listener is not queued twice.
    pub fn notify(&mut self, prefix: &McastPrefix) {
        if !self.routes.contains_key(prefix) {
            return;
        }
        for listener in &self.listeners {
            let queue = self.pending.entry(*listener).or_default();
            if !queue.contains(prefix) {
                queue.push_back(*prefix);
            }
        }
    }

    /// Get the state a listener attached to a route.
    pub fn get_state(&self, listener: ListenerId, prefix: &McastPrefix) -> Option<&S> {
        self.states.get(prefix)?.get(&listener)
    }

    /// Attach listener state to a route.
    ///
    /// # Panics
    /// Panics if the route does not exist or the listener already attached
    /// state to it; both indicate a listener bug.
    pub fn set_state(&mut self, listener: ListenerId, prefix: McastPrefix, state: S) {
        assert!(self.routes.contains_key(&prefix), "state attached to unknown route {prefix}");
        let old = self.states.entry(prefix).or_default().insert(listener, state);
        assert!(old.is_none(), "state attached twice to route {prefix}");
    }

    /// Detach and return the state a listener attached to a route, sweeping
    /// the route if it was deleted and no other state remains.
    pub fn clear_state(&mut self, listener: ListenerId, prefix: &McastPrefix) -> Option<S> {
        let slots = self.states.get_mut(prefix)?;
        let state = slots.remove(&listener);
        if slots.is_empty() {
            self.states.remove(prefix);
        }
        self.sweep(prefix);
        state
    }

    /// Remove a deleted route once no listener state references it.
    fn sweep(&mut self, prefix: &McastPrefix) {
        let deleted = self.routes.get(prefix).map(|r| r.deleted).unwrap_or(false);
        if deleted && !self.states.contains_key(prefix) {
            self.routes.remove(prefix);
        }
    }

    fn register(&mut self, listener: ListenerId) {
        self.listeners.insert(listener);
    }

    fn unregister(&mut self, listener: ListenerId) {
        self.listeners.remove(&listener);
        self.pending.remove(&listener);
        let prefixes: Vec<McastPrefix> = self.states.keys().copied().collect();
        for prefix in prefixes {
            let _ = self.clear_state(listener, &prefix);
        }
    }

    fn take_pending(&mut self, listener: ListenerId) -> Vec<McastPrefix> {
        self.pending.remove(&listener).map(Vec::from).unwrap_or_default()
    }

    fn has_pending(&self, listener: ListenerId) -> bool {
        self.pending.get(&listener).is_some_and(|q| !q.is_empty())
    }
}

/// The partitioned multicast route table.
#[derive(Debug)]
pub struct McastTable<S> {
    partitions: Vec<TablePartition<S>>,
    next_listener: ListenerId,
}

impl<S> McastTable<S> {
    /// Create a table with the given number of partitions.
    ///
    /// # Panics
    /// Panics if `partition_count` is zero.
    pub fn new(partition_count: usize) -> Self {
        assert!(partition_count > 0, "table needs at least one partition");
        Self {
            partitions: (0..partition_count).map(TablePartition::new).collect(),
            next_listener: 0,
        }
    }

    /// The number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The partition a route with the given prefix lives in. Depends only on
    /// (group, source), so all routes of one tree share a partition.
    pub fn partition_of(&self, prefix: &McastPrefix) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        (prefix.group, prefix.source).hash(&mut hasher);
        hasher.finish() as usize % self.partitions.len()
    }

    /// Get a partition by index.
    pub fn partition(&self, id: PartitionId) -> &TablePartition<S> {
        &self.partitions[id]
    }

    /// Get a partition by index, mutably.
    pub fn partition_mut(&mut self, id: PartitionId) -> &mut TablePartition<S> {
        &mut self.partitions[id]
    }

    /// Find a route in its partition.
    pub fn find(&self, prefix: &McastPrefix) -> Option<&McastRoute> {
        self.partition(self.partition_of(prefix)).find(prefix)
    }

    /// Insert a path for a route, see [`TablePartition::add`].
    pub fn add(&mut self, prefix: McastPrefix, path: Path) {
        let id = self.partition_of(&prefix);
        self.partition_mut(id).add(prefix, path);
    }

    /// Mark a route deleted, see [`TablePartition::delete`].
    pub fn delete(&mut self, prefix: &McastPrefix) {
        let id = self.partition_of(prefix);
        self.partition_mut(id).delete(prefix);
    }

    /// Queue a change notification, see [`TablePartition::notify`].
    pub fn notify(&mut self, prefix: &McastPrefix) {
        let id = self.partition_of(prefix);
        self.partition_mut(id).notify(prefix);
    }

    /// The total number of routes over all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(TablePartition::len).sum()
    }

    /// Returns true if no partition holds a route.
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(TablePartition::is_empty)
    }

    /// Register a new listener and return its id.
    pub fn register(&mut self) -> ListenerId {
        let id = self.next_listener;
        self.next_listener += 1;
        for partition in &mut self.partitions {
            partition.register(id);
        }
        id
    }

    /// Unregister a listener: its pending notifications and every state it
    /// attached are dropped, and routes waiting only on it are swept.
    pub fn unregister(&mut self, listener: ListenerId) {
        for partition in &mut self.partitions {
            partition.unregister(listener);
        }
    }

    /// Drain the pending change notifications of one listener for one
    /// partition, in the order the changes happened.
    pub fn take_notifications(
        &mut self,
        listener: ListenerId,
        partition: PartitionId,
    ) -> Vec<McastPrefix> {
        self.partition_mut(partition).take_pending(listener)
    }

    /// Returns true if the listener has undelivered notifications.
    pub fn has_pending(&self, listener: ListenerId) -> bool {
        self.partitions.iter().any(|p| p.has_pending(listener))
    }
}
