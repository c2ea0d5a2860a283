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

//! The distribution-tree manager.
//!
//! The [`TreeManager`] listens on a multicast route table and maintains, for
//! every active (group, source) pair, a deterministic k-ary distribution
//! tree over the joined forwarders. One [`ManagerPartition`] pairs with each
//! table partition and serializes all mutation of its group entries: change
//! notifications enqueue the affected entry on the partition work queue, and
//! the queue worker rebuilds each entry at most once per drain, however many
//! changes piled up.
//!
//! All of this runs under [`TreeManager::run`], which pumps listener
//! notifications and work queues until the engine is quiescent. Exclusive
//! access to a partition is guaranteed by ownership: whoever holds the
//! mutable borrow of the manager and the table is the one task allowed to
//! mutate them.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

use log::debug;

mod forwarder;
mod group;
#[cfg(test)]
mod test;

pub use forwarder::{Forwarder, ForwarderKey, ForwarderSet, OutboundAttr};
pub use group::GroupEntry;

use crate::attr::AttrDb;
use crate::lifetime::DeleteActor;
use crate::table::{ListenerId, McastPrefix, McastTable, TablePartition};
use crate::types::{Level, PartitionId, SgKey};

/// The default branching factor of the distribution trees.
pub const DEGREE: usize = 4;

/// The multicast route table as seen by the tree engine: routes carry a
/// [`ForwarderRef`] as per-listener state.
pub type TreeTable = McastTable<ForwarderRef>;

/// The state the engine attaches to a route: a typed back-reference to the
/// forwarder created for it, by (group, source), level, and forwarder key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ForwarderRef {
    /// The (group, source) pair of the owning group entry.
    pub sg: SgKey,
    /// The level of the forwarder.
    pub level: Level,
    /// The key of the forwarder within its level.
    pub key: ForwarderKey,
}

/// Ambient state of the local BGP speaker the engine runs in.
#[derive(Clone, Debug)]
pub struct ServerContext {
    /// The router-id of the local speaker; next-hop of synthesized routes.
    pub router_id: Ipv4Addr,
    /// The attribute database shared with the rest of the pipeline.
    pub attr_db: AttrDb,
}

impl ServerContext {
    /// Create a new server context.
    pub fn new(router_id: Ipv4Addr, attr_db: AttrDb) -> Self {
        Self { router_id, attr_db }
    }
}

/// One shard of the tree manager, paired with the table partition of the
/// same index. Owns the group entries of its shard and the work queue that
/// serializes their rebuilds.
#[derive(Debug)]
pub struct ManagerPartition {
    part_id: PartitionId,
    degree: usize,
    entries: BTreeMap<SgKey, GroupEntry>,
    queue: VecDeque<SgKey>,
    update_count: u64,
}

impl ManagerPartition {
    fn new(part_id: PartitionId, degree: usize) -> Self {
        Self {
            part_id,
            degree,
            entries: BTreeMap::new(),
            queue: VecDeque::new(),
            update_count: 0,
        }
    }

    /// The index of this partition.
    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    /// Find the group entry for a (group, source) pair.
    pub fn find(&self, sg: SgKey) -> Option<&GroupEntry> {
        self.entries.get(&sg)
    }

    /// Find or create the group entry for a (group, source) pair.
    pub(crate) fn locate(&mut self, sg: SgKey) -> &mut GroupEntry {
        self.entries.entry(sg).or_insert_with(|| GroupEntry::new(sg))
    }

    fn find_mut(&mut self, sg: SgKey) -> Option<&mut GroupEntry> {
        self.entries.get_mut(&sg)
    }

    /// The number of group entries in this partition.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this partition tracks no group entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of tree updates this partition has run.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Put a group entry on the work queue. An entry already queued stays
    /// queued once, however often this is called before the next drain.
    pub(crate) fn enqueue(&mut self, sg: SgKey) {
        let entry = self.entries.get_mut(&sg).expect("enqueued entry is indexed");
        if entry.on_queue {
            return;
        }
        entry.on_queue = true;
        self.queue.push_back(sg);
    }

    fn delete_forwarder(&mut self, fref: ForwarderRef, tbl: &mut TablePartition<ForwarderRef>) {
        let entry = self.entries.get_mut(&fref.sg).expect("entry of a tracked forwarder");
        entry.delete_forwarder(fref.level, fref.key, tbl);
    }

    /// Work-queue consumer: drop entries that became empty, rebuild the
    /// rest. Returns the number of entries processed.
    fn drain(&mut self, tbl: &mut TablePartition<ForwarderRef>, ctx: &ServerContext) -> usize {
        let mut processed = 0;
        while let Some(sg) = self.queue.pop_front() {
            processed += 1;
            let entry = self.entries.get_mut(&sg).expect("queued entry is indexed");
            entry.on_queue = false;
            if entry.is_empty() {
                self.entries.remove(&sg);
            } else {
                entry.rebuild_all(self.degree, tbl, ctx);
                self.update_count += 1;
            }
        }
        processed
    }
}

/// The top-level tree manager. See the [module documentation](self).
#[derive(Debug)]
pub struct TreeManager {
    ctx: ServerContext,
    degree: usize,
    partitions: Vec<ManagerPartition>,
    listener: Option<ListenerId>,
    deleter: DeleteActor,
}

impl TreeManager {
    /// Create a tree manager with the default branching factor.
    pub fn new(ctx: ServerContext) -> Self {
        Self::with_degree(ctx, DEGREE)
    }

    /// Create a tree manager with the given branching factor.
    pub fn with_degree(ctx: ServerContext, degree: usize) -> Self {
        assert!(degree >= 1, "tree degree must be at least 1");
        Self {
            ctx,
            degree,
            partitions: Vec::new(),
            listener: None,
            deleter: DeleteActor::new(),
        }
    }

    /// Allocate one manager partition per table partition and register the
    /// route listener.
    ///
    /// # Panics
    /// Panics if the manager is already initialized.
    pub fn initialize(&mut self, table: &mut TreeTable) {
        assert!(self.listener.is_none(), "tree manager initialized twice");
        self.partitions = (0..table.partition_count())
            .map(|id| ManagerPartition::new(id, self.degree))
            .collect();
        self.listener = Some(table.register());
    }

    /// Unregister the route listener and dispose all partitions.
    pub fn terminate(&mut self, table: &mut TreeTable) {
        if let Some(listener) = self.listener.take() {
            table.unregister(listener);
        }
        self.partitions.clear();
    }

    /// The number of manager partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Get a manager partition by index.
    pub fn partition(&self, id: PartitionId) -> &ManagerPartition {
        &self.partitions[id]
    }

    /// Returns true once a managed deletion has completed.
    pub fn is_destroyed(&self) -> bool {
        self.deleter.is_destroyed()
    }

    /// Pump listener notifications and partition work queues until the
    /// engine is quiescent: every pending route change has been applied and
    /// every marked tree rebuilt. Route notifications issued by a rebuild
    /// are picked up in a later round, never from within the rebuild.
    pub fn run(&mut self, table: &mut TreeTable) {
        let Some(listener) = self.listener else {
            return;
        };
        loop {
            let mut did_work = false;
            for part_id in 0..self.partitions.len() {
                for prefix in table.take_notifications(listener, part_id) {
                    did_work = true;
                    self.on_route(table, part_id, prefix);
                }
                let processed =
                    self.partitions[part_id].drain(table.partition_mut(part_id), &self.ctx);
                if processed > 0 {
                    did_work = true;
                    if self.partitions[part_id].is_empty() {
                        self.may_resume_delete(table);
                    }
                }
                if self.deleter.is_destroyed() {
                    return;
                }
            }
            if !did_work {
                return;
            }
        }
    }

    /// The route listener. Creates, refreshes, or deletes the forwarder
    /// attached to the route and schedules the owning group entry for a
    /// rebuild. Group entries are never destroyed here; only the queue
    /// worker drops them.
    fn on_route(&mut self, table: &mut TreeTable, part_id: PartitionId, prefix: McastPrefix) {
        let listener = self.listener.expect("listener is registered while running");
        debug_assert_eq!(table.partition_of(&prefix), part_id);
        let tbl = table.partition_mut(part_id);
        let state = tbl.get_state(listener, &prefix).copied();
        let route = tbl.find(&prefix).cloned();

        let Some(state) = state else {
            // No state yet: ignore dead routes, otherwise create the
            // forwarder and attach it to the route.
            let Some(route) = route else {
                return;
            };
            if route.is_deleted() || route.best_path().is_none() {
                return;
            }
            let Some(forwarder) = Forwarder::from_route(&route) else {
                debug!("ignoring malformed route {prefix}");
                return;
            };
            let fref = ForwarderRef {
                sg: prefix.sg(),
                level: forwarder.level(),
                key: forwarder.key(),
            };
            let partition = &mut self.partitions[part_id];
            partition.locate(fref.sg).add_forwarder(forwarder);
            partition.enqueue(fref.sg);
            tbl.set_state(listener, prefix, fref);
            return;
        };

        let route = route.unwrap_or_else(|| {
            panic!("route {prefix} vanished while listener state was attached")
        });
        if route.is_deleted() {
            let _ = tbl.clear_state(listener, &prefix);
            let partition = &mut self.partitions[part_id];
            partition.delete_forwarder(state, tbl);
            partition.enqueue(state.sg);
        } else {
            let partition = &mut self.partitions[part_id];
            let entry = partition.find_mut(state.sg).expect("entry of a tracked forwarder");
            let changed = entry
                .forwarder_mut(state.level, state.key)
                .expect("tracked forwarder is in its entry")
                .update_from(&route);
            // also pick entries back up whose last rebuild failed
            let pending = entry.rebuild_pending();
            if changed || pending {
                partition.enqueue(state.sg);
            }
        }
    }

    /// Build the outbound attribute for a route from its attached forwarder,
    /// or `None` if the route has no forwarder or the forwarder is not part
    /// of the current tree. Called by the table export path when
    /// re-advertising the route to its originating peer.
    pub fn export_update(&self, table: &TreeTable, prefix: &McastPrefix) -> Option<OutboundAttr> {
        let listener = self.listener?;
        let part_id = table.partition_of(prefix);
        let fref = *table.partition(part_id).get_state(listener, prefix)?;
        let entry = self.partitions[part_id].find(fref.sg)?;
        let siblings = entry.forwarders(fref.level);
        siblings.get(&fref.key)?.export(siblings, &self.ctx.attr_db)
    }

    /// Returns true if the manager could be deleted right now: every
    /// partition has drained its group entries.
    pub fn may_delete(&self) -> bool {
        self.partitions.iter().all(ManagerPartition::is_empty)
    }

    /// Request deletion of the manager. Deletion completes once every
    /// partition is empty: either immediately, or from the drain that
    /// empties the last partition. Completion unregisters the listener and
    /// disposes all partitions.
    pub fn managed_delete(&mut self, table: &mut TreeTable) {
        self.deleter.request();
        self.may_resume_delete(table);
    }

    /// Re-evaluate a pending deletion. Runs the final teardown exactly once,
    /// when deletion was requested and the last partition has emptied.
    fn may_resume_delete(&mut self, table: &mut TreeTable) {
        if self.deleter.resume(self.may_delete()) {
            debug!("tree manager drained, running final teardown");
            self.terminate(table);
        }
    }
}
