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

//! Per-(group, source) aggregation of joined forwarders and their
//! distribution tree.

use itertools::Itertools;
use log::{debug, warn};

use super::forwarder::{Forwarder, ForwarderKey, ForwarderSet};
use super::{ForwarderRef, ServerContext};
use crate::attr::Attr;
use crate::table::{McastPrefix, Path, PathSource, TablePartition};
use crate::types::{Level, RebuildError, SgKey};

/// One (group, source) pair: the forwarders joined at each level, the
/// current distribution tree over the local ones, and the synthesized route
/// advertising the chosen tree root.
///
/// We traverse the forwarders in sorted order and arrange them in breadth
/// first fashion in a k-ary tree. Building the tree in this manner
/// guarantees that we get the same tree for a given set of forwarders,
/// independent of the order in which they joined. This predictability is
/// deemed to be more important than other criteria such as minimizing
/// disruption of traffic or the cost of the tree.
#[derive(Debug)]
pub struct GroupEntry {
    sg: SgKey,
    forwarders: [ForwarderSet; 2],
    forest_node: Option<ForwarderKey>,
    forest_route: Option<McastPrefix>,
    needs_rebuild: [bool; 2],
    pub(crate) on_queue: bool,
}

impl GroupEntry {
    pub(crate) fn new(sg: SgKey) -> Self {
        Self {
            sg,
            forwarders: [ForwarderSet::new(), ForwarderSet::new()],
            forest_node: None,
            forest_route: None,
            needs_rebuild: [false; 2],
            on_queue: false,
        }
    }

    /// The (group, source) pair of this entry.
    pub fn sg(&self) -> SgKey {
        self.sg
    }

    /// The forwarders joined at the given level, in tree order.
    pub fn forwarders(&self, level: Level) -> &ForwarderSet {
        &self.forwarders[level.index()]
    }

    pub(crate) fn forwarder_mut(
        &mut self,
        level: Level,
        key: ForwarderKey,
    ) -> Option<&mut Forwarder> {
        self.forwarders[level.index()].get_mut(&key)
    }

    /// The current tree root: the greatest local forwarder at the time of
    /// the last rebuild.
    pub fn forest_node(&self) -> Option<ForwarderKey> {
        self.forest_node
    }

    /// Returns true if both levels are empty. Empty entries are destroyed by
    /// the partition worker.
    pub fn is_empty(&self) -> bool {
        self.forwarders.iter().all(ForwarderSet::is_empty)
    }

    /// Returns true while some level still needs a rebuild, including after
    /// a rebuild failed and must be retried.
    pub fn rebuild_pending(&self) -> bool {
        self.needs_rebuild.iter().any(|f| *f)
    }

    /// Insert a forwarder and mark its level for a rebuild. The caller
    /// schedules the entry on the partition work queue.
    pub(crate) fn add_forwarder(&mut self, forwarder: Forwarder) {
        let level = forwarder.level();
        let old = self.forwarders[level.index()].insert(forwarder.key(), forwarder);
        assert!(old.is_none(), "two forwarders for one route under {self}");
        self.needs_rebuild[level.index()] = true;
    }

    /// Remove a forwarder and mark its level for a rebuild. Tears down the
    /// forest-node route first when the victim is the current tree root,
    /// unlinks it from its peers, and releases its label. The caller
    /// schedules the entry on the partition work queue.
    pub(crate) fn delete_forwarder(
        &mut self,
        level: Level,
        key: ForwarderKey,
        tbl: &mut TablePartition<ForwarderRef>,
    ) {
        if self.forest_node == Some(key) {
            self.del_forest_route(tbl);
        }
        let mut forwarder = self.forwarders[level.index()]
            .remove(&key)
            .expect("deleted forwarder is tracked");
        for peer in forwarder.links().to_vec() {
            if let Some(peer) = self.forwarders[level.index()].get_mut(&peer) {
                peer.remove_link(key);
            }
        }
        forwarder.clear_links();
        forwarder.release_label();
        self.needs_rebuild[level.index()] = true;
    }

    /// Rebuild the distribution tree of every level that was marked. A
    /// failed level is rolled back (labels released, links cleared) and left
    /// marked, so a later drain retries it.
    pub(crate) fn rebuild_all(
        &mut self,
        degree: usize,
        tbl: &mut TablePartition<ForwarderRef>,
        ctx: &ServerContext,
    ) {
        for level in Level::ALL {
            if let Err(e) = self.rebuild(level, degree, tbl, ctx) {
                warn!("rebuild of {self} at level {level} failed: {e}");
                self.abort_rebuild(level, tbl);
            }
        }
    }

    /// Rebuild the tree at one level: release the previous tree, then walk
    /// the forwarders in sorted order and link each to its parent in a
    /// breadth-first complete k-ary tree, allocating one label per
    /// forwarder. Finally re-advertise the tree root. Global-level trees are
    /// not built in this version; the level is tracked but the rebuild just
    /// acknowledges it.
    fn rebuild(
        &mut self,
        level: Level,
        degree: usize,
        tbl: &mut TablePartition<ForwarderRef>,
        ctx: &ServerContext,
    ) -> Result<(), RebuildError> {
        if !self.needs_rebuild[level.index()] {
            return Ok(());
        }
        if level == Level::Global {
            self.needs_rebuild[level.index()] = false;
            return Ok(());
        }
        assert!(degree >= 1, "tree degree must be at least 1");

        // Get rid of the previous tree.
        let set = &mut self.forwarders[level.index()];
        for forwarder in set.values_mut() {
            forwarder.clear_links();
            forwarder.release_label();
        }

        // Link every forwarder to its parent, and the parent back to it.
        let keys = set.keys().copied().collect_vec();
        for (idx, key) in keys.iter().enumerate() {
            set.get_mut(key).expect("snapshot of the set").allocate_label()?;
            if idx == 0 {
                continue;
            }
            let parent = keys[(idx - 1) / degree];
            set.get_mut(key).expect("snapshot of the set").add_link(parent);
            set.get_mut(&parent).expect("snapshot of the set").add_link(*key);
        }

        self.update_forest_route(tbl, ctx)?;

        // Queue every route for a fresh attribute pull. Listeners observe
        // this strictly after the rebuild; a failed rebuild surfaces
        // nothing and is retried on a later drain instead.
        for forwarder in self.forwarders[level.index()].values() {
            tbl.notify(forwarder.prefix());
        }
        self.needs_rebuild[level.index()] = false;
        debug!("rebuilt tree for {self}: {} forwarders, degree {degree}", keys.len());
        Ok(())
    }

    /// Roll a failed rebuild back: no label and no link of the aborted tree
    /// survives, and the previous tree root is withdrawn rather than left
    /// advertised while no tree stands behind it. The level stays marked for
    /// a retry, which re-advertises the then-current root.
    fn abort_rebuild(&mut self, level: Level, tbl: &mut TablePartition<ForwarderRef>) {
        for forwarder in self.forwarders[level.index()].values_mut() {
            forwarder.clear_links();
            forwarder.release_label();
        }
        if level == Level::Local {
            self.del_forest_route(tbl);
        }
    }

    /// Re-advertise the tree root if it changed: withdraw the previous
    /// forest-node route and synthesize one for the new root, carrying the
    /// local router-id as next-hop and the root's route distinguisher as
    /// source.
    fn update_forest_route(
        &mut self,
        tbl: &mut TablePartition<ForwarderRef>,
        ctx: &ServerContext,
    ) -> Result<(), RebuildError> {
        let new_root = self.forwarders[Level::Local.index()].keys().next_back().copied();
        if new_root == self.forest_node {
            return Ok(());
        }
        self.del_forest_route(tbl);
        let Some(root) = new_root else {
            return Ok(());
        };
        let attr = ctx.attr_db.locate(Attr {
            next_hop: Some(ctx.router_id),
            source_rd: Some(root.rd),
            olist: None,
        })?;
        let prefix = McastPrefix::forest_node(ctx.router_id, self.sg.group, self.sg.source);
        tbl.add(prefix, Path::local(attr));
        self.forest_node = Some(root);
        self.forest_route = Some(prefix);
        Ok(())
    }

    /// Withdraw the forest-node route, if any. The route disappears from
    /// the table once its local path was the last one.
    pub(crate) fn del_forest_route(&mut self, tbl: &mut TablePartition<ForwarderRef>) {
        let Some(prefix) = self.forest_route.take() else {
            return;
        };
        assert!(self.forest_node.is_some(), "forest-node route without a forest node");
        self.forest_node = None;
        tbl.remove_path(&prefix, PathSource::Local);
    }
}

impl std::fmt::Display for GroupEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sg)
    }
}
