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

//! End-to-end tests driving the engine through the route table, the way the
//! surrounding pipeline does.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use crate::prelude::*;


const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 1);
const ROUTER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

fn addr(x: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, x)
}

fn rd(n: u32) -> RouteDistinguisher {
    RouteDistinguisher::new(65000, n)
}

fn assigned(rd: RouteDistinguisher) -> u32 {
    u32::from_be_bytes(rd.bytes()[4..8].try_into().unwrap())
}

/// The prefix of peer `n`'s membership advertisement for the default group.
fn jp(n: u32) -> McastPrefix {
    McastPrefix::join(rd(n), addr(n as u8), GROUP, SOURCE)
}

/// A route table plus a tree manager listening on it, with one label block
/// per peer.
struct Harness {
    table: TreeTable,
    manager: TreeManager,
    attr_db: AttrDb,
    blocks: BTreeMap<u32, LabelBlockRef>,
}

impl Harness {
    fn new(partitions: usize, degree: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let attr_db = AttrDb::new();
        let mut table = TreeTable::new(partitions);
        let ctx = ServerContext::new(ROUTER_ID, attr_db.clone());
        let mut manager = TreeManager::with_degree(ctx, degree);
        manager.initialize(&mut table);
        Self { table, manager, attr_db, blocks: BTreeMap::new() }
    }

    /// The label block peer `n` advertises.
    fn block(&mut self, n: u32) -> LabelBlockRef {
        self.blocks.entry(n).or_insert_with(|| LabelBlock::new(1000, 1999)).clone()
    }

    /// Peer `n` joins the given (group, source) pair.
    fn join_sg(&mut self, group: Ipv4Addr, source: Ipv4Addr, n: u32) {
        let block = self.block(n);
        let attr = self
            .attr_db
            .locate(Attr { next_hop: Some(addr(n as u8)), ..Default::default() })
            .unwrap();
        self.table.add(
            McastPrefix::join(rd(n), addr(n as u8), group, source),
            Path::peer(attr, Some(block), BTreeSet::new()),
        );
    }

    /// Peer `n` joins the default group.
    fn join(&mut self, n: u32) {
        self.join_sg(GROUP, SOURCE, n);
    }

    /// Peer `n` leaves the default group.
    fn leave(&mut self, n: u32) {
        self.table.delete(&jp(n));
    }

    /// Run the engine to quiescence.
    fn drain(&mut self) {
        self.manager.run(&mut self.table);
    }

    /// The partition of the default group.
    fn part(&self) -> PartitionId {
        self.table.partition_of(&jp(1))
    }

    /// The group entry of the default group, if any.
    fn entry(&self) -> Option<&GroupEntry> {
        self.manager.partition(self.part()).find(SgKey::new(GROUP, SOURCE))
    }

    /// The local-level adjacency relation of the default group, keyed by the
    /// assigned number of each forwarder's route distinguisher.
    fn adjacency(&self) -> BTreeMap<u32, BTreeSet<u32>> {
        self.entry()
            .map(|entry| {
                entry
                    .forwarders(Level::Local)
                    .values()
                    .map(|f| {
                        (assigned(f.key().rd), f.links().iter().map(|k| assigned(k.rd)).collect())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The labels of the local forwarders of the default group.
    fn labels(&self) -> BTreeMap<u32, Label> {
        self.entry()
            .map(|entry| {
                entry
                    .forwarders(Level::Local)
                    .values()
                    .map(|f| (assigned(f.key().rd), f.label()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The assigned number of the current forest node of the default group.
    fn forest_node(&self) -> Option<u32> {
        self.entry().and_then(|e| e.forest_node()).map(|k| assigned(k.rd))
    }

    /// The outbound attribute peer `n` would be sent.
    fn export(&self, n: u32) -> Option<OutboundAttr> {
        self.manager.export_update(&self.table, &jp(n))
    }

    /// Check that every tree link of the default group is symmetric.
    fn assert_symmetric(&self) {
        let Some(entry) = self.entry() else {
            return;
        };
        for level in Level::ALL {
            let set = entry.forwarders(level);
            for f in set.values() {
                for link in f.links() {
                    let peer = set.get(link).expect("links stay within the level");
                    assert!(
                        peer.links().contains(&f.key()),
                        "link {} -> {} has no reverse",
                        f.key().rd,
                        peer.key().rd,
                    );
                }
            }
        }
    }
}
