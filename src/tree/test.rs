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

//! Unit tests for forwarders and group entries.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use maplit::{btreemap, btreeset};
use pretty_assertions::assert_eq;

use super::*;
use crate::attr::{Attr, TunnelEncap};
use crate::label::{LabelBlock, LabelBlockRef};
use crate::table::{Path, RouteType};
use crate::types::RouteDistinguisher;

const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 1);

fn addr(x: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, x)
}

fn rd(n: u32) -> RouteDistinguisher {
    RouteDistinguisher::new(65000, n)
}

fn assigned(rd: RouteDistinguisher) -> u32 {
    u32::from_be_bytes(rd.bytes()[4..8].try_into().unwrap())
}

fn jp(n: u32) -> McastPrefix {
    McastPrefix::join(rd(n), addr(n as u8), GROUP, SOURCE)
}

fn peer_path(db: &AttrDb, n: u32, block: &LabelBlockRef) -> Path {
    let attr = db
        .locate(Attr { next_hop: Some(addr(n as u8)), ..Default::default() })
        .unwrap();
    Path::peer(attr, Some(block.clone()), BTreeSet::new())
}

fn ctx(db: &AttrDb) -> ServerContext {
    ServerContext::new(addr(254), db.clone())
}

/// Build a group entry holding `n` local forwarders with RDs `1..=n`, all
/// allocating from the same label block.
fn entry_with(
    table: &mut TreeTable,
    db: &AttrDb,
    n: u32,
    block: &LabelBlockRef,
) -> (GroupEntry, PartitionId) {
    let mut entry = GroupEntry::new(SgKey::new(GROUP, SOURCE));
    for i in 1..=n {
        table.add(jp(i), peer_path(db, i, block));
        let route = table.find(&jp(i)).unwrap().clone();
        entry.add_forwarder(Forwarder::from_route(&route).unwrap());
    }
    let part = table.partition_of(&jp(1));
    (entry, part)
}

fn adjacency(entry: &GroupEntry) -> BTreeMap<u32, BTreeSet<u32>> {
    entry
        .forwarders(Level::Local)
        .values()
        .map(|f| {
            (assigned(f.key().rd), f.links().iter().map(|k| assigned(k.rd)).collect())
        })
        .collect()
}

#[test]
fn forwarder_from_join_route() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let attr = db
        .locate(Attr { next_hop: Some(addr(7)), ..Default::default() })
        .unwrap();
    table.add(jp(7), Path::peer(attr, Some(block), btreeset! {TunnelEncap::Gre}));

    let f = Forwarder::from_route(table.find(&jp(7)).unwrap()).unwrap();
    assert_eq!(f.level(), Level::Local);
    assert_eq!(f.address(), Some(addr(7)));
    assert_eq!(f.encap(), &btreeset! {TunnelEncap::Gre});
    assert_eq!(f.label(), 0);
    assert!(f.links().is_empty());
}

#[test]
fn forwarder_from_forest_node_route() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let prefix = McastPrefix::forest_node(addr(254), GROUP, SOURCE);
    let attr = db
        .locate(Attr { next_hop: Some(addr(254)), ..Default::default() })
        .unwrap();
    table.add(prefix, Path::local(attr));

    let f = Forwarder::from_route(table.find(&prefix).unwrap()).unwrap();
    assert_eq!(f.level(), Level::Global);
    assert_eq!(f.address(), None);
    assert_eq!(f.prefix().route_type, RouteType::ForestNode);
    assert!(f.encap().is_empty());
}

#[test]
fn malformed_join_is_rejected() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    // a membership advertisement without a label block
    let attr = db
        .locate(Attr { next_hop: Some(addr(7)), ..Default::default() })
        .unwrap();
    table.add(jp(7), Path::peer(attr, None, BTreeSet::new()));
    assert!(Forwarder::from_route(table.find(&jp(7)).unwrap()).is_none());

    // a membership advertisement without a next-hop
    let attr = db.locate(Attr::default()).unwrap();
    table.add(jp(8), Path::peer(attr, Some(LabelBlock::new(1, 9)), BTreeSet::new()));
    assert!(Forwarder::from_route(table.find(&jp(8)).unwrap()).is_none());
}

#[test]
fn update_from_detects_changes() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    table.add(jp(1), peer_path(&db, 1, &block));
    let mut f = Forwarder::from_route(table.find(&jp(1)).unwrap()).unwrap();

    // same advertisement: no change
    assert!(!f.update_from(table.find(&jp(1)).unwrap()));

    // new encapsulation
    let attr = db
        .locate(Attr { next_hop: Some(addr(1)), ..Default::default() })
        .unwrap();
    table.add(jp(1), Path::peer(attr.clone(), Some(block.clone()), btreeset! {TunnelEncap::Udp}));
    assert!(f.update_from(table.find(&jp(1)).unwrap()));
    assert_eq!(f.encap(), &btreeset! {TunnelEncap::Udp});

    // new label block (identity change, same range)
    table.add(jp(1), Path::peer(attr, Some(LabelBlock::new(1000, 1099)), btreeset! {TunnelEncap::Udp}));
    assert!(f.update_from(table.find(&jp(1)).unwrap()));

    // new address
    table.add(jp(1), peer_path(&db, 2, &block));
    assert!(f.update_from(table.find(&jp(1)).unwrap()));
    assert_eq!(f.address(), Some(addr(2)));
}

#[test]
#[should_panic(expected = "linked to itself")]
fn self_link_panics() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    table.add(jp(1), peer_path(&db, 1, &block));
    let mut f = Forwarder::from_route(table.find(&jp(1)).unwrap()).unwrap();
    let key = f.key();
    f.add_link(key);
}

#[test]
#[should_panic(expected = "linked twice")]
fn duplicate_link_panics() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    table.add(jp(1), peer_path(&db, 1, &block));
    table.add(jp(2), peer_path(&db, 2, &block));
    let mut f = Forwarder::from_route(table.find(&jp(1)).unwrap()).unwrap();
    let peer = Forwarder::from_route(table.find(&jp(2)).unwrap()).unwrap();
    f.add_link(peer.key());
    f.add_link(peer.key());
}

#[test]
fn five_forwarders_degree_four() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 5, &block);

    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    assert_eq!(
        adjacency(&entry),
        btreemap! {
            1 => btreeset! {2, 3, 4, 5},
            2 => btreeset! {1},
            3 => btreeset! {1},
            4 => btreeset! {1},
            5 => btreeset! {1},
        }
    );
    assert!(entry.forwarders(Level::Local).values().all(|f| f.label() != 0));
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(5));
    assert!(!entry.rebuild_pending());
}

#[test]
fn six_forwarders_degree_two() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 6, &block);

    entry.rebuild_all(2, table.partition_mut(part), &ctx(&db));

    assert_eq!(
        adjacency(&entry),
        btreemap! {
            1 => btreeset! {2, 3},
            2 => btreeset! {1, 4, 5},
            3 => btreeset! {1, 6},
            4 => btreeset! {2},
            5 => btreeset! {2},
            6 => btreeset! {3},
        }
    );
}

#[test]
fn single_forwarder_tree() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 1, &block);

    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    let f = entry.forwarders(Level::Local).values().next().unwrap();
    assert_ne!(f.label(), 0);
    assert!(f.links().is_empty());
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(1));
    // a lone node has nothing to replicate to
    assert!(f.export(entry.forwarders(Level::Local), &db).is_none());
}

#[test]
fn export_carries_peer_labels() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 3, &block);
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    let set = entry.forwarders(Level::Local);
    let root = set.values().next().unwrap();
    let update = root.export(set, &db).unwrap();
    assert_eq!(update.label, root.label());
    let olist = update.attr.olist.as_ref().unwrap();
    let mut targets: Vec<_> = olist.0.iter().map(|e| (e.address, e.label)).collect();
    targets.sort();
    let mut expected: Vec<_> =
        set.values().skip(1).map(|f| (f.address().unwrap(), f.label())).collect();
    expected.sort();
    assert_eq!(targets, expected);
}

#[test]
fn rebuild_failure_rolls_back() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1001);
    let (mut entry, part) = entry_with(&mut table, &db, 3, &block);

    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    assert_eq!(block.in_use(), 0);
    assert!(entry.forwarders(Level::Local).values().all(|f| f.label() == 0));
    assert!(entry.forwarders(Level::Local).values().all(|f| f.links().is_empty()));
    assert_eq!(entry.forest_node(), None);
    assert!(entry.rebuild_pending());
    // the root was never advertised
    assert!(table.find(&McastPrefix::forest_node(addr(254), GROUP, SOURCE)).is_none());
}

#[test]
fn rebuild_retries_after_capacity_returns() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1002);
    let (mut entry, part) = entry_with(&mut table, &db, 4, &block);

    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert!(entry.rebuild_pending());

    // one peer leaves; three labels now suffice
    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(4), router_id: addr(4) },
        table.partition_mut(part),
    );
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    assert!(!entry.rebuild_pending());
    assert_eq!(block.in_use(), 3);
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(3));
}

#[test]
fn growth_past_capacity_withdraws_the_forest_route() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1003);
    let (mut entry, part) = entry_with(&mut table, &db, 4, &block);
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(4));
    let forest = McastPrefix::forest_node(addr(254), GROUP, SOURCE);
    assert!(table.find(&forest).is_some());

    // a fifth peer joins, allocating from the same exhausted block
    table.add(jp(5), peer_path(&db, 5, &block));
    let route = table.find(&jp(5)).unwrap().clone();
    entry.add_forwarder(Forwarder::from_route(&route).unwrap());
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    // the failed rebuild left no tree, and the old root is no longer
    // advertised as if it still had one
    assert!(entry.rebuild_pending());
    assert_eq!(block.in_use(), 0);
    assert!(entry.forwarders(Level::Local).values().all(|f| f.label() == 0));
    assert_eq!(entry.forest_node(), None);
    assert!(table.find(&forest).is_none());

    // one peer leaves; the retry rebuilds and re-advertises the root
    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(1), router_id: addr(1) },
        table.partition_mut(part),
    );
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert!(!entry.rebuild_pending());
    assert_eq!(block.in_use(), 4);
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(5));
    let route = table.find(&forest).expect("forest node is re-advertised");
    assert_eq!(route.best_path().unwrap().attr.source_rd, Some(rd(5)));
}

#[test]
fn attr_db_exhaustion_rolls_back() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 2, &block);

    db.set_limit(Some(0));
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert!(entry.rebuild_pending());
    assert_eq!(block.in_use(), 0);

    db.set_limit(None);
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert!(!entry.rebuild_pending());
    assert_eq!(block.in_use(), 2);
}

#[test]
fn deleting_forest_node_withdraws_route() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 2, &block);
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));

    let forest = McastPrefix::forest_node(addr(254), GROUP, SOURCE);
    let route = table.find(&forest).expect("forest node is advertised");
    assert_eq!(route.best_path().unwrap().attr.source_rd, Some(rd(2)));

    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(2), router_id: addr(2) },
        table.partition_mut(part),
    );
    assert_eq!(entry.forest_node(), None);
    assert!(table.find(&forest).is_none());

    // the next rebuild promotes the remaining forwarder
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert_eq!(entry.forest_node().map(|k| assigned(k.rd)), Some(1));
    let route = table.find(&forest).expect("forest node is re-advertised");
    assert_eq!(route.best_path().unwrap().attr.source_rd, Some(rd(1)));
}

#[test]
fn delete_forwarder_releases_label_and_links() {
    let db = AttrDb::new();
    let mut table = TreeTable::new(4);
    let block = LabelBlock::new(1000, 1099);
    let (mut entry, part) = entry_with(&mut table, &db, 3, &block);
    entry.rebuild_all(4, table.partition_mut(part), &ctx(&db));
    assert_eq!(block.in_use(), 3);

    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(2), router_id: addr(2) },
        table.partition_mut(part),
    );
    assert_eq!(block.in_use(), 2);
    // the victim's links are gone from its peers
    for f in entry.forwarders(Level::Local).values() {
        assert!(f.links().iter().all(|k| assigned(k.rd) != 2));
    }
    assert!(!entry.is_empty());
    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(1), router_id: addr(1) },
        table.partition_mut(part),
    );
    entry.delete_forwarder(
        Level::Local,
        ForwarderKey { rd: rd(3), router_id: addr(3) },
        table.partition_mut(part),
    );
    assert!(entry.is_empty());
    assert_eq!(block.in_use(), 0);
}
