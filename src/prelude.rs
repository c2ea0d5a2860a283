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

//! Module containing the most important structures re-exported for
//! convenience.

pub use crate::attr::{Attr, AttrDb, AttrHandle, OList, OListElem, TunnelEncap};
pub use crate::label::{LabelBlock, LabelBlockRef};
pub use crate::lifetime::{DeleteActor, DeleteState};
pub use crate::table::{
    ListenerId, McastPrefix, McastRoute, McastTable, Path, PathSource, RouteType, TablePartition,
};
pub use crate::tree::{
    Forwarder, ForwarderKey, ForwarderRef, GroupEntry, ManagerPartition, OutboundAttr,
    ServerContext, TreeManager, TreeTable, DEGREE,
};
pub use crate::types::{
    Label, Level, ParseRdError, PartitionId, RebuildError, RouteDistinguisher, SgKey,
};
