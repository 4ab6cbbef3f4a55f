// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cycle-level simulation of k-ary n-cube interconnects: topology
//! construction, virtual-channel routers with adaptive routing, open
//! loop traffic and the sweep trace format.

mod config;
mod deadlock;
mod error;
mod fault;
mod flit;
mod network;
mod router;
mod routing;
mod stats;
mod topology;
mod traffic;
mod vc;

// Public types
// type to use for cycles
pub type Cycle = usize;

pub use crate::config::{
    NetworkConfig, SweepConfig, TrafficConfig, VnetConfig, VnetKind, FLIT_SIZE,
};
pub use crate::deadlock::DeadlockMonitor;
pub use crate::error::Error;
pub use crate::fault::{FaultModel, UniformFaultModel};
pub use crate::flit::{Credit, Flit, FlitType, Packet, Payload, RouteInfo};
pub use crate::network::Network;
pub use crate::router::{InputUnit, OutputUnit, Router};
pub use crate::routing::{PickAlgorithm, RouteDecision, RoutingAlgorithm, RoutingUnit};
pub use crate::stats::{valid_records, Record, Records, StatsRecorder, LATENCY_SCALE, RECORD_LINES};
pub use crate::topology::{
    coordinate, delinearize_index, linearize_index, ExtLink, IntLink, LinkId, NodeKind, Peer,
    PortDirection, PortRef, Shape, Topology,
};
pub use crate::traffic::{TrafficGenerator, TrafficPattern};
pub use crate::vc::{OutVcState, VcScheme, VcState, WaitingQueue};
