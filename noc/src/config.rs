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

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::routing::{PickAlgorithm, RoutingAlgorithm};
use crate::Cycle;
use crate::Error;

/// A default flit payload size, in bytes.
pub const FLIT_SIZE: usize = 16;

/// Message classes carried by a virtual network.
///
/// Data vnets get deep per-VC buffers, control vnets shallow ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum VnetKind {
    Ctrl,
    Data,
}

/// Parameters for one virtual network.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct VnetConfig {
    pub kind: VnetKind,
    /// Ordered vnets deliver packets between a node pair in injection order.
    pub ordered: bool,
}

impl VnetConfig {
    pub fn ctrl() -> Self {
        Self {
            kind: VnetKind::Ctrl,
            ordered: false,
        }
    }
    pub fn data() -> Self {
        Self {
            kind: VnetKind::Data,
            ordered: false,
        }
    }
}

/// Parameters for the interconnect fabric.
///
/// Constructed programmatically or read from a config file. Selector
/// fields (`routing_algorithm`, `pick_algorithm`) use the numeric
/// encoding of the command line interface; `validate` checks them.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Topology shape: "Ring" or "Torus".
    pub topology: String,
    /// Number of generic (cpu-like) nodes attached to the fabric.
    pub num_cpus: usize,
    /// Number of DMA controller nodes, attached after the cpus.
    pub num_dmas: usize,
    /// Torus radix (routers per dimension).
    pub num_ary: usize,
    /// Torus dimensionality.
    pub num_dim: usize,
    /// Rows of a 2D layout; 0 lets the topology derive it.
    pub num_rows: usize,
    /// Populate links in both directions around each ring.
    pub enable_bidirectional: bool,
    /// Cycles a flit spends on a link.
    pub link_latency: Cycle,
    /// Cycles between flit arrival and switch allocation eligibility.
    pub router_latency: Cycle,
    /// Flit payload size in bytes; packets are segmented to this.
    pub ni_flit_size: usize,
    pub vcs_per_vnet: usize,
    pub buffers_per_data_vc: usize,
    pub buffers_per_ctrl_vc: usize,
    /// 0: weight table, 1: XY, 2: deterministic, 3: static adaptive,
    /// 4: dynamic adaptive.
    pub routing_algorithm: u32,
    /// 0: random, 1: minimum congestion, 2: straight lines.
    pub pick_algorithm: u32,
    /// Upper bound on dimension reversals per flit.
    pub dr_lim: u32,
    /// Upper bound on misrouting hops per flit.
    pub misrouting_lim: u32,
    /// VCs reserved for the throttled class (0) of dynamic adaptive
    /// routing; 0 disables throttling.
    pub throttling_degree: usize,
    /// VCs per vnet available to the adaptive classes; the rest hold
    /// the escape channels.
    pub vcs_adaptive: usize,
    pub enable_fault_model: bool,
    /// Cycles a flit may stall at one router before the monitor trips.
    pub deadlock_threshold: Cycle,
    pub vnets: Vec<VnetConfig>,
    /// Seed for the simulation rng; equal seeds replay equal runs.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            topology: "Ring".to_string(),
            num_cpus: 16,
            num_dmas: 0,
            num_ary: 0,
            num_dim: 0,
            num_rows: 0,
            enable_bidirectional: true,
            link_latency: 1,
            router_latency: 1,
            ni_flit_size: FLIT_SIZE,
            vcs_per_vnet: 4,
            buffers_per_data_vc: 4,
            buffers_per_ctrl_vc: 1,
            routing_algorithm: 0,
            pick_algorithm: 0,
            dr_lim: 0,
            misrouting_lim: 0,
            throttling_degree: 0,
            vcs_adaptive: 4,
            enable_fault_model: false,
            deadlock_threshold: 50_000,
            vnets: vec![VnetConfig::ctrl(), VnetConfig::ctrl(), VnetConfig::data()],
            seed: 0,
        }
    }
}

impl NetworkConfig {
    #[allow(dead_code)]
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }
    #[allow(dead_code)]
    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }

    pub fn num_routers(&self) -> usize {
        match self.topology.as_str() {
            "Ring" => self.num_cpus,
            "Torus" => self.num_ary.pow(self.num_dim as u32),
            _ => 0,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_cpus + self.num_dmas
    }

    pub fn num_vnets(&self) -> usize {
        self.vnets.len()
    }

    /// Total VCs on every port (all vnets).
    pub fn num_vcs(&self) -> usize {
        self.vnets.len() * self.vcs_per_vnet
    }

    /// Buffer depth of one VC in the given vnet.
    pub fn vc_depth(&self, vnet: usize) -> usize {
        match self.vnets[vnet].kind {
            VnetKind::Data => self.buffers_per_data_vc,
            VnetKind::Ctrl => self.buffers_per_ctrl_vc,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.topology.as_str() {
            "Ring" => {
                if self.num_cpus < 2 {
                    return Err(Error::InvalidTopology(format!(
                        "a ring needs at least 2 routers, got {}",
                        self.num_cpus
                    )));
                }
            }
            "Torus" => {
                if self.num_ary < 2 || self.num_dim < 1 {
                    return Err(Error::InvalidTopology(format!(
                        "a torus needs ary >= 2 and dim >= 1, got {}-ary {}-cube",
                        self.num_ary, self.num_dim
                    )));
                }
                if self.num_rows != 0 && self.num_rows != self.num_ary {
                    return Err(Error::InvalidConfig(format!(
                        "num_rows {} does not match the torus radix {}",
                        self.num_rows, self.num_ary
                    )));
                }
            }
            other => {
                return Err(Error::InvalidTopology(format!(
                    "unknown shape \"{}\"",
                    other
                )))
            }
        }
        let num_routers = self.num_routers();
        if self.num_cpus == 0 {
            return Err(Error::InvalidConfig("no nodes to attach".to_string()));
        }
        // Nodes are dealt out round-robin; leftovers all land on router 0
        // and must be DMA controllers.
        let remainder = self.num_nodes() % num_routers;
        if remainder != 0 && remainder > self.num_dmas {
            return Err(Error::InvalidConfig(format!(
                "{} leftover nodes on router 0 but only {} DMA controllers",
                remainder, self.num_dmas
            )));
        }

        if self.vnets.is_empty() {
            return Err(Error::InvalidConfig("at least one vnet".to_string()));
        }
        if self.vcs_per_vnet == 0 {
            return Err(Error::InvalidConfig("vcs_per_vnet must be > 0".to_string()));
        }
        if self.buffers_per_data_vc == 0 || self.buffers_per_ctrl_vc == 0 {
            return Err(Error::InvalidConfig(
                "VC buffer depths must be > 0".to_string(),
            ));
        }
        if self.link_latency == 0 || self.router_latency == 0 {
            return Err(Error::InvalidConfig(
                "link and router latencies must be > 0".to_string(),
            ));
        }
        if self.ni_flit_size == 0 {
            return Err(Error::InvalidConfig("ni_flit_size must be > 0".to_string()));
        }

        let routing = RoutingAlgorithm::try_from(self.routing_algorithm)?;
        PickAlgorithm::try_from(self.pick_algorithm)?;
        if routing != RoutingAlgorithm::WeightTable && self.topology != "Torus" {
            return Err(Error::InvalidConfig(format!(
                "{:?} routing needs a torus",
                routing
            )));
        }
        match routing {
            RoutingAlgorithm::WeightTable => {}
            RoutingAlgorithm::Xy => {
                if self.num_dim != 2 || !self.enable_bidirectional {
                    return Err(Error::InvalidConfig(
                        "XY routing needs a bidirectional 2-cube".to_string(),
                    ));
                }
            }
            RoutingAlgorithm::Deterministic => {
                // The dateline scheme splits each vnet in two classes.
                if self.vcs_per_vnet < 2 {
                    return Err(Error::InvalidConfig(
                        "deterministic routing needs vcs_per_vnet >= 2".to_string(),
                    ));
                }
            }
            RoutingAlgorithm::StaticAdaptive | RoutingAlgorithm::DynamicAdaptive => {
                if self.vcs_adaptive == 0 {
                    return Err(Error::InvalidConfig(
                        "adaptive routing needs vcs_adaptive >= 1".to_string(),
                    ));
                }
                if self.vcs_per_vnet < self.vcs_adaptive + 2 {
                    return Err(Error::InvalidConfig(format!(
                        "adaptive routing needs 2 escape VCs on top of {} adaptive ones",
                        self.vcs_adaptive
                    )));
                }
                if self.throttling_degree >= self.vcs_adaptive {
                    return Err(Error::InvalidConfig(format!(
                        "throttling_degree {} must stay below vcs_adaptive {}",
                        self.throttling_degree, self.vcs_adaptive
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parameters of the synthetic traffic source.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// "uniform_random", "shuffle", "tornado" or "transpose".
    pub pattern: String,
    /// Packets per node per cycle.
    pub injection_rate: f64,
    /// Vnet the generated packets travel on.
    pub vnet: usize,
    /// Packet payload size in bytes.
    pub packet_size: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            pattern: "uniform_random".to_string(),
            injection_rate: 0.02,
            vnet: 2,
            packet_size: FLIT_SIZE,
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self, network: &NetworkConfig) -> Result<(), Error> {
        crate::traffic::TrafficPattern::try_from(self.pattern.as_str())?;
        if self.vnet >= network.num_vnets() {
            return Err(Error::InvalidVnet(self.vnet));
        }
        if !(0.0..=1.0).contains(&self.injection_rate) {
            return Err(Error::InvalidConfig(format!(
                "injection rate {} outside [0, 1]",
                self.injection_rate
            )));
        }
        if self.packet_size == 0 {
            return Err(Error::InvalidConfig("packet_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// A full latency/throughput sweep: one simulation per injection rate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SweepConfig {
    pub network: NetworkConfig,
    pub traffic: TrafficConfig,
    /// Rates to sweep; if empty, 50 points at 0.02 steps.
    pub injection_rates: Vec<f64>,
    pub warmup_cycles: Cycle,
    pub sample_cycles: Cycle,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            traffic: TrafficConfig::default(),
            injection_rates: Vec::new(),
            warmup_cycles: 1_000,
            sample_cycles: 10_000,
        }
    }
}

impl SweepConfig {
    #[allow(dead_code)]
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }
    #[allow(dead_code)]
    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }

    pub fn rates(&self) -> Vec<f64> {
        if self.injection_rates.is_empty() {
            (1..=50).map(|i| i as f64 * 0.02).collect()
        } else {
            self.injection_rates.clone()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.network.validate()?;
        self.traffic.validate(&self.network)?;
        if self.sample_cycles == 0 {
            return Err(Error::InvalidConfig(
                "sample_cycles must be > 0".to_string(),
            ));
        }
        for rate in self.rates() {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::InvalidConfig(format!(
                    "injection rate {} outside [0, 1]",
                    rate
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml;

    #[test]
    fn read_yaml_config() {
        let conf_str = "---
topology: Torus
num_cpus: 64
num_dmas: 0
num_ary: 8
num_dim: 2
num_rows: 0
enable_bidirectional: true
link_latency: 1
router_latency: 1
ni_flit_size: 16
vcs_per_vnet: 8
buffers_per_data_vc: 4
buffers_per_ctrl_vc: 1
routing_algorithm: 3
pick_algorithm: 1
dr_lim: 2
misrouting_lim: 0
throttling_degree: 0
vcs_adaptive: 4
enable_fault_model: false
deadlock_threshold: 50000
vnets:
  - kind: Ctrl
    ordered: false
  - kind: Ctrl
    ordered: false
  - kind: Data
    ordered: false
seed: 42
";
        let config = NetworkConfig::from_str(&conf_str);
        assert_eq!(config.topology, "Torus");
        assert_eq!(config.num_cpus, 64);
        assert_eq!(config.num_ary, 8);
        assert_eq!(config.num_dim, 2);
        assert_eq!(config.num_routers(), 64);
        assert_eq!(config.vcs_per_vnet, 8);
        assert_eq!(config.routing_algorithm, 3);
        assert_eq!(config.pick_algorithm, 1);
        assert_eq!(config.dr_lim, 2);
        assert_eq!(config.vcs_adaptive, 4);
        assert_eq!(config.num_vnets(), 3);
        assert_eq!(config.num_vcs(), 24);
        assert_eq!(config.vc_depth(0), 1);
        assert_eq!(config.vc_depth(2), 4);
        assert_eq!(config.seed, 42);
        assert!(config.validate().is_ok());
        println!("{:#?}", config);
    }

    #[test]
    fn write_yaml_config() {
        let mut config = SweepConfig::default();
        config.network.topology = "Torus".to_string();
        config.network.num_cpus = 16;
        config.network.num_ary = 4;
        config.network.num_dim = 2;
        config.injection_rates = vec![0.02, 0.04];
        println!("{}", serde_yaml::to_string(&config).unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_ring_validates() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_routers(), 16);
    }

    #[test]
    fn reject_bad_shapes() {
        let mut config = NetworkConfig::default();
        config.topology = "Mesh".to_string();
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.num_cpus = 1;
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_ary = 1;
        config.num_dim = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_leftover_cpus() {
        // 5 cpus on a 4-router torus: the leftover node on router 0
        // would not be a DMA controller.
        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_cpus = 5;
        config.num_ary = 2;
        config.num_dim = 2;
        assert!(config.validate().is_err());
        config.num_cpus = 4;
        config.num_dmas = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn routing_needs_vc_headroom() {
        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_cpus = 16;
        config.num_ary = 4;
        config.num_dim = 2;
        config.routing_algorithm = 3;
        // 4 adaptive VCs leave no room for the 2 escape VCs.
        config.vcs_per_vnet = 4;
        config.vcs_adaptive = 4;
        assert!(config.validate().is_err());
        config.vcs_per_vnet = 6;
        assert!(config.validate().is_ok());
        config.routing_algorithm = 4;
        config.throttling_degree = 4;
        assert!(config.validate().is_err());
        config.throttling_degree = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn xy_needs_a_bidirectional_2_cube() {
        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_cpus = 27;
        config.num_ary = 3;
        config.num_dim = 3;
        config.routing_algorithm = 1;
        assert!(config.validate().is_err());
        config.num_cpus = 9;
        config.num_dim = 2;
        assert!(config.validate().is_ok());
        config.enable_bidirectional = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn traffic_config_bounds() {
        let network = NetworkConfig::default();
        let mut traffic = TrafficConfig::default();
        assert!(traffic.validate(&network).is_ok());
        traffic.vnet = 3;
        assert!(traffic.validate(&network).is_err());
        traffic.vnet = 0;
        traffic.injection_rate = 1.5;
        assert!(traffic.validate(&network).is_err());
        traffic.injection_rate = 0.1;
        traffic.pattern = "hotspot".to_string();
        assert!(traffic.validate(&network).is_err());
    }
}
