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

//! The cycle-level network: routers wired by latency-modelling link
//! queues, with a network interface per node.
//!
//! Every cycle proceeds in fixed phases: link arrivals are delivered,
//! interfaces eject and inject, routers run switch allocation, outputs
//! and credits drain onto the links, and the deadlock monitor accounts
//! the cycle. All cross-router state changes ride a link queue, so a
//! router only ever sees state that is at least one cycle old.

use log::{debug, info};
use std::collections::{HashMap, VecDeque};

use crate::deadlock::DeadlockMonitor;
use crate::fault::{FaultModel, UniformFaultModel};
use crate::flit::{Credit, Flit, Packet};
use crate::router::Router;
use crate::stats::StatsRecorder;
use crate::topology::{LinkId, PortDirection, Topology};
use crate::traffic::TrafficGenerator;
use crate::vc::{OutVcState, VcScheme, VcState};
use crate::Cycle;
use crate::Error;
use crate::NetworkConfig;

/// Per-buffer rate used when the fault model is enabled.
const FAULT_RATE_PER_BUFFER: f64 = 1e-5;

/// A wire with latency: items pushed at cycle `t` pop at `t + latency`.
struct LinkQueue<T> {
    latency: Cycle,
    queue: VecDeque<(Cycle, T)>,
}

impl<T> LinkQueue<T> {
    fn new(latency: Cycle) -> Self {
        assert!(latency > 0);
        Self {
            latency,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, item: T, now: Cycle) {
        self.queue.push_back((now + self.latency, item));
    }

    fn pop_ready(&mut self, now: Cycle) -> Option<T> {
        if self.queue.front().map_or(false, |(at, _)| *at <= now) {
            self.queue.pop_front().map(|(_, item)| item)
        } else {
            None
        }
    }
}

/// One node's attachment point: unbounded source queues on the way in,
/// packet reassembly on the way out, and the credit mirror of the
/// router's local input port in between.
struct NetworkInterface {
    scheme: VcScheme,
    vcs_per_vnet: usize,
    out_vcs: Vec<OutVcState>,
    /// Flitisized packets awaiting injection, per vnet.
    source: Vec<VecDeque<Flit>>,
    /// VC the in-flight packet of each vnet occupies.
    inject_vc: Vec<Option<usize>>,
    /// Flits of partially arrived packets, per ejection VC.
    assembly: Vec<Vec<Flit>>,
    rr_vnet: usize,
}

impl NetworkInterface {
    fn new(scheme: VcScheme, num_vnets: usize, depths: &[usize]) -> Self {
        let num_vcs = num_vnets * scheme.vcs_per_vnet;
        Self {
            scheme,
            vcs_per_vnet: scheme.vcs_per_vnet,
            out_vcs: (0..num_vcs)
                .map(|vc| OutVcState::new(depths[vc / scheme.vcs_per_vnet]))
                .collect(),
            source: vec![VecDeque::new(); num_vnets],
            inject_vc: vec![None; num_vnets],
            assembly: vec![Vec::new(); num_vcs],
            rr_vnet: 0,
        }
    }

    fn enqueue(&mut self, vnet: usize, flits: Vec<Flit>) {
        self.source[vnet].extend(flits);
    }

    fn queued_flits(&self) -> usize {
        self.source.iter().map(|q| q.len()).sum()
    }

    /// Pick the injection VC for a fresh head flit: free and credited,
    /// emptiest downstream first.
    fn select_vc(&self, vnet: usize) -> Option<usize> {
        let base = vnet * self.vcs_per_vnet;
        let range = self.scheme.class_range(self.scheme.injection_class());
        (base + range.start..base + range.end)
            .filter(|vc| self.out_vcs[*vc].is_idle() && self.out_vcs[*vc].has_credit())
            .min_by_key(|vc| self.out_vcs[*vc].occupancy())
    }

    /// At most one flit leaves per cycle; vnets take turns.
    fn inject_flit(&mut self, now: Cycle) -> Option<Flit> {
        for _ in 0..self.source.len() {
            let vnet = self.rr_vnet;
            self.rr_vnet = (self.rr_vnet + 1) % self.source.len();
            let is_head = match self.source[vnet].front() {
                Some(flit) => flit.kind.is_head(),
                None => continue,
            };
            let vc = if is_head {
                match self.select_vc(vnet) {
                    Some(vc) => vc,
                    None => continue,
                }
            } else {
                let vc = self.inject_vc[vnet].expect("body flit without a live VC");
                if !self.out_vcs[vc].has_credit() {
                    continue;
                }
                vc
            };
            let mut flit = self.source[vnet].pop_front().unwrap();
            flit.vc = vc;
            flit.inject_cycle = now;
            self.out_vcs[vc].decrement_credit();
            if flit.kind.is_head() {
                self.out_vcs[vc].set_state(VcState::Active);
                self.inject_vc[vnet] = Some(vc);
            }
            if flit.kind.is_tail() {
                self.inject_vc[vnet] = None;
            }
            return Some(flit);
        }
        None
    }

    fn credit_arrived(&mut self, credit: Credit) {
        self.out_vcs[credit.vc].increment_credit();
        if credit.is_free_signal {
            self.out_vcs[credit.vc].set_state(VcState::Idle);
        }
    }

    /// Accept one ejected flit; a completed packet comes back with the
    /// credit for the slot it freed.
    fn receive_flit(&mut self, flit: Flit) -> (Credit, Option<Packet>) {
        let credit = Credit {
            vc: flit.vc,
            is_free_signal: flit.kind.is_tail(),
        };
        let vc = flit.vc;
        let is_tail = flit.kind.is_tail();
        self.assembly[vc].push(flit);
        let packet = if is_tail {
            let flits = std::mem::take(&mut self.assembly[vc]);
            let size = flits.len() * flits[0].payload.len() / 8;
            Some(Packet::from_flits(&flits, size))
        } else {
            None
        };
        (credit, packet)
    }
}

pub struct Network {
    config: NetworkConfig,
    topo: Topology,
    scheme: VcScheme,
    routers: Vec<Router>,
    interfaces: Vec<NetworkInterface>,
    /// Flits node -> router and router -> node, per external link.
    inject_flits: Vec<LinkQueue<Flit>>,
    eject_flits: Vec<LinkQueue<Flit>>,
    /// Credits router -> node and node -> router, per external link.
    inject_credits: Vec<LinkQueue<Credit>>,
    eject_credits: Vec<LinkQueue<Credit>>,
    /// Flit and reverse credit channels per internal link.
    int_flits: Vec<LinkQueue<Flit>>,
    int_credits: Vec<LinkQueue<Credit>>,
    inport_of_link: HashMap<LinkId, (usize, usize)>,
    outport_of_link: HashMap<LinkId, (usize, usize)>,
    stats: StatsRecorder,
    monitor: DeadlockMonitor,
    received: Vec<Packet>,
    cycle: Cycle,
}

impl Network {
    pub fn new(config: &NetworkConfig) -> Result<Self, Error> {
        // Also validates the configuration.
        let topo = Topology::build(config)?;
        let scheme = VcScheme::from_config(config)?;
        let depths = (0..config.num_vnets())
            .map(|v| config.vc_depth(v))
            .collect::<Vec<_>>();

        let routers = (0..topo.num_routers())
            .map(|id| Router::new(id, &topo, config, scheme))
            .collect::<Result<Vec<_>, _>>()?;
        let interfaces = (0..topo.num_nodes())
            .map(|_| NetworkInterface::new(scheme, config.num_vnets(), &depths))
            .collect::<Vec<_>>();

        let mut inport_of_link = HashMap::new();
        let mut outport_of_link = HashMap::new();
        for router in 0..topo.num_routers() {
            for (index, port) in topo.router_inports(router).iter().enumerate() {
                inport_of_link.insert(port.link, (router, index));
            }
            for (index, port) in topo.router_outports(router).iter().enumerate() {
                outport_of_link.insert(port.link, (router, index));
            }
        }

        let ext = topo.ext_links().len();
        fn ext_queue<T>(topo: &Topology, ext: usize) -> Vec<LinkQueue<T>> {
            (0..ext)
                .map(|link| LinkQueue::new(topo.link_latency(link)))
                .collect::<Vec<LinkQueue<T>>>()
        }
        fn int_queue<T>(topo: &Topology) -> Vec<LinkQueue<T>> {
            topo.int_links()
                .iter()
                .map(|l| LinkQueue::new(l.latency))
                .collect::<Vec<LinkQueue<T>>>()
        }

        if config.enable_fault_model {
            let mut model = UniformFaultModel::new(FAULT_RATE_PER_BUFFER);
            for router in &routers {
                model.declare_router(
                    router.id(),
                    router.num_inports(),
                    config.num_vcs(),
                    config.buffers_per_data_vc,
                );
            }
            for router in &routers {
                info!(
                    "router {} aggregate fault probability {:.6}",
                    router.id(),
                    model.fault_probability(router.id())
                );
            }
        }

        Ok(Self {
            stats: StatsRecorder::new(config.num_vnets(), topo.num_nodes()),
            monitor: DeadlockMonitor::new(config.deadlock_threshold),
            inject_flits: ext_queue(&topo, ext),
            eject_flits: ext_queue(&topo, ext),
            inject_credits: ext_queue(&topo, ext),
            eject_credits: ext_queue(&topo, ext),
            int_flits: int_queue(&topo),
            int_credits: int_queue(&topo),
            inport_of_link,
            outport_of_link,
            config: config.clone(),
            scheme,
            routers,
            interfaces,
            topo,
            received: Vec::new(),
            cycle: 0,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Packets fully reassembled at their destinations since the last
    /// call.
    pub fn take_received(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.received)
    }

    /// Flits sitting in source queues, not yet on the wire.
    pub fn queued_flits(&self) -> usize {
        self.interfaces.iter().map(|ni| ni.queued_flits()).sum()
    }

    /// Queue a packet at its source node.
    pub fn inject(&mut self, packet: Packet) {
        let dest_router = self.topo.router_of_node(packet.dest);
        let flits = packet.flitisize(self.config.ni_flit_size, dest_router);
        debug!(
            "inject packet {} {} -> {} ({} flits)",
            packet.id,
            packet.src,
            packet.dest,
            flits.len()
        );
        self.stats.packet_injected(packet.vnet, flits.len());
        self.interfaces[packet.src].enqueue(packet.vnet, flits);
    }

    /// Advance the network by one cycle.
    pub fn step(&mut self) -> Result<(), Error> {
        let now = self.cycle;

        // Link arrivals.
        let ext = self.topo.ext_links().len();
        for link in 0..self.int_flits.len() {
            if let Some(flit) = self.int_flits[link].pop_ready(now) {
                let (router, inport) = self.inport_of_link[&(ext + link)];
                self.routers[router].flit_arrived(inport, flit, now);
            }
            if let Some(credit) = self.int_credits[link].pop_ready(now) {
                let (router, outport) = self.outport_of_link[&(ext + link)];
                self.routers[router].credit_arrived(outport, credit);
            }
        }
        for link in 0..ext {
            if let Some(flit) = self.inject_flits[link].pop_ready(now) {
                let (router, inport) = self.inport_of_link[&link];
                self.routers[router].flit_arrived(inport, flit, now);
            }
            if let Some(credit) = self.inject_credits[link].pop_ready(now) {
                self.interfaces[self.topo.ext_links()[link].node].credit_arrived(credit);
            }
            if let Some(credit) = self.eject_credits[link].pop_ready(now) {
                let (router, outport) = self.outport_of_link[&link];
                self.routers[router].credit_arrived(outport, credit);
            }
        }

        // Ejection: credits return immediately, tails complete packets.
        for link in 0..ext {
            if let Some(flit) = self.eject_flits[link].pop_ready(now) {
                let node = self.topo.ext_links()[link].node;
                let vnet = flit.vnet;
                self.stats.flit_received(
                    vnet,
                    flit.inject_cycle - flit.enqueue_cycle,
                    now - flit.inject_cycle,
                    flit.route.hops,
                    flit.route.dr,
                    flit.route.misroutes,
                );
                let is_tail = flit.kind.is_tail();
                let (credit, packet) = self.interfaces[node].receive_flit(flit);
                self.eject_credits[link].push(credit, now);
                if is_tail {
                    self.stats.packet_received(vnet);
                }
                if let Some(packet) = packet {
                    debug!("packet {} delivered to node {}", packet.id, node);
                    self.received.push(packet);
                }
            }
        }

        // Injection.
        for link in 0..ext {
            let node = self.topo.ext_links()[link].node;
            if let Some(flit) = self.interfaces[node].inject_flit(now) {
                self.inject_flits[link].push(flit, now);
            }
        }

        // Switch allocation.
        for router in &mut self.routers {
            router.allocate_switch(now)?;
        }

        // Drain granted flits and credits onto their links.
        for id in 0..self.routers.len() {
            for outport in 0..self.routers[id].num_outports() {
                let link = self.routers[id].outport(outport).link();
                let local = self.routers[id].outport(outport).dirn() == PortDirection::Local;
                if let Some(flit) = self.routers[id].outport_mut(outport).take_staged() {
                    if local {
                        self.eject_flits[link].push(flit, now);
                    } else {
                        self.int_flits[link - ext].push(flit, now);
                    }
                }
            }
            for inport in 0..self.routers[id].num_inports() {
                let link = self.routers[id].inport(inport).link();
                let local = self.routers[id].inport(inport).dirn() == PortDirection::Local;
                for credit in self.routers[id].take_credits(inport) {
                    if local {
                        self.inject_credits[link].push(credit, now);
                    } else {
                        self.int_credits[link - ext].push(credit, now);
                    }
                }
            }
        }

        // Stall accounting.
        for router in &self.routers {
            self.monitor
                .observe(router.id(), &router.occupied_vcs(), router.forwarded())?;
        }

        self.cycle += 1;
        Ok(())
    }

    /// Drive `cycles` cycles of open-loop traffic.
    pub fn run(&mut self, traffic: &mut TrafficGenerator, cycles: Cycle) -> Result<(), Error> {
        for _ in 0..cycles {
            for node in 0..self.topo.num_nodes() {
                if let Some(packet) = traffic.generate(node, self.cycle) {
                    self.inject(packet);
                }
            }
            self.step()?;
        }
        Ok(())
    }

    /// Run until the in-flight flits of earlier injections drained, up
    /// to `limit` cycles.
    pub fn drain(&mut self, limit: Cycle) -> Result<bool, Error> {
        for _ in 0..limit {
            if self.queued_flits() == 0 && self.stats.packets_received() >= self.stats.packets_injected()
            {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(false)
    }

    /// Fold the current counters into a trace record.
    pub fn record(&self, injection_rate: f64, sample_cycles: Cycle) -> crate::stats::Record {
        self.stats.record(injection_rate, sample_cycles)
    }

    /// Escape-VC scheme in effect, for diagnostics.
    pub fn vc_scheme(&self) -> VcScheme {
        self.scheme
    }
}

#[cfg(test)]
mod network_tests {
    use super::*;
    use crate::TrafficConfig;

    fn ring_config() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.topology = "Ring".to_string();
        config.num_cpus = 4;
        config.routing_algorithm = 0;
        config
    }

    fn torus_config(routing_algorithm: u32) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_ary = 4;
        config.num_dim = 2;
        config.num_cpus = 16;
        config.routing_algorithm = routing_algorithm;
        config.vcs_per_vnet = 4;
        config.vcs_adaptive = 2;
        config.dr_lim = 2;
        config.misrouting_lim = 2;
        config
    }

    #[test]
    fn delivers_a_packet_across_the_ring() {
        let _logger = env_logger::builder().try_init();
        let config = ring_config();
        let mut network = Network::new(&config).unwrap();
        network.inject(Packet::new(1, 0, 1, 2, 16, 0));
        for _ in 0..50 {
            network.step().unwrap();
        }
        let received = network.take_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, 1);
        assert_eq!(received[0].src, 0);
        assert_eq!(received[0].dest, 1);
        assert_eq!(network.stats().packets_received(), 1);
    }

    #[test]
    fn multi_flit_packets_arrive_whole() {
        let config = ring_config();
        let mut network = Network::new(&config).unwrap();
        // 72 bytes: 5 flits through 4-deep data VCs.
        network.inject(Packet::new(9, 2, 0, 2, 72, 0));
        for _ in 0..100 {
            network.step().unwrap();
        }
        let received = network.take_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, 9);
        // Reassembly pads up to whole flits.
        assert_eq!(received[0].size, 80);
    }

    #[test]
    fn deterministic_torus_delivers_all_pairs() {
        let config = torus_config(2);
        let mut network = Network::new(&config).unwrap();
        let mut id = 0;
        for src in 0..16 {
            for dest in 0..16 {
                if src == dest {
                    continue;
                }
                network.inject(Packet::new(id, src, dest, 2, 16, 0));
                id += 1;
            }
        }
        assert!(network.drain(5000).unwrap());
        let received = network.take_received();
        assert_eq!(received.len(), 240);
        // Minimal routing on a unidirectional path never beats the
        // per-dimension distances; deterministic always goes lower.
        assert_eq!(network.stats().packets_received(), 240);
    }

    #[test]
    fn adaptive_traffic_stays_within_limits() {
        let config = torus_config(3);
        let traffic = TrafficConfig {
            pattern: "uniform_random".to_string(),
            injection_rate: 0.05,
            vnet: 2,
            packet_size: 16,
        };
        let mut network = Network::new(&config).unwrap();
        let mut generator = TrafficGenerator::new(&traffic, &config).unwrap();
        // Limit violations and deadlocks surface as step errors.
        network.run(&mut generator, 500).unwrap();
        assert!(network.stats().packets_received() > 0);
        let record = network.record(0.05, 500);
        assert!(!record.is_skip());
        assert!(record.avg_dimension_reversals <= config.dr_lim as f64);
        assert!(record.reception_rate > 0.0);
    }

    #[test]
    fn injection_backpressure_queues_at_the_source() {
        let config = ring_config();
        let mut network = Network::new(&config).unwrap();
        for id in 0..20 {
            network.inject(Packet::new(id, 0, 2, 2, 16, 0));
        }
        assert!(network.queued_flits() > 0);
        assert!(network.drain(5000).unwrap());
        assert_eq!(network.queued_flits(), 0);
        assert_eq!(network.take_received().len(), 20);
    }
}
