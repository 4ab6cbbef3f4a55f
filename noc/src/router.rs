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

//! The router pipeline: buffered input VCs, credit-tracked output VCs,
//! and a two-stage separable switch allocator.
//!
//! Per cycle, SA-I lets every input port nominate one ready VC (round
//! robin) and SA-II lets every output port grant one nominee (round
//! robin). A granted head flit gets its output VC allocated on the
//! spot; reversal and misroute accounting also happens at the grant,
//! since only then is the hop committed.

use log::debug;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::mem;

use crate::flit::{Credit, Flit};
use crate::routing::{RoutingAlgorithm, RoutingUnit};
use crate::topology::{LinkId, PortDirection, Topology};
use crate::vc::{OutVcState, VcScheme, VcState, WaitingQueue};
use crate::Cycle;
use crate::Error;
use crate::NetworkConfig;

/// One buffered VC of an input port.
#[derive(Clone, Debug)]
struct InputVc {
    buffer: VecDeque<Flit>,
    state: VcState,
    /// Outport granted by route compute (sticky for the whole packet).
    outport: Option<usize>,
    /// Downstream VC allocated at the first grant.
    outvc: Option<usize>,
    /// VC class the next hop allocates from.
    class: usize,
    /// Parked in a downstream waiting queue; sits out allocation until
    /// the reservation is granted.
    waiting: bool,
    /// Enqueue time of the resident packet, for ordered-vnet checks.
    enqueue_cycle: Cycle,
}

impl InputVc {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            state: VcState::Idle,
            outport: None,
            outvc: None,
            class: 0,
            waiting: false,
            enqueue_cycle: 0,
        }
    }

    /// Ready to compete in switch allocation at `now`.
    fn sa_ready(&self, now: Cycle) -> bool {
        !self.waiting
            && self.state == VcState::Active
            && self.buffer.front().map_or(false, |f| f.sa_ready <= now)
    }
}

/// One input port: a VC-indexed set of flit buffers.
pub struct InputUnit {
    link: LinkId,
    dirn: PortDirection,
    vcs: Vec<InputVc>,
}

impl InputUnit {
    fn new(link: LinkId, dirn: PortDirection, num_vcs: usize) -> Self {
        Self {
            link,
            dirn,
            vcs: (0..num_vcs).map(|_| InputVc::new()).collect(),
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn dirn(&self) -> PortDirection {
        self.dirn
    }

    fn receive(&mut self, flit: Flit) {
        let vc = &mut self.vcs[flit.vc];
        if flit.kind.is_head() {
            assert_eq!(vc.state, VcState::Idle, "head flit into an active VC");
            vc.state = VcState::Active;
            vc.outport = None;
            vc.outvc = None;
            vc.class = 0;
            vc.waiting = false;
            vc.enqueue_cycle = flit.enqueue_cycle;
        } else {
            assert_eq!(vc.state, VcState::Active, "body flit into an idle VC");
        }
        vc.buffer.push_back(flit);
    }
}

/// One output port: the credit mirror of the downstream input port,
/// waiting-queue reservations, and the flit staged for link traversal.
pub struct OutputUnit {
    link: LinkId,
    dirn: PortDirection,
    scheme: VcScheme,
    vcs: Vec<OutVcState>,
    waiting: Vec<WaitingQueue>,
    staged: VecDeque<Flit>,
}

impl OutputUnit {
    pub fn new(
        link: LinkId,
        dirn: PortDirection,
        scheme: VcScheme,
        num_vnets: usize,
        depths: &[usize],
    ) -> Self {
        assert_eq!(depths.len(), num_vnets);
        let num_vcs = num_vnets * scheme.vcs_per_vnet;
        let vcs = (0..num_vcs)
            .map(|vc| OutVcState::new(depths[vc / scheme.vcs_per_vnet]))
            .collect();
        Self {
            link,
            dirn,
            scheme,
            vcs,
            waiting: vec![WaitingQueue::default(); num_vcs],
            staged: VecDeque::new(),
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn dirn(&self) -> PortDirection {
        self.dirn
    }

    /// Absolute VC indices the class may allocate from.
    fn class_vcs(&self, vnet: usize, class: usize) -> std::ops::Range<usize> {
        let base = vnet * self.scheme.vcs_per_vnet;
        let range = self.scheme.class_range(class);
        base + range.start..base + range.end
    }

    fn is_free(&self, vc: usize) -> bool {
        self.vcs[vc].is_idle() && self.waiting[vc].is_empty()
    }

    pub fn has_free_vc(&self, vnet: usize, class: usize) -> bool {
        self.class_vcs(vnet, class).any(|vc| self.is_free(vc))
    }

    pub fn free_vc_count(&self, vnet: usize, class: usize) -> usize {
        self.class_vcs(vnet, class)
            .filter(|vc| self.is_free(*vc))
            .count()
    }

    /// Allocate the free VC with the fewest occupied downstream slots.
    fn select_free_vc(&mut self, vnet: usize, class: usize) -> Option<usize> {
        let vc = self
            .class_vcs(vnet, class)
            .filter(|vc| self.is_free(*vc))
            .min_by_key(|vc| self.vcs[*vc].occupancy())?;
        self.vcs[vc].set_state(VcState::Active);
        Some(vc)
    }

    /// A reservation slot is legal on an empty queue or behind a head
    /// with strictly more reversals.
    fn wait_legal(&self, vc: usize, dr: u32) -> bool {
        self.waiting[vc].is_empty() || self.waiting[vc].dr() > dr
    }

    pub fn has_legal_wait(&self, vnet: usize, class: usize, dr: u32) -> bool {
        self.class_vcs(vnet, class).any(|vc| self.wait_legal(vc, dr))
    }

    /// Park a reservation on the legal VC with the shortest queue.
    fn enqueue_wait(&mut self, vnet: usize, class: usize, inport: usize, invc: usize, dr: u32) {
        let vc = self
            .class_vcs(vnet, class)
            .filter(|vc| self.wait_legal(*vc, dr))
            .min_by_key(|vc| self.waiting[*vc].len())
            .expect("waiting was checked legal at route compute");
        self.waiting[vc].enqueue(inport, invc, dr);
    }

    fn has_credit(&self, vc: usize) -> bool {
        assert!(!self.vcs[vc].is_idle());
        self.vcs[vc].has_credit()
    }

    /// Apply an upstream-bound credit. A free signal idles the VC; if
    /// reservations are queued, the head is granted the VC directly and
    /// the grant `(inport, invc, vc)` is returned for the input side.
    pub fn credit_arrived(&mut self, credit: Credit) -> Option<(usize, usize, usize)> {
        self.vcs[credit.vc].increment_credit();
        if credit.is_free_signal {
            self.vcs[credit.vc].set_state(VcState::Idle);
            if let Some((inport, invc)) = self.waiting[credit.vc].dequeue() {
                self.vcs[credit.vc].set_state(VcState::Active);
                return Some((inport, invc, credit.vc));
            }
        }
        None
    }

    fn stage(&mut self, flit: Flit) {
        self.staged.push_back(flit);
    }

    /// Flit committed to the link this cycle, if any.
    pub fn take_staged(&mut self) -> Option<Flit> {
        self.staged.pop_front()
    }

    #[cfg(test)]
    pub fn occupy_all(&mut self, vnet: usize) {
        let base = vnet * self.scheme.vcs_per_vnet;
        for vc in base..base + self.scheme.vcs_per_vnet {
            self.vcs[vc].set_state(VcState::Active);
        }
    }

    #[cfg(test)]
    pub fn occupy_one(&mut self, vnet: usize) {
        self.vcs[vnet * self.scheme.vcs_per_vnet].set_state(VcState::Active);
    }

    #[cfg(test)]
    pub fn block_waits(&mut self, vnet: usize, dr: u32) {
        let base = vnet * self.scheme.vcs_per_vnet;
        for vc in base..base + self.scheme.vcs_per_vnet {
            self.waiting[vc].enqueue(0, 0, dr);
        }
    }
}

pub struct Router {
    id: usize,
    inports: Vec<InputUnit>,
    outports: Vec<OutputUnit>,
    routing: RoutingUnit,
    algorithm: RoutingAlgorithm,
    ordered: Vec<bool>,
    vcs_per_vnet: usize,
    num_vcs: usize,
    dr_lim: u32,
    misrouting_lim: u32,
    router_latency: Cycle,
    ary: usize,
    rng: Xoshiro256StarStar,
    /// SA-I round-robin pointer per input port.
    rr_invc: Vec<usize>,
    /// SA-II round-robin pointer per output port.
    rr_inport: Vec<usize>,
    /// Credits owed upstream, per input port; drained by the network.
    credits_out: Vec<Vec<Credit>>,
    /// `(inport, invc)` pairs granted switch traversal this cycle.
    forwarded: Vec<(usize, usize)>,
}

impl Router {
    pub fn new(
        id: usize,
        topo: &Topology,
        config: &NetworkConfig,
        scheme: VcScheme,
    ) -> Result<Self, Error> {
        let num_vcs = config.num_vcs();
        let depths = (0..config.num_vnets())
            .map(|v| config.vc_depth(v))
            .collect::<Vec<_>>();
        let inports = topo
            .router_inports(id)
            .iter()
            .map(|port| InputUnit::new(port.link, port.dirn, num_vcs))
            .collect::<Vec<_>>();
        let outports = topo
            .router_outports(id)
            .iter()
            .map(|port| {
                OutputUnit::new(port.link, port.dirn, scheme, config.num_vnets(), &depths)
            })
            .collect::<Vec<_>>();
        let routing = RoutingUnit::new(id, topo, config, scheme)?;
        let (ary, _) = topo.radix_dims();
        Ok(Self {
            id,
            rr_invc: vec![0; inports.len()],
            rr_inport: vec![0; outports.len()],
            credits_out: vec![Vec::new(); inports.len()],
            inports,
            outports,
            routing,
            algorithm: RoutingAlgorithm::try_from(config.routing_algorithm)?,
            ordered: config.vnets.iter().map(|v| v.ordered).collect(),
            vcs_per_vnet: config.vcs_per_vnet,
            num_vcs,
            dr_lim: config.dr_lim,
            misrouting_lim: config.misrouting_lim,
            router_latency: config.router_latency,
            ary,
            rng: Xoshiro256StarStar::seed_from_u64(config.seed.wrapping_add(id as u64)),
            forwarded: Vec::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_inports(&self) -> usize {
        self.inports.len()
    }

    pub fn num_outports(&self) -> usize {
        self.outports.len()
    }

    pub fn inport(&self, index: usize) -> &InputUnit {
        &self.inports[index]
    }

    pub fn outport(&self, index: usize) -> &OutputUnit {
        &self.outports[index]
    }

    pub fn outport_mut(&mut self, index: usize) -> &mut OutputUnit {
        &mut self.outports[index]
    }

    /// A flit landed on `inport`; it becomes eligible for allocation
    /// after the router latency.
    pub fn flit_arrived(&mut self, inport: usize, mut flit: Flit, now: Cycle) {
        flit.sa_ready = now + self.router_latency;
        debug!(
            "router {} inport {} vc {} received flit {}.{}",
            self.id, inport, flit.vc, flit.packet, flit.index
        );
        self.inports[inport].receive(flit);
    }

    /// A credit came back on `outport`'s credit path. Waiting-queue
    /// grants are applied to the parked input VC immediately.
    pub fn credit_arrived(&mut self, outport: usize, credit: Credit) {
        if let Some((inport, invc, outvc)) = self.outports[outport].credit_arrived(credit) {
            let vc = &mut self.inports[inport].vcs[invc];
            assert!(vc.waiting, "waiting grant for a VC that never parked");
            vc.outvc = Some(outvc);
            vc.waiting = false;
            debug!(
                "router {} granted waiting inport {} vc {} outvc {}",
                self.id, inport, invc, outvc
            );
        }
    }

    /// Run both allocation stages for this cycle.
    pub fn allocate_switch(&mut self, now: Cycle) -> Result<(), Error> {
        self.forwarded.clear();
        let requests = self.arbitrate_inports(now)?;
        self.arbitrate_outports(&requests)
    }

    /// SA-I: per input port, nominate one SA-ready VC whose flit could
    /// actually be sent, starting at the round-robin pointer.
    fn arbitrate_inports(&mut self, now: Cycle) -> Result<Vec<Option<(usize, usize)>>, Error> {
        let mut requests: Vec<Option<(usize, usize)>> = vec![None; self.inports.len()];
        // (vnet, class, inport, invc, dr) reservations to park after
        // the scan, once the output borrows are released.
        let mut parks: Vec<(usize, usize, usize, usize, u32)> = Vec::new();
        for inport in 0..self.inports.len() {
            let mut invc = self.rr_invc[inport];
            for _ in 0..self.num_vcs {
                match self.consider(inport, invc, now, &mut parks)? {
                    Some(outport) => {
                        requests[inport] = Some((outport, invc));
                        break;
                    }
                    None => {
                        invc += 1;
                        if invc >= self.num_vcs {
                            invc = 0;
                        }
                    }
                }
            }
        }
        for (vnet, class, inport, invc, dr) in parks {
            let outport = self.inports[inport].vcs[invc].outport.unwrap();
            self.outports[outport].enqueue_wait(vnet, class, inport, invc, dr);
        }
        Ok(requests)
    }

    /// Whether `(inport, invc)` may request its outport this cycle;
    /// computes the route for head flits that need one.
    fn consider(
        &mut self,
        inport: usize,
        invc: usize,
        now: Cycle,
        parks: &mut Vec<(usize, usize, usize, usize, u32)>,
    ) -> Result<Option<usize>, Error> {
        if !self.inports[inport].vcs[invc].sa_ready(now) {
            return Ok(None);
        }
        let vnet = invc / self.vcs_per_vnet;
        let (is_head, dest, dest_router, dr, misroutes) = {
            let flit = self.inports[inport].vcs[invc].buffer.front().unwrap();
            (
                flit.kind.is_head(),
                flit.route.dest,
                flit.route.dest_router,
                flit.route.dr,
                flit.route.misroutes,
            )
        };

        // Adaptive head flits re-resolve their route every cycle until
        // granted; congestion moved since the last attempt.
        if is_head && self.inports[inport].vcs[invc].outvc.is_none() {
            let decision = self.routing.compute(
                dest,
                dest_router,
                self.inports[inport].dirn,
                invc % self.vcs_per_vnet,
                vnet,
                dr,
                misroutes,
                &self.outports,
                &mut self.rng,
            )?;
            let vc = &mut self.inports[inport].vcs[invc];
            vc.outport = Some(decision.outport);
            vc.class = decision.class;
            if decision.wait {
                vc.waiting = true;
                parks.push((vnet, decision.class, inport, invc, dr));
                return Ok(None);
            }
        }

        let vc = &self.inports[inport].vcs[invc];
        let outport = vc.outport.expect("SA-ready VC without a route");
        let allowed = match vc.outvc {
            Some(outvc) => self.outports[outport].has_credit(outvc),
            None => self.outports[outport].has_free_vc(vnet, vc.class),
        };
        if !allowed {
            return Ok(None);
        }

        // Ordered vnets: an earlier-enqueued packet at this inport
        // wanting the same outport goes first.
        if self.ordered[vnet] {
            let enqueue_cycle = vc.enqueue_cycle;
            let base = vnet * self.vcs_per_vnet;
            for other in base..base + self.vcs_per_vnet {
                if other == invc {
                    continue;
                }
                let sibling = &self.inports[inport].vcs[other];
                if sibling.sa_ready(now)
                    && sibling.outport == Some(outport)
                    && sibling.enqueue_cycle < enqueue_cycle
                {
                    return Ok(None);
                }
            }
        }
        Ok(Some(outport))
    }

    /// SA-II: per output port, grant one requesting input port.
    fn arbitrate_outports(&mut self, requests: &[Option<(usize, usize)>]) -> Result<(), Error> {
        for outport in 0..self.outports.len() {
            let mut inport = self.rr_inport[outport];
            for _ in 0..self.inports.len() {
                if requests[inport].map(|(port, _)| port) != Some(outport)
                    || self.forwarded.iter().any(|(p, _)| *p == inport)
                {
                    inport += 1;
                    if inport >= self.inports.len() {
                        inport = 0;
                    }
                    continue;
                }
                let (_, invc) = requests[inport].unwrap();
                self.grant(inport, invc, outport)?;
                self.rr_inport[outport] = (inport + 1) % self.inports.len();
                self.rr_invc[inport] = (invc + 1) % self.num_vcs;
                break;
            }
        }
        Ok(())
    }

    /// Move the winning flit to the output, with VC allocation, credit
    /// and reversal/misroute accounting.
    fn grant(&mut self, inport: usize, invc: usize, outport: usize) -> Result<(), Error> {
        let vnet = invc / self.vcs_per_vnet;
        let outvc = match self.inports[inport].vcs[invc].outvc {
            Some(vc) => vc,
            None => {
                let class = self.inports[inport].vcs[invc].class;
                let vc = self.outports[outport]
                    .select_free_vc(vnet, class)
                    .expect("SA-I verified a free VC");
                self.inports[inport].vcs[invc].outvc = Some(vc);
                vc
            }
        };

        let in_dirn = self.inports[inport].dirn;
        let out_dirn = self.outports[outport].dirn;
        let mut flit = self.inports[inport].vcs[invc].buffer.pop_front().unwrap();
        flit.vc = outvc;
        if out_dirn != PortDirection::Local {
            flit.route.hops += 1;
        }
        if is_dimension_reversal(in_dirn, out_dirn) {
            flit.route.dr += 1;
            if self.algorithm == RoutingAlgorithm::StaticAdaptive && flit.route.dr > self.dr_lim {
                return Err(Error::ReversalLimit {
                    router: self.id,
                    count: flit.route.dr,
                    limit: self.dr_lim,
                });
            }
        }
        if self.is_misrouting(in_dirn, out_dirn, flit.route.dest_router) {
            flit.route.misroutes += 1;
            if self.algorithm == RoutingAlgorithm::DynamicAdaptive
                && flit.route.misroutes > self.misrouting_lim
            {
                return Err(Error::MisroutingLimit {
                    router: self.id,
                    count: flit.route.misroutes,
                    limit: self.misrouting_lim,
                });
            }
        }
        let is_tail = flit.kind.is_tail();
        debug!(
            "router {} granted {} -> {} flit {}.{} outvc {}",
            self.id, in_dirn, out_dirn, flit.packet, flit.index, outvc
        );
        self.outports[outport].vcs[outvc].decrement_credit();
        self.outports[outport].stage(flit);
        self.credits_out[inport].push(Credit {
            vc: invc,
            is_free_signal: is_tail,
        });
        if is_tail {
            let vc = &mut self.inports[inport].vcs[invc];
            assert!(vc.buffer.is_empty(), "flits behind a tail in one VC");
            vc.state = VcState::Idle;
            vc.outport = None;
            vc.outvc = None;
        }
        self.forwarded.push((inport, invc));
        Ok(())
    }

    /// Hop that turns back to a lower dimension; both ports internal.
    fn is_misrouting(&self, in_dirn: PortDirection, out_dirn: PortDirection, dest: usize) -> bool {
        let out_dim = match (in_dirn.dim(), out_dirn.dim()) {
            (Some(_), Some(out)) => out,
            _ => return false,
        };
        crate::topology::coordinate(self.id, out_dim, self.ary)
            == crate::topology::coordinate(dest, out_dim, self.ary)
    }

    /// Credits owed upstream on `inport`'s link, accumulated since the
    /// last drain.
    pub fn take_credits(&mut self, inport: usize) -> Vec<Credit> {
        mem::take(&mut self.credits_out[inport])
    }

    /// `(inport, invc)` pairs holding flits right now; the deadlock
    /// monitor diffs this against `forwarded()`.
    pub fn occupied_vcs(&self) -> Vec<(usize, usize)> {
        let mut occupied = Vec::new();
        for (inport, unit) in self.inports.iter().enumerate() {
            for (invc, vc) in unit.vcs.iter().enumerate() {
                if !vc.buffer.is_empty() {
                    occupied.push((inport, invc));
                }
            }
        }
        occupied
    }

    pub fn forwarded(&self) -> &[(usize, usize)] {
        &self.forwarded
    }
}

/// A grant from a higher to a lower dimension, both ports internal.
fn is_dimension_reversal(in_dirn: PortDirection, out_dirn: PortDirection) -> bool {
    match (in_dirn.dim(), out_dirn.dim()) {
        (Some(in_dim), Some(out_dim)) => in_dim > out_dim,
        _ => false,
    }
}
