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

//! Per-router route computation.
//!
//! Every algorithm answers the same question: given a head flit's
//! destination and the state of this router's output ports, which
//! outport does the flit leave through and which VC class may it
//! allocate from. The adaptive algorithms consult live congestion
//! (free VC counts, waiting queues) and must be re-evaluated every
//! cycle until the flit wins allocation; the others are pure functions
//! of the coordinates.

use petgraph::algo::dijkstra;
use petgraph::graph::{Graph, NodeIndex};
use rand::Rng;
use std::collections::HashMap;
use std::convert::TryFrom;

use crate::router::OutputUnit;
use crate::topology::{coordinate, Peer, PortDirection, Topology};
use crate::vc::VcScheme;
use crate::Error;
use crate::NetworkConfig;

/// Routing algorithm selectors, in the numeric order of the
/// configuration surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoutingAlgorithm {
    /// Table lookup over minimal-weight paths (the only algorithm that
    /// works on every shape).
    WeightTable,
    /// Dimension 0 fully, then dimension 1; bidirectional 2-cubes only.
    Xy,
    /// Dimension order over lower ports with a dateline VC pair.
    Deterministic,
    /// Minimal-adaptive with at most `dr_lim` dimension reversals.
    StaticAdaptive,
    /// Congestion-picked minimal-adaptive with waiting-queue
    /// reservations and at most `misrouting_lim` non-minimal hops.
    DynamicAdaptive,
}

impl TryFrom<u32> for RoutingAlgorithm {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self, Error> {
        match id {
            0 => Ok(Self::WeightTable),
            1 => Ok(Self::Xy),
            2 => Ok(Self::Deterministic),
            3 => Ok(Self::StaticAdaptive),
            4 => Ok(Self::DynamicAdaptive),
            other => Err(Error::InvalidRoutingAlgorithm(other)),
        }
    }
}

/// How dynamic adaptive routing breaks ties among candidate outports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PickAlgorithm {
    Random,
    /// Most free VCs in the candidate class wins; random lottery on ties.
    MinCongestion,
    /// Prefer the dimension nearest the one currently traveled.
    StraightLines,
}

impl TryFrom<u32> for PickAlgorithm {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self, Error> {
        match id {
            0 => Ok(Self::Random),
            1 => Ok(Self::MinCongestion),
            2 => Ok(Self::StraightLines),
            other => Err(Error::InvalidPickAlgorithm(other)),
        }
    }
}

/// Outcome of a route computation for one head flit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RouteDecision {
    /// Index into the router's outports.
    pub outport: usize,
    /// VC class the next hop allocates from.
    pub class: usize,
    /// Park in the outport's waiting queue instead of competing for a
    /// free VC (dynamic adaptive only).
    pub wait: bool,
}

/// One minimal (or misrouting) hop option under consideration.
#[derive(Copy, Clone, Debug)]
struct Candidate {
    dim: usize,
    outport: usize,
    class: usize,
}

/// Route computation state for one router.
pub struct RoutingUnit {
    router: usize,
    algorithm: RoutingAlgorithm,
    pick: PickAlgorithm,
    dr_lim: u32,
    misrouting_lim: u32,
    ary: usize,
    dim: usize,
    bidirectional: bool,
    scheme: VcScheme,
    ordered: Vec<bool>,
    /// Outport index per port direction (internal ports only).
    dir_outport: HashMap<PortDirection, usize>,
    /// (node, outport) pairs for the attached endpoints.
    local_outports: Vec<(usize, usize)>,
    /// Minimal-weight outport candidates per destination router, with
    /// the weight of the candidate link. Built for weight-table routing.
    table: Vec<Vec<(usize, u64)>>,
}

impl RoutingUnit {
    pub fn new(
        router: usize,
        topo: &Topology,
        config: &NetworkConfig,
        scheme: VcScheme,
    ) -> Result<Self, Error> {
        let (ary, dim) = topo.radix_dims();
        let outports = topo.router_outports(router);
        let mut dir_outport = HashMap::new();
        let mut local_outports = Vec::new();
        for (index, port) in outports.iter().enumerate() {
            match port.peer {
                Peer::Node(node) => local_outports.push((node, index)),
                Peer::Router(_) => {
                    dir_outport.insert(port.dirn, index);
                }
            }
        }
        let algorithm = RoutingAlgorithm::try_from(config.routing_algorithm)?;
        let table = if algorithm == RoutingAlgorithm::WeightTable {
            build_table(router, topo)
        } else {
            Vec::new()
        };
        Ok(Self {
            router,
            algorithm,
            pick: PickAlgorithm::try_from(config.pick_algorithm)?,
            dr_lim: config.dr_lim,
            misrouting_lim: config.misrouting_lim,
            ary,
            dim,
            bidirectional: topo.is_bidirectional(),
            scheme,
            ordered: config.vnets.iter().map(|v| v.ordered).collect(),
            dir_outport,
            local_outports,
            table,
        })
    }

    pub fn algorithm(&self) -> RoutingAlgorithm {
        self.algorithm
    }

    /// Coordinate of this router along `d`.
    fn my_digit(&self, d: usize) -> usize {
        coordinate(self.router, d, self.ary)
    }

    fn outport(&self, dirn: PortDirection) -> usize {
        *self
            .dir_outport
            .get(&dirn)
            .unwrap_or_else(|| panic!("router {} has no {} port", self.router, dirn))
    }

    /// Pick the next hop for a head flit.
    ///
    /// `inport_dirn` is the direction the flit arrived from,
    /// `invc_in_vnet` its VC offset within the vnet, `dr`/`misroutes`
    /// the counters it carries. `outputs` is this router's output
    /// units, indexed like the decisions returned.
    #[allow(clippy::too_many_arguments)]
    pub fn compute<R: Rng>(
        &self,
        dest: usize,
        dest_router: usize,
        inport_dirn: PortDirection,
        invc_in_vnet: usize,
        vnet: usize,
        dr: u32,
        misroutes: u32,
        outputs: &[OutputUnit],
        rng: &mut R,
    ) -> Result<RouteDecision, Error> {
        if dest_router == self.router {
            let outport = self
                .local_outports
                .iter()
                .find(|(node, _)| *node == dest)
                .map(|(_, outport)| *outport)
                .ok_or(Error::NoRoute {
                    router: self.router,
                    dest,
                })?;
            return Ok(RouteDecision {
                outport,
                class: self.scheme.ejection_class(),
                wait: false,
            });
        }
        match self.algorithm {
            RoutingAlgorithm::WeightTable => self.lookup_table(dest, dest_router, vnet, rng),
            RoutingAlgorithm::Xy => self.compute_xy(dest_router),
            RoutingAlgorithm::Deterministic => self.compute_deterministic(dest_router, inport_dirn),
            RoutingAlgorithm::StaticAdaptive => Ok(self.compute_static_adaptive(
                dest_router,
                inport_dirn,
                invc_in_vnet,
                vnet,
                dr,
                outputs,
                rng,
            )),
            RoutingAlgorithm::DynamicAdaptive => Ok(self.compute_dynamic_adaptive(
                dest_router,
                inport_dirn,
                invc_in_vnet,
                vnet,
                dr,
                misroutes,
                outputs,
                rng,
            )),
        }
    }

    /// Minimal-weight table lookup: first candidate for an ordered
    /// vnet, a uniformly random one otherwise.
    fn lookup_table<R: Rng>(
        &self,
        dest: usize,
        dest_router: usize,
        vnet: usize,
        rng: &mut R,
    ) -> Result<RouteDecision, Error> {
        let candidates = &self.table[dest_router];
        if candidates.is_empty() {
            return Err(Error::NoRoute {
                router: self.router,
                dest,
            });
        }
        let min_weight = candidates.iter().map(|(_, w)| *w).min().unwrap();
        let minimal = candidates
            .iter()
            .filter(|(_, w)| *w == min_weight)
            .map(|(outport, _)| *outport)
            .collect::<Vec<_>>();
        let pick = if self.ordered[vnet] {
            0
        } else {
            rng.gen_range(0..minimal.len())
        };
        Ok(RouteDecision {
            outport: minimal[pick],
            class: 0,
            wait: false,
        })
    }

    /// Resolve dimension 0 completely, then dimension 1, taking the
    /// wrap-aware shorter way around each ring.
    fn compute_xy(&self, dest_router: usize) -> Result<RouteDecision, Error> {
        debug_assert_eq!(self.dim, 2);
        for d in 0..self.dim {
            let my = self.my_digit(d);
            let their = coordinate(dest_router, d, self.ary);
            if my == their {
                continue;
            }
            let up = (their + self.ary - my) % self.ary;
            let dirn = if up < self.ary - up {
                PortDirection::Upper(d)
            } else {
                PortDirection::Lower(d)
            };
            return Ok(RouteDecision {
                outport: self.outport(dirn),
                class: 0,
                wait: false,
            });
        }
        unreachable!("ejection is resolved before route compute");
    }

    /// First unresolved dimension at or above the inport's, always out
    /// the lower port; the dateline class keeps each ring acyclic.
    fn compute_deterministic(
        &self,
        dest_router: usize,
        inport_dirn: PortDirection,
    ) -> Result<RouteDecision, Error> {
        let start = inport_dirn.dim().unwrap_or(0);
        let out_dim = self.next_unresolved(dest_router, start);
        let class_dim = inport_dirn.dim().unwrap_or(out_dim);
        let class = self.dateline_half(dest_router, class_dim);
        Ok(RouteDecision {
            outport: self.outport(PortDirection::Lower(out_dim)),
            class,
            wait: false,
        })
    }

    fn compute_static_adaptive<R: Rng>(
        &self,
        dest_router: usize,
        inport_dirn: PortDirection,
        invc_in_vnet: usize,
        vnet: usize,
        dr: u32,
        outputs: &[OutputUnit],
        rng: &mut R,
    ) -> RouteDecision {
        let cur_dim = dim_of(inport_dirn);
        // A flit that fell onto an escape VC stays deterministic.
        if !self.scheme.is_escape_vc(invc_in_vnet) && dr < self.dr_lim {
            let mut candidates = Vec::new();
            for d in 0..self.dim {
                if self.my_digit(d) == coordinate(dest_router, d, self.ary) {
                    continue;
                }
                let reversing = (d as isize) < cur_dim;
                if reversing && dr + 1 >= self.dr_lim {
                    continue;
                }
                candidates.push(Candidate {
                    dim: d,
                    outport: self.minimal_outport(dest_router, d),
                    class: (dr + if reversing { 1 } else { 0 }) as usize,
                });
            }
            if !candidates.is_empty() {
                let free = candidates
                    .iter()
                    .filter(|c| outputs[c.outport].has_free_vc(vnet, c.class))
                    .copied()
                    .collect::<Vec<_>>();
                let choice = if !free.is_empty() {
                    free[self.pick_free(&free, vnet, cur_dim, outputs, rng)]
                } else {
                    // No free VC anywhere minimal: point at a minimal
                    // outport anyway and retry until one frees.
                    candidates[self.pick_wait(&candidates, cur_dim, rng)]
                };
                return RouteDecision {
                    outport: choice.outport,
                    class: choice.class,
                    wait: false,
                };
            }
        }
        self.escape(dest_router, inport_dirn)
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_dynamic_adaptive<R: Rng>(
        &self,
        dest_router: usize,
        inport_dirn: PortDirection,
        invc_in_vnet: usize,
        vnet: usize,
        dr: u32,
        misroutes: u32,
        outputs: &[OutputUnit],
        rng: &mut R,
    ) -> RouteDecision {
        let cur_dim = dim_of(inport_dirn);
        if self.scheme.is_escape_vc(invc_in_vnet) {
            return self.escape(dest_router, inport_dirn);
        }
        let mut free = Vec::new();
        let mut waitable = Vec::new();
        for d in 0..self.dim {
            if self.my_digit(d) == coordinate(dest_router, d, self.ary) {
                continue;
            }
            let reversing = (d as isize) < cur_dim;
            let candidate = Candidate {
                dim: d,
                outport: self.minimal_outport(dest_router, d),
                class: if reversing || dr > 0 { 1 } else { 0 },
            };
            if outputs[candidate.outport].has_free_vc(vnet, candidate.class) {
                free.push(candidate);
            } else if outputs[candidate.outport].has_legal_wait(vnet, candidate.class, dr) {
                waitable.push(candidate);
            }
        }
        if !free.is_empty() {
            let choice = free[self.pick_free(&free, vnet, cur_dim, outputs, rng)];
            return RouteDecision {
                outport: choice.outport,
                class: choice.class,
                wait: false,
            };
        }
        if !waitable.is_empty() {
            let choice = waitable[self.pick_wait(&waitable, cur_dim, rng)];
            return RouteDecision {
                outport: choice.outport,
                class: choice.class,
                wait: true,
            };
        }
        // Every minimal port is blocked: a non-minimal hop along an
        // already resolved dimension is allowed below the limit.
        if misroutes < self.misrouting_lim {
            let class = if dr > 0 { 1 } else { 0 };
            let mut detours = Vec::new();
            for d in 0..self.dim {
                if self.my_digit(d) != coordinate(dest_router, d, self.ary) {
                    continue;
                }
                let mut dirns = vec![PortDirection::Lower(d)];
                if self.bidirectional {
                    dirns.push(PortDirection::Upper(d));
                }
                for dirn in dirns {
                    let outport = self.outport(dirn);
                    if outputs[outport].has_free_vc(vnet, class) {
                        detours.push(Candidate {
                            dim: d,
                            outport,
                            class,
                        });
                    }
                }
            }
            if !detours.is_empty() {
                let choice = detours[self.pick_free(&detours, vnet, cur_dim, outputs, rng)];
                return RouteDecision {
                    outport: choice.outport,
                    class: choice.class,
                    wait: false,
                };
            }
        }
        self.escape(dest_router, inport_dirn)
    }

    /// Deterministic fallback onto the escape dateline pair.
    fn escape(&self, dest_router: usize, inport_dirn: PortDirection) -> RouteDecision {
        let start = inport_dirn.dim().unwrap_or(0);
        let out_dim = self.next_unresolved(dest_router, start);
        let class_dim = inport_dirn.dim().unwrap_or(out_dim);
        let half = self.dateline_half(dest_router, class_dim);
        RouteDecision {
            outport: self.outport(PortDirection::Lower(out_dim)),
            class: self.scheme.escape_class(half),
            wait: false,
        }
    }

    /// First dimension at or above `start` whose coordinate differs
    /// from the destination's. Purely dimension-ordered flits never
    /// have anything unresolved below `start`; adaptive flits escaping
    /// after a reversal can, so the scan wraps.
    fn next_unresolved(&self, dest_router: usize, start: usize) -> usize {
        for d in (start..self.dim).chain(0..start) {
            if self.my_digit(d) != coordinate(dest_router, d, self.ary) {
                return d;
            }
        }
        panic!(
            "router {} asked to route a flit it should eject (dest router {})",
            self.router, dest_router
        );
    }

    /// Dateline half along `d`: 0 before the wrap (or at the wrap
    /// point), 1 after.
    fn dateline_half(&self, dest_router: usize, d: usize) -> usize {
        let my = self.my_digit(d);
        let their = coordinate(dest_router, d, self.ary);
        if my > their || my == 0 {
            0
        } else {
            1
        }
    }

    /// Minimal-direction port along `d`: upper only for a short
    /// positive digit difference on a bidirectional torus.
    fn minimal_outport(&self, dest_router: usize, d: usize) -> usize {
        let diff = coordinate(dest_router, d, self.ary) as isize - self.my_digit(d) as isize;
        let dirn = if diff > 0 && (diff as usize) < self.ary / 2 && self.bidirectional {
            PortDirection::Upper(d)
        } else {
            PortDirection::Lower(d)
        };
        self.outport(dirn)
    }

    /// Index into `candidates` of the preferred free outport.
    fn pick_free<R: Rng>(
        &self,
        candidates: &[Candidate],
        vnet: usize,
        cur_dim: isize,
        outputs: &[OutputUnit],
        rng: &mut R,
    ) -> usize {
        debug_assert!(!candidates.is_empty());
        match self.pick {
            PickAlgorithm::Random => rng.gen_range(0..candidates.len()),
            PickAlgorithm::MinCongestion => {
                let best = candidates
                    .iter()
                    .map(|c| outputs[c.outport].free_vc_count(vnet, c.class))
                    .max()
                    .unwrap();
                let pool = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| outputs[c.outport].free_vc_count(vnet, c.class) == best)
                    .map(|(i, _)| i)
                    .collect::<Vec<_>>();
                pool[rng.gen_range(0..pool.len())]
            }
            PickAlgorithm::StraightLines => pick_straight(candidates, cur_dim, rng),
        }
    }

    /// Index into `candidates` of the outport to wait on. Minimum
    /// congestion has no meaningful signal here (nothing is free), so
    /// it degrades to a random pick.
    fn pick_wait<R: Rng>(&self, candidates: &[Candidate], cur_dim: isize, rng: &mut R) -> usize {
        debug_assert!(!candidates.is_empty());
        match self.pick {
            PickAlgorithm::Random | PickAlgorithm::MinCongestion => {
                rng.gen_range(0..candidates.len())
            }
            PickAlgorithm::StraightLines => pick_straight(candidates, cur_dim, rng),
        }
    }
}

/// Dimension a flit is currently traveling along; -1 off the torus
/// (fresh from an endpoint).
fn dim_of(dirn: PortDirection) -> isize {
    dirn.dim().map(|d| d as isize).unwrap_or(-1)
}

/// Nearest candidate dimension to `cur_dim`; candidates arrive sorted
/// by dimension. Equidistant neighbors flip a coin.
fn pick_straight<R: Rng>(candidates: &[Candidate], cur_dim: isize, rng: &mut R) -> usize {
    debug_assert!(candidates.windows(2).all(|w| w[0].dim < w[1].dim));
    let above = candidates
        .iter()
        .position(|c| (c.dim as isize) > cur_dim)
        .unwrap_or(candidates.len());
    if above == candidates.len() {
        return above - 1;
    }
    if above == 0 {
        return 0;
    }
    let below = above - 1;
    let dist_below = cur_dim - candidates[below].dim as isize;
    let dist_above = candidates[above].dim as isize - cur_dim;
    if dist_below != dist_above {
        if dist_below < dist_above {
            below
        } else {
            above
        }
    } else if rng.gen::<bool>() {
        above
    } else {
        below
    }
}

/// Minimal-weight outport candidates of `router` for every destination
/// router, from shortest paths over the internal links.
fn build_table(router: usize, topo: &Topology) -> Vec<Vec<(usize, u64)>> {
    let mut graph: Graph<usize, u64> = Graph::new();
    let indices = (0..topo.num_routers())
        .map(|r| graph.add_node(r))
        .collect::<Vec<NodeIndex>>();
    for link in topo.int_links() {
        graph.add_edge(indices[link.src_router], indices[link.dst_router], link.weight);
    }
    let from_here = dijkstra(&graph, indices[router], None, |e| *e.weight());

    let outports = topo.router_outports(router);
    let mut table = vec![Vec::new(); topo.num_routers()];
    for (index, port) in outports.iter().enumerate() {
        let neighbor = match port.peer {
            Peer::Router(r) => r,
            Peer::Node(_) => continue,
        };
        let weight = topo.link_weight(port.link);
        let from_neighbor = dijkstra(&graph, indices[neighbor], None, |e| *e.weight());
        for dest in 0..topo.num_routers() {
            if dest == router {
                continue;
            }
            let via = from_neighbor.get(&indices[dest]).map(|d| d + weight);
            if via.is_some() && via == from_here.get(&indices[dest]).copied() {
                table[dest].push((index, weight));
            }
        }
    }
    table
}
