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

//! Fabric shapes: rings and k-ary n-cube tori.
//!
//! A topology is a set of routers, a set of endpoint nodes, and two link
//! lists. External links attach one node to one router; internal links are
//! directed router-to-router channels. Link ids are dense and assigned in
//! creation order, external links first, so they are stable coordinates
//! for configuration and fault injection.

mod ring;
mod torus;

use num::integer::div_rem;
use petgraph::graph::Graph;
use std::fmt;

use crate::Cycle;
use crate::Error;
use crate::NetworkConfig;

pub type LinkId = usize;

/// Default weight of an internal link, used by table routing.
pub const LINK_WEIGHT: u64 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Cpu,
    Dma,
}

/// Port labels on a router.
///
/// `East`/`West` belong to rings, `Lower(d)`/`Upper(d)` to tori: the
/// lower port of dimension `d` decrements coordinate `d` (wrapping),
/// the upper port increments it. `Local` ports face attached nodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PortDirection {
    Local,
    East,
    West,
    Lower(usize),
    Upper(usize),
}

impl PortDirection {
    /// The dimension a torus port travels along.
    pub fn dim(&self) -> Option<usize> {
        match self {
            Self::Lower(d) | Self::Upper(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::East => write!(f, "East"),
            Self::West => write!(f, "West"),
            Self::Lower(d) => write!(f, "lower{}", d),
            Self::Upper(d) => write!(f, "upper{}", d),
        }
    }
}

/// Attachment of one node to one router. Carries traffic both ways.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtLink {
    pub id: LinkId,
    pub node: usize,
    pub router: usize,
    pub latency: Cycle,
}

/// One directed router-to-router channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntLink {
    pub id: LinkId,
    pub src_router: usize,
    pub dst_router: usize,
    pub src_outport: PortDirection,
    pub dst_inport: PortDirection,
    pub latency: Cycle,
    pub weight: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Shape {
    Ring,
    Torus {
        ary: usize,
        dim: usize,
        bidirectional: bool,
    },
}

/// What sits at the far end of a router port.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Peer {
    Node(usize),
    Router(usize),
}

/// One port of a router, identified by the link it terminates.
///
/// Ports are enumerated in link id order, external attachments first,
/// so port indices are identical for everyone deriving them from the
/// same topology.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortRef {
    pub link: LinkId,
    pub dirn: PortDirection,
    pub peer: Peer,
}

/// Vertices of the connectivity graph, kept for rendering and debug.
#[derive(Clone, Debug)]
enum TopoVertex {
    Router(usize),
    Endpoint(usize, NodeKind),
}

pub struct Topology {
    shape: Shape,
    num_routers: usize,
    nodes: Vec<NodeKind>,
    node_router: Vec<usize>,
    ext_links: Vec<ExtLink>,
    int_links: Vec<IntLink>,
    graph: Graph<TopoVertex, LinkId>,
}

impl Topology {
    pub fn build(config: &NetworkConfig) -> Result<Self, Error> {
        config.validate()?;
        let shape = match config.topology.as_str() {
            "Ring" => Shape::Ring,
            "Torus" => Shape::Torus {
                ary: config.num_ary,
                dim: config.num_dim,
                bidirectional: config.enable_bidirectional,
            },
            other => {
                return Err(Error::InvalidTopology(format!(
                    "unknown shape \"{}\"",
                    other
                )))
            }
        };
        let num_routers = config.num_routers();
        let nodes = (0..config.num_cpus)
            .map(|_| NodeKind::Cpu)
            .chain((0..config.num_dmas).map(|_| NodeKind::Dma))
            .collect::<Vec<_>>();

        let ext_links = attach_nodes(&nodes, num_routers, config.link_latency)?;
        let int_links = match shape {
            Shape::Ring => ring::links(num_routers, ext_links.len(), config.link_latency),
            Shape::Torus {
                ary,
                dim,
                bidirectional,
            } => torus::links(
                ary,
                dim,
                bidirectional,
                ext_links.len(),
                config.link_latency,
            ),
        };

        let node_router = ext_links.iter().map(|l| l.router).collect::<Vec<_>>();

        let mut graph = Graph::new();
        let router_ix = (0..num_routers)
            .map(|r| graph.add_node(TopoVertex::Router(r)))
            .collect::<Vec<_>>();
        let node_ix = nodes
            .iter()
            .enumerate()
            .map(|(n, kind)| graph.add_node(TopoVertex::Endpoint(n, *kind)))
            .collect::<Vec<_>>();
        for link in &ext_links {
            graph.add_edge(node_ix[link.node], router_ix[link.router], link.id);
            graph.add_edge(router_ix[link.router], node_ix[link.node], link.id);
        }
        for link in &int_links {
            graph.add_edge(router_ix[link.src_router], router_ix[link.dst_router], link.id);
        }

        Ok(Self {
            shape,
            num_routers,
            nodes,
            node_router,
            ext_links,
            int_links,
            graph,
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn num_routers(&self) -> usize {
        self.num_routers
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_kind(&self, node: usize) -> NodeKind {
        self.nodes[node]
    }

    pub fn router_of_node(&self, node: usize) -> usize {
        self.node_router[node]
    }

    pub fn ext_links(&self) -> &[ExtLink] {
        &self.ext_links
    }

    pub fn int_links(&self) -> &[IntLink] {
        &self.int_links
    }

    pub fn num_links(&self) -> usize {
        self.ext_links.len() + self.int_links.len()
    }

    /// `(ary, dim)` of the shape; a ring reads as an N-ary 1-cube.
    pub fn radix_dims(&self) -> (usize, usize) {
        match self.shape {
            Shape::Ring => (self.num_routers, 1),
            Shape::Torus { ary, dim, .. } => (ary, dim),
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        match self.shape {
            Shape::Ring => true,
            Shape::Torus { bidirectional, .. } => bidirectional,
        }
    }

    /// Input ports of `router` in link id order.
    pub fn router_inports(&self, router: usize) -> Vec<PortRef> {
        let ext = self
            .ext_links
            .iter()
            .filter(|l| l.router == router)
            .map(|l| PortRef {
                link: l.id,
                dirn: PortDirection::Local,
                peer: Peer::Node(l.node),
            });
        let int = self
            .int_links
            .iter()
            .filter(|l| l.dst_router == router)
            .map(|l| PortRef {
                link: l.id,
                dirn: l.dst_inport,
                peer: Peer::Router(l.src_router),
            });
        ext.chain(int).collect()
    }

    /// Output ports of `router` in link id order.
    pub fn router_outports(&self, router: usize) -> Vec<PortRef> {
        let ext = self
            .ext_links
            .iter()
            .filter(|l| l.router == router)
            .map(|l| PortRef {
                link: l.id,
                dirn: PortDirection::Local,
                peer: Peer::Node(l.node),
            });
        let int = self
            .int_links
            .iter()
            .filter(|l| l.src_router == router)
            .map(|l| PortRef {
                link: l.id,
                dirn: l.src_outport,
                peer: Peer::Router(l.dst_router),
            });
        ext.chain(int).collect()
    }

    pub fn link_weight(&self, link: LinkId) -> u64 {
        if link < self.ext_links.len() {
            LINK_WEIGHT
        } else {
            self.int_links[link - self.ext_links.len()].weight
        }
    }

    pub fn link_latency(&self, link: LinkId) -> Cycle {
        if link < self.ext_links.len() {
            self.ext_links[link].latency
        } else {
            self.int_links[link - self.ext_links.len()].latency
        }
    }

    pub fn to_graphviz(&self) -> String {
        use petgraph::dot::{Config, Dot};
        use petgraph::visit::EdgeRef;

        let generator = Dot::with_attr_getters(
            &self.graph,
            &[Config::NodeNoLabel, Config::EdgeNoLabel],
            &|_, edge| format!("label=\"link {}\"", edge.weight()),
            &|_, (_, vertex)| match vertex {
                TopoVertex::Router(r) => format!("label=\"router {}\"; shape=\"box\"", r),
                TopoVertex::Endpoint(n, kind) => format!("label=\"{:?} {}\"", kind, n),
            },
        );
        format!("{:?}", generator)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_graphviz())
    }
}

/// Deal nodes out to routers round-robin; leftovers land on router 0 and
/// must be DMA controllers.
fn attach_nodes(
    nodes: &[NodeKind],
    num_routers: usize,
    latency: Cycle,
) -> Result<Vec<ExtLink>, Error> {
    let remainder = nodes.len() % num_routers;
    let dealt = nodes.len() - remainder;
    let mut links = Vec::with_capacity(nodes.len());
    for (node, kind) in nodes.iter().enumerate() {
        let router = if node < dealt {
            let (_cntrl_level, router) = div_rem(node, num_routers);
            router
        } else {
            if *kind != NodeKind::Dma {
                return Err(Error::InvalidConfig(format!(
                    "leftover node {} is not a DMA controller",
                    node
                )));
            }
            0
        };
        links.push(ExtLink {
            id: links.len(),
            node,
            router,
            latency,
        });
    }
    Ok(links)
}

/// Linear index of the element in a multi-dimensional grid.
/// The element is represented as a vector of coordinates in `dims`;
/// dimension 0 is the least significant.
pub fn linearize_index(elem: &[usize], dims: &[usize]) -> usize {
    let mut index: usize = 0;
    for (d, c) in elem.iter().enumerate() {
        index += c * dims[0..d].iter().product::<usize>();
    }
    index
}

/// Given a linear index of the element, return the vector of coordinates
/// in a multi-dimensional grid of `dims` dimensions.
pub fn delinearize_index(index: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = index;
    let mut elem = (0..dims.len()).map(|_| 0).collect::<Vec<usize>>();

    for (d, m) in dims.iter().enumerate().rev() {
        let prod = dims[0..d].iter().product::<usize>();
        if d == 0 {
            elem[d] = idx % m;
        } else {
            elem[d] = idx / prod;
            idx -= elem[d] * prod;
        }
    }
    elem
}

/// Coordinate of router `index` along dimension `d` of an `ary`-radix cube.
pub fn coordinate(index: usize, d: usize, ary: usize) -> usize {
    index / ary.pow(d as u32) % ary
}

#[cfg(test)]
mod topology_tests {
    use super::*;
    use itertools::Itertools;
    use std::collections::HashMap;

    fn busiest_router(links: &[ExtLink]) -> Option<usize> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for link in links {
            *counts.entry(link.router).or_insert(0) += 1;
        }
        counts.into_iter().max_by_key(|(_, c)| *c).map(|(r, _)| r)
    }

    fn torus_config(ary: usize, dim: usize, bidirectional: bool) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.topology = "Torus".to_string();
        config.num_ary = ary;
        config.num_dim = dim;
        config.num_cpus = ary.pow(dim as u32);
        config.enable_bidirectional = bidirectional;
        config
    }

    #[test]
    fn test_linearize() {
        assert_eq!(linearize_index(&[1, 1], &[4, 4]), 5);
        assert_eq!(linearize_index(&[1, 1], &[5, 5]), 6);
        assert_eq!(linearize_index(&[3, 3], &[4, 4]), 15);
    }

    #[test]
    fn test_delinearize() {
        assert_eq!(delinearize_index(6, &[4, 4]), vec![2, 1]);
        assert_eq!(delinearize_index(6, &[5, 5]), vec![1, 1]);
        assert_eq!(delinearize_index(15, &[4, 4]), vec![3, 3]);
    }

    #[test]
    fn test_lindelin() {
        let dims = vec![3, 4, 5, 6];
        for e in dims.iter().map(|&d| 0..d).multi_cartesian_product() {
            assert_eq!(delinearize_index(linearize_index(&e, &dims), &dims), e);
        }
    }

    #[test]
    fn test_coordinate() {
        // Router 27 of a 4-ary 3-cube sits at (3, 2, 1).
        assert_eq!(coordinate(27, 0, 4), 3);
        assert_eq!(coordinate(27, 1, 4), 2);
        assert_eq!(coordinate(27, 2, 4), 1);
    }

    #[test]
    fn link_ids_are_dense_ext_then_int() {
        let topo = Topology::build(&torus_config(4, 2, true)).unwrap();
        for (i, link) in topo.ext_links().iter().enumerate() {
            assert_eq!(link.id, i);
        }
        for (i, link) in topo.int_links().iter().enumerate() {
            assert_eq!(link.id, topo.ext_links().len() + i);
        }
    }

    #[test]
    fn torus_link_counts() {
        // The 8-ary 2-cube with one cpu per router: 64 attachments and
        // 2 directions x 2 dims x 64 routers = 256 internal channels.
        let topo = Topology::build(&torus_config(8, 2, true)).unwrap();
        assert_eq!(topo.num_routers(), 64);
        assert_eq!(topo.ext_links().len(), 64);
        assert_eq!(topo.int_links().len(), 256);
        assert_eq!(topo.radix_dims(), (8, 2));

        let topo = Topology::build(&torus_config(4, 3, false)).unwrap();
        assert_eq!(topo.num_routers(), 64);
        assert_eq!(topo.int_links().len(), 3 * 64);
    }

    #[test]
    fn torus_lower_decrements_upper_increments() {
        let topo = Topology::build(&torus_config(3, 2, true)).unwrap();
        for link in topo.int_links() {
            let (src, dst) = (link.src_router, link.dst_router);
            match link.src_outport {
                PortDirection::Lower(d) => {
                    assert_eq!(link.dst_inport, PortDirection::Upper(d));
                    assert_eq!(coordinate(dst, d, 3), (coordinate(src, d, 3) + 2) % 3);
                    for other in (0..2).filter(|o| *o != d) {
                        assert_eq!(coordinate(dst, other, 3), coordinate(src, other, 3));
                    }
                }
                PortDirection::Upper(d) => {
                    assert_eq!(link.dst_inport, PortDirection::Lower(d));
                    assert_eq!(coordinate(dst, d, 3), (coordinate(src, d, 3) + 1) % 3);
                }
                other => panic!("unexpected outport {} on a torus", other),
            }
        }
    }

    #[test]
    fn two_ary_pairs_carry_four_channels() {
        let topo = Topology::build(&torus_config(2, 1, true)).unwrap();
        assert_eq!(topo.num_routers(), 2);
        // lower and upper reach the same neighbor, two channels each way.
        assert_eq!(topo.int_links().len(), 4);
        assert_eq!(
            topo.int_links()
                .iter()
                .filter(|l| l.src_router == 0 && l.dst_router == 1)
                .count(),
            2
        );
    }

    #[test]
    fn ring_is_a_single_cycle() {
        let mut config = NetworkConfig::default();
        config.num_cpus = 6;
        let topo = Topology::build(&config).unwrap();
        assert_eq!(topo.num_routers(), 6);
        assert_eq!(topo.int_links().len(), 12);
        assert_eq!(topo.radix_dims(), (6, 1));

        // One East and one West neighbor each, and walking East visits
        // every router before coming home.
        let east = topo
            .int_links()
            .iter()
            .filter(|l| l.src_outport == PortDirection::East)
            .collect::<Vec<_>>();
        assert_eq!(east.len(), 6);
        let mut at = 0;
        let mut seen = vec![false; 6];
        for _ in 0..6 {
            assert!(!seen[at]);
            seen[at] = true;
            let hop = east.iter().find(|l| l.src_router == at).unwrap();
            assert_eq!(hop.dst_inport, PortDirection::West);
            at = hop.dst_router;
        }
        assert_eq!(at, 0);
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn ring_emits_east_links_before_west() {
        let mut config = NetworkConfig::default();
        config.num_cpus = 4;
        let topo = Topology::build(&config).unwrap();
        let dirs = topo
            .int_links()
            .iter()
            .map(|l| l.src_outport)
            .collect::<Vec<_>>();
        assert_eq!(
            dirs[..4],
            [PortDirection::East; 4],
            "East channels come first"
        );
        assert_eq!(dirs[4..], [PortDirection::West; 4]);
        // East of router i feeds router i+1 mod N.
        for (i, link) in topo.int_links()[..4].iter().enumerate() {
            assert_eq!(link.src_router, i);
            assert_eq!(link.dst_router, (i + 1) % 4);
        }
    }

    #[test]
    fn leftover_nodes_go_to_router_zero() {
        let mut config = torus_config(2, 2, true);
        config.num_cpus = 4;
        config.num_dmas = 2;
        let topo = Topology::build(&config).unwrap();
        assert_eq!(topo.num_nodes(), 6);
        assert_eq!(topo.node_kind(4), NodeKind::Dma);
        assert_eq!(topo.router_of_node(4), 0);
        assert_eq!(topo.router_of_node(5), 0);
        // The dealt-out cpus stay round-robin.
        for cpu in 0..4 {
            assert_eq!(topo.router_of_node(cpu), cpu);
        }
        assert_eq!(busiest_router(topo.ext_links()), Some(0));
    }

    #[test]
    fn ports_enumerate_in_link_order() {
        let topo = Topology::build(&torus_config(3, 2, true)).unwrap();
        for router in 0..topo.num_routers() {
            let outports = topo.router_outports(router);
            let inports = topo.router_inports(router);
            // Local attachment first, then one port per internal link.
            assert_eq!(outports.len(), 1 + 4);
            assert_eq!(inports.len(), 1 + 4);
            assert!(outports.windows(2).all(|w| w[0].link < w[1].link));
            assert!(inports.windows(2).all(|w| w[0].link < w[1].link));
            assert_eq!(outports[0].dirn, PortDirection::Local);
            // Every internal direction appears exactly once.
            for d in 0..2 {
                for dirn in [PortDirection::Lower(d), PortDirection::Upper(d)] {
                    assert_eq!(outports.iter().filter(|p| p.dirn == dirn).count(), 1);
                    assert_eq!(inports.iter().filter(|p| p.dirn == dirn).count(), 1);
                }
            }
        }
    }

    #[test]
    fn render_graphviz() {
        let _logger = env_logger::builder().try_init();
        let mut config = NetworkConfig::default();
        config.num_cpus = 3;
        let topo = Topology::build(&config).unwrap();
        let dot = topo.to_graphviz();
        log::debug!("{}", dot);
        assert!(dot.contains("router 0"));
        assert!(dot.contains("link 0"));
    }
}
