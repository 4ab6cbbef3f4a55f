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

//! Synthetic traffic generation.
//!
//! Every node flips a Bernoulli coin each cycle; on success the pattern
//! maps the source to a destination and a packet enters the source
//! queue. Packets addressed to their own source are not injected.

use num::integer::div_ceil;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::convert::TryFrom;
use std::fmt;

use crate::flit::Packet;
use crate::topology::{delinearize_index, linearize_index};
use crate::Cycle;
use crate::Error;
use crate::{NetworkConfig, TrafficConfig};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrafficPattern {
    /// Every packet draws a fresh destination uniformly.
    UniformRandom,
    /// Destination is the source id rotated left by one bit.
    Shuffle,
    /// Destination is offset by just under half the ring in every
    /// dimension, the worst case for minimal routing on a torus.
    Tornado,
    /// Destination coordinates are the source coordinates reversed.
    Transpose,
}

impl TryFrom<&str> for TrafficPattern {
    type Error = Error;

    fn try_from(name: &str) -> Result<Self, Error> {
        match name {
            "uniform_random" => Ok(Self::UniformRandom),
            "shuffle" => Ok(Self::Shuffle),
            "tornado" => Ok(Self::Tornado),
            "transpose" => Ok(Self::Transpose),
            other => Err(Error::InvalidTrafficPattern(other.to_string())),
        }
    }
}

impl fmt::Display for TrafficPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::UniformRandom => "uniform_random",
            Self::Shuffle => "shuffle",
            Self::Tornado => "tornado",
            Self::Transpose => "transpose",
        };
        write!(f, "{}", name)
    }
}

/// Open-loop packet source for all nodes of one network.
pub struct TrafficGenerator {
    pattern: TrafficPattern,
    injection_rate: f64,
    vnet: usize,
    packet_size: usize,
    num_nodes: usize,
    /// Mixed-radix digit bounds of the node id space, dimension 0 first.
    dims: Vec<usize>,
    rng: Xoshiro256StarStar,
    next_id: u64,
}

impl TrafficGenerator {
    pub fn new(traffic: &TrafficConfig, network: &NetworkConfig) -> Result<Self, Error> {
        let pattern = TrafficPattern::try_from(traffic.pattern.as_str())?;
        if traffic.vnet >= network.num_vnets() {
            return Err(Error::InvalidVnet(traffic.vnet));
        }
        let num_nodes = network.num_nodes();
        if num_nodes < 2 {
            return Err(Error::InvalidTrafficPattern(
                "traffic needs at least two nodes".to_string(),
            ));
        }
        let dims = if network.topology == "Torus" {
            vec![network.num_ary; network.num_dim]
        } else {
            vec![num_nodes]
        };
        // The digit patterns only make sense on a fully populated id
        // space; extra DMA nodes would fall outside it.
        match pattern {
            TrafficPattern::Tornado | TrafficPattern::Transpose
                if dims.iter().product::<usize>() != num_nodes =>
            {
                return Err(Error::InvalidTrafficPattern(format!(
                    "{} needs the node count to fill the coordinate space",
                    pattern
                )));
            }
            TrafficPattern::Shuffle if !num_nodes.is_power_of_two() => {
                return Err(Error::InvalidTrafficPattern(
                    "shuffle needs a power-of-two node count".to_string(),
                ));
            }
            _ => {}
        }
        Ok(Self {
            pattern,
            injection_rate: traffic.injection_rate,
            vnet: traffic.vnet,
            packet_size: traffic.packet_size,
            num_nodes,
            dims,
            rng: Xoshiro256StarStar::seed_from_u64(network.seed),
            next_id: 0,
        })
    }

    pub fn pattern(&self) -> TrafficPattern {
        self.pattern
    }

    pub fn set_injection_rate(&mut self, rate: f64) {
        assert!((0.0..=1.0).contains(&rate));
        self.injection_rate = rate;
    }

    pub fn injection_rate(&self) -> f64 {
        self.injection_rate
    }

    /// One Bernoulli trial for `src` at `now`; a self-addressed draw
    /// injects nothing.
    pub fn generate(&mut self, src: usize, now: Cycle) -> Option<Packet> {
        if self.injection_rate <= 0.0 || !self.rng.gen_bool(self.injection_rate) {
            return None;
        }
        let dest = self.destination(src)?;
        let id = self.next_id;
        self.next_id += 1;
        Some(Packet::new(id, src, dest, self.vnet, self.packet_size, now))
    }

    fn destination(&mut self, src: usize) -> Option<usize> {
        let dest = match self.pattern {
            TrafficPattern::UniformRandom => loop {
                let dest = self.rng.gen_range(0..self.num_nodes);
                if dest != src {
                    break dest;
                }
            },
            TrafficPattern::Shuffle => {
                let bits = self.num_nodes.trailing_zeros();
                ((src << 1) | (src >> (bits - 1))) & (self.num_nodes - 1)
            }
            TrafficPattern::Tornado => {
                let digits = delinearize_index(src, &self.dims)
                    .iter()
                    .zip(&self.dims)
                    .map(|(digit, ary)| (digit + div_ceil(*ary, 2) - 1) % ary)
                    .collect::<Vec<_>>();
                linearize_index(&digits, &self.dims)
            }
            TrafficPattern::Transpose => {
                let mut digits = delinearize_index(src, &self.dims);
                digits.reverse();
                linearize_index(&digits, &self.dims)
            }
        };
        if dest == src {
            None
        } else {
            Some(dest)
        }
    }
}
