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

//! End-to-end exercise of an 8-ary 2-cube: sustained uniform-random
//! load below saturation, checked for liveness and sane trace records.

use log::info;

use noc::{Network, NetworkConfig, TrafficConfig, TrafficGenerator};

const WARMUP_CYCLES: usize = 500;
const SAMPLE_CYCLES: usize = 2_000;
const INJECTION_RATE: f64 = 0.02;

fn eight_ary_two_cube(routing_algorithm: u32) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.topology = "Torus".to_string();
    config.num_ary = 8;
    config.num_dim = 2;
    config.num_cpus = 64;
    config.vcs_per_vnet = 4;
    config.vcs_adaptive = 2;
    config.dr_lim = 2;
    config.misrouting_lim = 2;
    config.routing_algorithm = routing_algorithm;
    config
}

fn uniform_traffic(rate: f64) -> TrafficConfig {
    TrafficConfig {
        pattern: "uniform_random".to_string(),
        injection_rate: rate,
        vnet: 2,
        packet_size: 16,
    }
}

fn simulate(config: &NetworkConfig, rate: f64) -> anyhow::Result<noc::Record> {
    let mut network = Network::new(config)?;
    let mut traffic = TrafficGenerator::new(&uniform_traffic(rate), config)?;
    network.run(&mut traffic, WARMUP_CYCLES)?;
    network.reset_stats();
    network.run(&mut traffic, SAMPLE_CYCLES)?;
    Ok(network.record(rate, SAMPLE_CYCLES))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    for routing_algorithm in [2, 3, 4] {
        let config = eight_ary_two_cube(routing_algorithm);
        let record = simulate(&config, INJECTION_RATE)?;
        info!(
            "algorithm {}: {} packets, avg latency {:.3}, avg hops {:.3}",
            routing_algorithm, record.packets_received, record.avg_latency, record.avg_hops
        );
        assert!(!record.is_skip());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use noc::{coordinate, Packet, PortDirection, Records, Topology};
    use std::io::Cursor;

    #[test]
    fn eight_ary_two_cube_shape() {
        let config = eight_ary_two_cube(2);
        let topo = Topology::build(&config).unwrap();
        assert_eq!(topo.num_routers(), 64);
        assert_eq!(topo.ext_links().len(), 64);
        // 64 routers x 2 dims x 2 directions.
        assert_eq!(topo.int_links().len(), 256);
        for router in 0..64 {
            let internal = topo
                .router_inports(router)
                .iter()
                .filter(|p| p.dirn != PortDirection::Local)
                .count();
            assert_eq!(internal, 4);
        }
    }

    #[test]
    fn xy_paths_take_minimal_distances() {
        let _logger = env_logger::builder().try_init();
        let mut config = eight_ary_two_cube(1);
        config.vcs_per_vnet = 4;
        let mut network = Network::new(&config).unwrap();

        // Wrap-heavy pairs and their per-dimension minimal distances.
        let pairs = [(0, 7), (0, 36), (0, 9), (63, 0), (3, 35)];
        let mut expected_hops = 0;
        for (id, (src, dest)) in pairs.iter().enumerate() {
            for dim in 0..2 {
                let diff = (coordinate(*dest, dim, 8) + 8 - coordinate(*src, dim, 8)) % 8;
                expected_hops += diff.min(8 - diff);
            }
            network.inject(Packet::new(id as u64, *src, *dest, 2, 16, 0));
        }
        assert!(network.drain(10_000).unwrap());
        assert_eq!(network.take_received().len(), pairs.len());
        let record = network.record(0.0, SAMPLE_CYCLES);
        assert_eq!(record.avg_hops, expected_hops as f64 / pairs.len() as f64);
    }

    #[test]
    fn sustained_load_stays_live() {
        let _logger = env_logger::builder().try_init();
        for routing_algorithm in [2, 3, 4] {
            let config = eight_ary_two_cube(routing_algorithm);
            let record = simulate(&config, INJECTION_RATE).unwrap();
            assert!(!record.is_skip());
            assert!(record.packets_received > 0.0);
            assert!(record.reception_rate > 0.0);
            // Minimal or lightly misrouted paths on a 8x8 torus.
            assert!(record.avg_hops >= 1.0);
            if routing_algorithm == 3 {
                assert!(record.avg_dimension_reversals <= config.dr_lim as f64);
            }
            if routing_algorithm == 4 {
                assert!(record.avg_misrouting_count <= config.misrouting_lim as f64);
            }
        }
    }

    #[test]
    fn trace_records_round_trip() {
        let config = eight_ary_two_cube(2);
        let record = simulate(&config, INJECTION_RATE).unwrap();
        let mut buffer = Vec::new();
        record.write_to(&mut buffer).unwrap();
        let parsed = Records::new(Cursor::new(&buffer))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(parsed, vec![record]);
    }
}
