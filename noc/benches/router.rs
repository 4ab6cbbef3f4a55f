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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use noc::{Network, NetworkConfig, TrafficConfig, TrafficGenerator};

const CYCLES: usize = 1000;
const INJECTION_RATE: f64 = 0.1;

fn config(routing_algorithm: u32) -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.topology = "Torus".to_string();
    config.num_ary = 4;
    config.num_dim = 2;
    config.num_cpus = 16;
    config.vcs_per_vnet = 4;
    config.vcs_adaptive = 2;
    config.dr_lim = 2;
    config.misrouting_lim = 2;
    config.routing_algorithm = routing_algorithm;
    config
}

fn step_loaded_network(bench: &mut Bencher, routing_algorithm: u32) {
    let network_config = config(routing_algorithm);
    let traffic_config = TrafficConfig {
        pattern: "uniform_random".to_string(),
        injection_rate: INJECTION_RATE,
        vnet: 2,
        packet_size: 16,
    };

    bench.iter(|| {
        let mut network = Network::new(&network_config).unwrap();
        let mut traffic = TrafficGenerator::new(&traffic_config, &network_config).unwrap();
        network.run(&mut traffic, CYCLES).unwrap();
        network.stats().packets_received()
    });
}

fn deterministic(bench: &mut Bencher) {
    step_loaded_network(bench, 2);
}

fn static_adaptive(bench: &mut Bencher) {
    step_loaded_network(bench, 3);
}

fn dynamic_adaptive(bench: &mut Bencher) {
    step_loaded_network(bench, 4);
}

benchmark_group!(benches, deterministic, static_adaptive, dynamic_adaptive);
benchmark_main!(benches);
