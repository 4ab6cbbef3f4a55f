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

//! Fault-model capability surface.
//!
//! The network declares every router's buffer geometry at build time
//! and may then ask for aggregate and per-buffer fault probabilities.
//! Fault injection itself is out of scope; the interface exists so a
//! model can be plugged in without touching the network.

/// Per-router fault statistics keyed by buffer geometry.
pub trait FaultModel {
    /// Register a router and its geometry; must be called once per
    /// router before any query.
    fn declare_router(&mut self, router: usize, ports: usize, vcs: usize, buffers_per_vc: usize);

    /// Probability that any buffer of `router` is faulty.
    fn fault_probability(&self, router: usize) -> f64;

    /// Per-buffer fault probabilities for one port of `router`, one
    /// entry per VC buffer slot.
    fn buffer_fault_vector(&self, router: usize) -> Vec<f64>;
}

/// Uniform per-buffer fault rate; the aggregate scales with the number
/// of buffer slots a router carries.
pub struct UniformFaultModel {
    per_buffer_rate: f64,
    /// (ports, vcs, buffers_per_vc) per declared router.
    routers: Vec<Option<(usize, usize, usize)>>,
}

impl UniformFaultModel {
    pub fn new(per_buffer_rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&per_buffer_rate));
        Self {
            per_buffer_rate,
            routers: Vec::new(),
        }
    }

    fn geometry(&self, router: usize) -> (usize, usize, usize) {
        self.routers
            .get(router)
            .copied()
            .flatten()
            .expect("router was never declared")
    }
}

impl FaultModel for UniformFaultModel {
    fn declare_router(&mut self, router: usize, ports: usize, vcs: usize, buffers_per_vc: usize) {
        if self.routers.len() <= router {
            self.routers.resize(router + 1, None);
        }
        assert!(self.routers[router].is_none(), "router declared twice");
        self.routers[router] = Some((ports, vcs, buffers_per_vc));
    }

    fn fault_probability(&self, router: usize) -> f64 {
        let (ports, vcs, buffers) = self.geometry(router);
        let slots = (ports * vcs * buffers) as f64;
        // P(at least one of `slots` independent buffers faulty).
        1.0 - (1.0 - self.per_buffer_rate).powf(slots)
    }

    fn buffer_fault_vector(&self, router: usize) -> Vec<f64> {
        let (_, vcs, buffers) = self.geometry(router);
        vec![self.per_buffer_rate; vcs * buffers]
    }
}

#[cfg(test)]
mod fault_tests {
    use super::*;

    #[test]
    fn aggregate_scales_with_geometry() {
        let mut model = UniformFaultModel::new(0.001);
        model.declare_router(0, 5, 12, 4);
        model.declare_router(1, 3, 12, 4);
        assert!(model.fault_probability(0) > model.fault_probability(1));
        assert!(model.fault_probability(0) < 1.0);
        assert_eq!(model.buffer_fault_vector(1).len(), 48);
    }

    #[test]
    fn zero_rate_means_no_faults() {
        let mut model = UniformFaultModel::new(0.0);
        model.declare_router(0, 5, 12, 4);
        assert_eq!(model.fault_probability(0), 0.0);
        assert!(model.buffer_fault_vector(0).iter().all(|p| *p == 0.0));
    }

    #[test]
    #[should_panic(expected = "never declared")]
    fn queries_need_a_declaration() {
        let model = UniformFaultModel::new(0.1);
        model.fault_probability(3);
    }
}
