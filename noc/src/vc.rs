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

//! Virtual channel classes, downstream VC bookkeeping and waiting queues.
//!
//! Every port carries `vnets * vcs_per_vnet` VCs. Within a vnet, the
//! routing algorithm partitions the VC indices into classes; a flit may
//! only allocate a VC from the range of the class its route computation
//! granted. The class structure is what makes each algorithm
//! deadlock-free, so the ranges here are load-bearing, not tuning.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::ops::Range;

use crate::routing::RoutingAlgorithm;
use crate::Error;
use crate::NetworkConfig;

/// Maps VC classes onto VC index ranges within one vnet.
///
/// - Weight table and XY have a single class 0 covering all VCs.
/// - Deterministic keeps a dateline pair: class 0 is the lower half,
///   class 1 the upper half.
/// - Static adaptive shares `[0, vcs_adaptive)` between the adaptive
///   classes `0..dr_lim` and splits the rest into the escape dateline
///   pair `dr_lim`/`dr_lim + 1`.
/// - Dynamic adaptive has class 0 for fresh flits and class 1 for
///   flits that took a reversal, both drawing on `[0, vcs_adaptive)`
///   unless throttling reserves `[0, throttling_degree)` for class 0;
///   classes 2/3 are the escape dateline pair.
///
/// Ejection (the hop into the destination node) uses a dedicated class
/// spanning the whole vnet.
#[derive(Copy, Clone, Debug)]
pub struct VcScheme {
    pub algorithm: RoutingAlgorithm,
    pub vcs_per_vnet: usize,
    pub vcs_adaptive: usize,
    pub dr_lim: u32,
    pub throttling_degree: usize,
}

impl VcScheme {
    pub fn from_config(config: &NetworkConfig) -> Result<Self, Error> {
        Ok(Self {
            algorithm: RoutingAlgorithm::try_from(config.routing_algorithm)?,
            vcs_per_vnet: config.vcs_per_vnet,
            vcs_adaptive: config.vcs_adaptive,
            dr_lim: config.dr_lim,
            throttling_degree: config.throttling_degree,
        })
    }

    /// Class granted for the hop into the destination node.
    pub fn ejection_class(&self) -> usize {
        match self.algorithm {
            RoutingAlgorithm::WeightTable | RoutingAlgorithm::Xy => 0,
            RoutingAlgorithm::Deterministic => 2,
            RoutingAlgorithm::StaticAdaptive => self.dr_lim as usize + 2,
            RoutingAlgorithm::DynamicAdaptive => 4,
        }
    }

    /// Class a network interface allocates from when injecting. The
    /// adaptive algorithms must keep fresh flits out of the escape
    /// VCs, which double as the marker for flits already escaped.
    pub fn injection_class(&self) -> usize {
        match self.algorithm {
            RoutingAlgorithm::StaticAdaptive | RoutingAlgorithm::DynamicAdaptive => 0,
            _ => self.ejection_class(),
        }
    }

    /// Escape class for dateline half `half` (0 or 1).
    pub fn escape_class(&self, half: usize) -> usize {
        debug_assert!(half < 2);
        match self.algorithm {
            RoutingAlgorithm::Deterministic => half,
            RoutingAlgorithm::StaticAdaptive => self.dr_lim as usize + half,
            RoutingAlgorithm::DynamicAdaptive => 2 + half,
            _ => 0,
        }
    }

    /// VC offsets within a vnet the class may allocate from.
    pub fn class_range(&self, class: usize) -> Range<usize> {
        let all = 0..self.vcs_per_vnet;
        match self.algorithm {
            RoutingAlgorithm::WeightTable | RoutingAlgorithm::Xy => all,
            RoutingAlgorithm::Deterministic => {
                let half = self.vcs_per_vnet / 2;
                match class {
                    0 => 0..half,
                    1 => half..self.vcs_per_vnet,
                    _ => all,
                }
            }
            RoutingAlgorithm::StaticAdaptive => {
                let dr_lim = self.dr_lim as usize;
                if class < dr_lim {
                    0..self.vcs_adaptive
                } else if class == dr_lim {
                    self.escape_lower()
                } else if class == dr_lim + 1 {
                    self.escape_upper()
                } else {
                    all
                }
            }
            RoutingAlgorithm::DynamicAdaptive => match class {
                0 if self.throttling_degree > 0 => 0..self.throttling_degree,
                0 => 0..self.vcs_adaptive,
                1 if self.throttling_degree > 0 => self.throttling_degree..self.vcs_adaptive,
                1 => 0..self.vcs_adaptive,
                2 => self.escape_lower(),
                3 => self.escape_upper(),
                _ => all,
            },
        }
    }

    /// Escape VCs double as the marker that a flit left the adaptive
    /// network; a flit arriving on one stays deterministic.
    pub fn is_escape_vc(&self, vc_in_vnet: usize) -> bool {
        matches!(
            self.algorithm,
            RoutingAlgorithm::StaticAdaptive | RoutingAlgorithm::DynamicAdaptive
        ) && vc_in_vnet >= self.vcs_adaptive
    }

    fn escape_lower(&self) -> Range<usize> {
        self.vcs_adaptive..self.escape_mid()
    }

    fn escape_upper(&self) -> Range<usize> {
        self.escape_mid()..self.vcs_per_vnet
    }

    fn escape_mid(&self) -> usize {
        self.vcs_adaptive + (self.vcs_per_vnet - self.vcs_adaptive) / 2
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VcState {
    Idle,
    Active,
}

/// Mirror of one input VC of the downstream router: its allocation
/// state and the credits (free buffer slots) it has left.
#[derive(Clone, Debug)]
pub struct OutVcState {
    state: VcState,
    credits: usize,
    depth: usize,
}

impl OutVcState {
    pub fn new(depth: usize) -> Self {
        Self {
            state: VcState::Idle,
            credits: depth,
            depth,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == VcState::Idle
    }

    pub fn set_state(&mut self, state: VcState) {
        self.state = state;
    }

    pub fn has_credit(&self) -> bool {
        self.credits > 0
    }

    pub fn credits(&self) -> usize {
        self.credits
    }

    /// Buffer slots occupied downstream.
    pub fn occupancy(&self) -> usize {
        self.depth - self.credits
    }

    pub fn decrement_credit(&mut self) {
        assert!(self.credits > 0, "credit underflow");
        self.credits -= 1;
    }

    pub fn increment_credit(&mut self) {
        assert!(self.credits < self.depth, "credit overflow");
        self.credits += 1;
    }
}

/// Reservations on one output VC, used by dynamic adaptive routing.
///
/// A flit that cannot find a free VC may line up here behind flits with
/// strictly more dimension reversals; when the VC frees, the head of the
/// queue is granted the VC directly.
#[derive(Clone, Debug, Default)]
pub struct WaitingQueue {
    queue: VecDeque<(usize, usize)>,
    /// Reversal count of the last flit that lined up. A newcomer may
    /// only enqueue with a strictly smaller count, so the queue is
    /// ordered by descending reversals.
    channel_dr: u32,
}

impl WaitingQueue {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dr(&self) -> u32 {
        self.channel_dr
    }

    pub fn enqueue(&mut self, inport: usize, invc: usize, dr: u32) {
        self.channel_dr = dr;
        self.queue.push_back((inport, invc));
    }

    pub fn peek(&self) -> Option<(usize, usize)> {
        self.queue.front().copied()
    }

    pub fn dequeue(&mut self) -> Option<(usize, usize)> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod vc_tests {
    use super::*;

    fn scheme(algorithm: RoutingAlgorithm) -> VcScheme {
        VcScheme {
            algorithm,
            vcs_per_vnet: 8,
            vcs_adaptive: 4,
            dr_lim: 2,
            throttling_degree: 0,
        }
    }

    #[test]
    fn table_and_xy_use_the_whole_vnet() {
        for algorithm in [RoutingAlgorithm::WeightTable, RoutingAlgorithm::Xy] {
            let s = scheme(algorithm);
            assert_eq!(s.class_range(0), 0..8);
            assert_eq!(s.ejection_class(), 0);
            assert!(!s.is_escape_vc(7));
        }
    }

    #[test]
    fn deterministic_dateline_halves() {
        let s = scheme(RoutingAlgorithm::Deterministic);
        assert_eq!(s.class_range(0), 0..4);
        assert_eq!(s.class_range(1), 4..8);
        assert_eq!(s.class_range(s.ejection_class()), 0..8);
        assert_eq!(s.escape_class(1), 1);
    }

    #[test]
    fn static_adaptive_pools_and_escapes() {
        let s = scheme(RoutingAlgorithm::StaticAdaptive);
        // Adaptive classes share the pool.
        assert_eq!(s.class_range(0), 0..4);
        assert_eq!(s.class_range(1), 0..4);
        // dr_lim = 2: escape pair at 2 and 3.
        assert_eq!(s.class_range(2), 4..6);
        assert_eq!(s.class_range(3), 6..8);
        assert_eq!(s.escape_class(0), 2);
        assert_eq!(s.class_range(s.ejection_class()), 0..8);
        assert!(s.is_escape_vc(4));
        assert!(!s.is_escape_vc(3));
    }

    #[test]
    fn dynamic_adaptive_throttling_split() {
        let mut s = scheme(RoutingAlgorithm::DynamicAdaptive);
        assert_eq!(s.class_range(0), 0..4);
        assert_eq!(s.class_range(1), 0..4);
        s.throttling_degree = 1;
        assert_eq!(s.class_range(0), 0..1);
        assert_eq!(s.class_range(1), 1..4);
        assert_eq!(s.class_range(2), 4..6);
        assert_eq!(s.class_range(3), 6..8);
        assert_eq!(s.injection_class(), 0);
        assert_eq!(s.class_range(s.ejection_class()), 0..8);
    }

    #[test]
    fn out_vc_credit_accounting() {
        let mut vc = OutVcState::new(4);
        assert!(vc.is_idle());
        assert_eq!(vc.credits(), 4);
        vc.set_state(VcState::Active);
        vc.decrement_credit();
        vc.decrement_credit();
        assert_eq!(vc.credits(), 2);
        assert_eq!(vc.occupancy(), 2);
        vc.increment_credit();
        assert!(vc.has_credit());
        assert_eq!(vc.occupancy(), 1);
    }

    #[test]
    fn waiting_queue_tracks_last_dr() {
        let mut q = WaitingQueue::default();
        assert!(q.is_empty());
        q.enqueue(0, 3, 2);
        q.enqueue(1, 0, 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dr(), 1);
        assert_eq!(q.peek(), Some((0, 3)));
        assert_eq!(q.dequeue(), Some((0, 3)));
        assert_eq!(q.dequeue(), Some((1, 0)));
        assert_eq!(q.dequeue(), None);
    }
}
