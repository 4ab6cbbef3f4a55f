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

//! Packets and the flits they are segmented into.

use bitvec::prelude::*;
use num::integer::div_ceil;

use crate::Cycle;

/// Raw payload bits carried through the fabric.
pub type Payload = BitBox<usize, Lsb0>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlitType {
    Head,
    Body,
    Tail,
    /// Single-flit packet.
    HeadTail,
}

impl FlitType {
    pub fn is_head(&self) -> bool {
        matches!(self, Self::Head | Self::HeadTail)
    }
    pub fn is_tail(&self) -> bool {
        matches!(self, Self::Tail | Self::HeadTail)
    }
}

/// Backpressure token returned upstream when a buffer slot frees.
///
/// `is_free_signal` rides on the credit of a tail flit and tells the
/// upstream output unit that the whole VC went idle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Credit {
    pub vc: usize,
    pub is_free_signal: bool,
}

/// Where a flit is going and what happened to it on the way.
#[derive(Clone, Debug)]
pub struct RouteInfo {
    /// Source node.
    pub src: usize,
    /// Destination node.
    pub dest: usize,
    pub dest_router: usize,
    /// Routers visited so far.
    pub hops: u32,
    /// Dimension reversals taken so far.
    pub dr: u32,
    /// Hops taken along an already resolved dimension.
    pub misroutes: u32,
}

impl RouteInfo {
    pub fn new(src: usize, dest: usize, dest_router: usize) -> Self {
        Self {
            src,
            dest,
            dest_router,
            hops: 0,
            dr: 0,
            misroutes: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Flit {
    /// Id of the packet this flit belongs to.
    pub packet: u64,
    pub kind: FlitType,
    /// Position within the packet.
    pub index: usize,
    pub vnet: usize,
    /// VC the flit occupies on the link it is currently traversing.
    pub vc: usize,
    pub route: RouteInfo,
    /// When the packet entered its source queue.
    pub enqueue_cycle: Cycle,
    /// When this flit left the network interface.
    pub inject_cycle: Cycle,
    /// Cycle from which this flit may compete in switch allocation at
    /// the router currently holding it.
    pub sa_ready: Cycle,
    pub payload: Payload,
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub id: u64,
    /// Source node.
    pub src: usize,
    /// Destination node.
    pub dest: usize,
    pub vnet: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// When the packet entered its source queue.
    pub enqueue_cycle: Cycle,
    pub payload: Payload,
}

impl Packet {
    /// A packet with an all-zero payload of `size` bytes.
    pub fn new(
        id: u64,
        src: usize,
        dest: usize,
        vnet: usize,
        size: usize,
        enqueue_cycle: Cycle,
    ) -> Self {
        Self {
            id,
            src,
            dest,
            vnet,
            size,
            enqueue_cycle,
            payload: bitvec![usize, Lsb0; 0; size * 8].into_boxed_bitslice(),
        }
    }

    pub fn with_payload(
        id: u64,
        src: usize,
        dest: usize,
        vnet: usize,
        enqueue_cycle: Cycle,
        payload: Payload,
    ) -> Self {
        assert!(payload.len() % 8 == 0, "payloads are whole bytes");
        Self {
            id,
            src,
            dest,
            vnet,
            size: payload.len() / 8,
            enqueue_cycle,
            payload,
        }
    }

    pub fn num_flits(&self, flit_size: usize) -> usize {
        div_ceil(self.size, flit_size).max(1)
    }

    /// Segment the packet into flits of `flit_size` bytes. The last
    /// flit is zero-padded up to the flit size.
    pub fn flitisize(&self, flit_size: usize, dest_router: usize) -> Vec<Flit> {
        let count = self.num_flits(flit_size);
        let bits = flit_size * 8;
        let mut flits = Vec::with_capacity(count);
        for index in 0..count {
            let kind = match (count, index) {
                (1, _) => FlitType::HeadTail,
                (_, 0) => FlitType::Head,
                (n, i) if i == n - 1 => FlitType::Tail,
                _ => FlitType::Body,
            };
            let lo = index * bits;
            let hi = ((index + 1) * bits).min(self.payload.len());
            let mut chunk = bitvec![usize, Lsb0; 0; bits];
            chunk[..hi - lo].copy_from_bitslice(&self.payload[lo..hi]);
            flits.push(Flit {
                packet: self.id,
                kind,
                index,
                vnet: self.vnet,
                vc: 0,
                route: RouteInfo::new(self.src, self.dest, dest_router),
                enqueue_cycle: self.enqueue_cycle,
                inject_cycle: 0,
                sa_ready: 0,
                payload: chunk.into_boxed_bitslice(),
            });
        }
        flits
    }

    /// Rebuild a packet from the flits of one VC, in arrival order.
    pub fn from_flits(flits: &[Flit], size: usize) -> Self {
        assert!(!flits.is_empty());
        assert!(flits[0].kind.is_head() && flits[flits.len() - 1].kind.is_tail());
        let head = &flits[0];
        let mut payload = bitvec![usize, Lsb0; 0; size * 8];
        let bits = flits[0].payload.len();
        for (index, flit) in flits.iter().enumerate() {
            assert_eq!(flit.index, index);
            let lo = index * bits;
            let hi = ((index + 1) * bits).min(payload.len());
            payload[lo..hi].copy_from_bitslice(&flit.payload[..hi - lo]);
        }
        Self {
            id: head.packet,
            src: head.route.src,
            dest: head.route.dest,
            vnet: head.vnet,
            size,
            enqueue_cycle: head.enqueue_cycle,
            payload: payload.into_boxed_bitslice(),
        }
    }
}

#[cfg(test)]
mod flit_tests {
    use super::*;

    #[test]
    fn single_flit_packets() {
        let packet = Packet::new(7, 0, 3, 2, 16, 100);
        let flits = packet.flitisize(16, 3);
        assert_eq!(flits.len(), 1);
        assert_eq!(flits[0].kind, FlitType::HeadTail);
        assert!(flits[0].kind.is_head() && flits[0].kind.is_tail());
        assert_eq!(flits[0].vnet, 2);
        assert_eq!(flits[0].route.dest_router, 3);
        assert_eq!(flits[0].enqueue_cycle, 100);
    }

    #[test]
    fn segmentation_rounds_up() {
        let packet = Packet::new(1, 0, 1, 0, 72, 0);
        assert_eq!(packet.num_flits(16), 5);
        let flits = packet.flitisize(16, 1);
        assert_eq!(flits.len(), 5);
        assert_eq!(flits[0].kind, FlitType::Head);
        assert_eq!(flits[4].kind, FlitType::Tail);
        for flit in &flits[1..4] {
            assert_eq!(flit.kind, FlitType::Body);
        }
        // All flits carry the full flit size, padding included.
        for flit in &flits {
            assert_eq!(flit.payload.len(), 16 * 8);
        }
    }

    #[test]
    fn payload_survives_the_round_trip() {
        let mut payload = bitvec![usize, Lsb0; 0; 40 * 8];
        for i in (0..payload.len()).step_by(3) {
            payload.set(i, true);
        }
        let packet =
            Packet::with_payload(9, 2, 5, 1, 17, payload.clone().into_boxed_bitslice());
        let flits = packet.flitisize(16, 5);
        assert_eq!(flits.len(), 3);
        let rebuilt = Packet::from_flits(&flits, packet.size);
        assert_eq!(rebuilt.id, 9);
        assert_eq!(rebuilt.src, 2);
        assert_eq!(rebuilt.dest, 5);
        assert_eq!(rebuilt.size, 40);
        assert_eq!(rebuilt.payload, payload.into_boxed_bitslice());
    }
}
