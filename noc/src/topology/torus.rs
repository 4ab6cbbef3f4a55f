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

use num::integer::div_rem;

use super::{IntLink, PortDirection, LINK_WEIGHT};
use crate::Cycle;

/// Internal channels of a k-ary n-cube.
///
/// Every router emits, per dimension, one channel out of its lower port
/// to the neighbor one step down (wrapping through the top of the ring);
/// with bidirectional rings the reverse channel is created immediately
/// after, so the two directions of one hop hold adjacent link ids.
pub(super) fn links(
    ary: usize,
    dim: usize,
    bidirectional: bool,
    first_id: usize,
    latency: Cycle,
) -> Vec<IntLink> {
    let num_routers = ary.pow(dim as u32);
    let mut links = Vec::with_capacity(num_routers * dim * if bidirectional { 2 } else { 1 });
    for router in 0..num_routers {
        let mut remainder = router;
        for d in 0..dim {
            let (rest, digit) = div_rem(remainder, ary);
            remainder = rest;
            let stride = ary.pow(d as u32);
            let neighbor = if digit == 0 {
                router + stride * (ary - 1)
            } else {
                router - stride
            };
            links.push(IntLink {
                id: first_id + links.len(),
                src_router: router,
                dst_router: neighbor,
                src_outport: PortDirection::Lower(d),
                dst_inport: PortDirection::Upper(d),
                latency,
                weight: LINK_WEIGHT,
            });
            if bidirectional {
                links.push(IntLink {
                    id: first_id + links.len(),
                    src_router: neighbor,
                    dst_router: router,
                    src_outport: PortDirection::Upper(d),
                    dst_inport: PortDirection::Lower(d),
                    latency,
                    weight: LINK_WEIGHT,
                });
            }
        }
    }
    links
}
