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

use super::{IntLink, PortDirection, LINK_WEIGHT};
use crate::Cycle;

/// Internal channels of a ring: the East port of router `i` feeds the
/// West inport of router `i + 1`, wrapping at the end; the West channels
/// run the other way around. All East channels are created before any
/// West channel, so their ids form two contiguous runs.
pub(super) fn links(num_routers: usize, first_id: usize, latency: Cycle) -> Vec<IntLink> {
    let mut links = Vec::with_capacity(2 * num_routers);
    for i in 0..num_routers {
        links.push(IntLink {
            id: first_id + links.len(),
            src_router: i,
            dst_router: (i + 1) % num_routers,
            src_outport: PortDirection::East,
            dst_inport: PortDirection::West,
            latency,
            weight: LINK_WEIGHT,
        });
    }
    for i in 0..num_routers {
        links.push(IntLink {
            id: first_id + links.len(),
            src_router: (i + 1) % num_routers,
            dst_router: i,
            src_outport: PortDirection::West,
            dst_inport: PortDirection::East,
            latency,
            weight: LINK_WEIGHT,
        });
    }
    links
}
