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

//! Stall detection over input VCs.
//!
//! A VC that holds flits but forwards none accrues one stalled cycle;
//! any forward progress clears it. Crossing the configured threshold is
//! reported as a deadlock, aborting the run rather than letting a
//! livelocked configuration spin forever.

use log::warn;
use std::collections::HashMap;

use crate::Cycle;
use crate::Error;

pub struct DeadlockMonitor {
    threshold: Cycle,
    /// Consecutive stalled cycles per (router, inport, vc).
    stalled: HashMap<(usize, usize, usize), Cycle>,
}

impl DeadlockMonitor {
    pub fn new(threshold: Cycle) -> Self {
        assert!(threshold > 0);
        Self {
            threshold,
            stalled: HashMap::new(),
        }
    }

    /// Account one router's cycle: `occupied` lists the VCs holding
    /// flits, `forwarded` the VCs that sent one this cycle.
    pub fn observe(
        &mut self,
        router: usize,
        occupied: &[(usize, usize)],
        forwarded: &[(usize, usize)],
    ) -> Result<(), Error> {
        for &(inport, vc) in occupied {
            if forwarded.contains(&(inport, vc)) {
                self.stalled.remove(&(router, inport, vc));
                continue;
            }
            let cycles = self.stalled.entry((router, inport, vc)).or_insert(0);
            *cycles += 1;
            if *cycles >= self.threshold {
                return Err(Error::Deadlock {
                    router,
                    inport,
                    vc,
                    stalled: *cycles,
                });
            }
            if *cycles == self.threshold / 2 {
                warn!(
                    "router {} inport {} vc {} stalled for {} cycles",
                    router, inport, vc, cycles
                );
            }
        }
        // Drained VCs stop counting.
        self.stalled
            .retain(|&(r, inport, vc), _| r != router || occupied.contains(&(inport, vc)));
        Ok(())
    }

    /// Longest current stall, for progress reporting.
    pub fn max_stall(&self) -> Cycle {
        self.stalled.values().copied().max().unwrap_or(0)
    }
}
