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

use std::fmt;

use crate::Cycle;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    InvalidTopology(String),
    InvalidConfig(String),
    InvalidRoutingAlgorithm(u32),
    InvalidPickAlgorithm(u32),
    InvalidTrafficPattern(String),
    InvalidVnet(usize),
    NoRoute { router: usize, dest: usize },
    ReversalLimit { router: usize, count: u32, limit: u32 },
    MisroutingLimit { router: usize, count: u32, limit: u32 },
    Deadlock { router: usize, inport: usize, vc: usize, stalled: Cycle },
    MalformedRecord(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidTopology(reason) => {
                write!(f, "ERROR: Invalid topology: {}", reason)
            }
            Self::InvalidConfig(reason) => {
                write!(f, "ERROR: Invalid configuration: {}", reason)
            }
            Self::InvalidRoutingAlgorithm(id) => {
                write!(f, "ERROR: Invalid routing algorithm selector {}", id)
            }
            Self::InvalidPickAlgorithm(id) => {
                write!(f, "ERROR: Invalid pick algorithm selector {}", id)
            }
            Self::InvalidTrafficPattern(name) => {
                write!(f, "ERROR: Invalid traffic pattern \"{}\"", name)
            }
            Self::NoRoute { router, dest } => {
                write!(
                    f,
                    "ERROR: No route from router {} to destination node {}",
                    router, dest
                )
            }
            Self::ReversalLimit {
                router,
                count,
                limit,
            } => {
                write!(
                    f,
                    "ERROR: Dimension reversal count {} exceeds limit {} at router {}",
                    count, limit, router
                )
            }
            Self::MisroutingLimit {
                router,
                count,
                limit,
            } => {
                write!(
                    f,
                    "ERROR: Misrouting count {} exceeds limit {} at router {}",
                    count, limit, router
                )
            }
            Self::Deadlock {
                router,
                inport,
                vc,
                stalled,
            } => {
                write!(
                    f,
                    "ERROR: Possible deadlock: router {} inport {} vc {} stalled for {} cycles",
                    router, inport, vc, stalled
                )
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
