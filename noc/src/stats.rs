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

//! Per-vnet counters and the sweep trace format.
//!
//! A sweep appends one record per injection-rate point: ten numeric
//! lines in a fixed order, consumed by external analysis tooling. The
//! three latency lines are pre-scaled by a fixed 50-cycle window; a
//! point that received nothing writes a negative `packets_received` as
//! a skip marker instead of dividing by zero.

use std::io::{self, BufRead, Write};

use crate::Cycle;
use crate::Error;

/// Fixed window the latency fields are divided by.
pub const LATENCY_SCALE: f64 = 50.0;

/// Lines per trace record.
pub const RECORD_LINES: usize = 10;

#[derive(Clone, Debug, Default)]
struct VnetStats {
    packets_injected: u64,
    packets_received: u64,
    flits_injected: u64,
    flits_received: u64,
    queueing_latency: u64,
    network_latency: u64,
    hops: u64,
    reversals: u64,
    misroutes: u64,
}

/// Accumulates traffic counters over one sample window.
pub struct StatsRecorder {
    endpoints: usize,
    vnets: Vec<VnetStats>,
}

impl StatsRecorder {
    pub fn new(num_vnets: usize, endpoints: usize) -> Self {
        assert!(endpoints > 0);
        Self {
            endpoints,
            vnets: vec![VnetStats::default(); num_vnets],
        }
    }

    /// Forget everything; called between warmup and sampling and
    /// between injection-rate points.
    pub fn reset(&mut self) {
        for vnet in &mut self.vnets {
            *vnet = VnetStats::default();
        }
    }

    pub fn packet_injected(&mut self, vnet: usize, flits: usize) {
        self.vnets[vnet].packets_injected += 1;
        self.vnets[vnet].flits_injected += flits as u64;
    }

    /// One flit reached its destination node.
    pub fn flit_received(
        &mut self,
        vnet: usize,
        queueing_latency: Cycle,
        network_latency: Cycle,
        hops: u32,
        reversals: u32,
        misroutes: u32,
    ) {
        let stats = &mut self.vnets[vnet];
        stats.flits_received += 1;
        stats.queueing_latency += queueing_latency as u64;
        stats.network_latency += network_latency as u64;
        stats.hops += u64::from(hops);
        stats.reversals += u64::from(reversals);
        stats.misroutes += u64::from(misroutes);
    }

    /// The tail flit arrived; the whole packet is accounted received.
    pub fn packet_received(&mut self, vnet: usize) {
        self.vnets[vnet].packets_received += 1;
    }

    pub fn packets_injected(&self) -> u64 {
        self.vnets.iter().map(|v| v.packets_injected).sum()
    }

    pub fn packets_received(&self) -> u64 {
        self.vnets.iter().map(|v| v.packets_received).sum()
    }

    /// Fold the window into one trace record. A window with no
    /// received packets yields the skip marker.
    pub fn record(&self, injection_rate: f64, sample_cycles: Cycle) -> Record {
        assert!(sample_cycles > 0);
        let injected = self.packets_injected();
        let received = self.packets_received();
        if received == 0 {
            return Record::skip(injection_rate, injected);
        }
        let flits = self.vnets.iter().map(|v| v.flits_received).sum::<u64>() as f64;
        let queueing = self.vnets.iter().map(|v| v.queueing_latency).sum::<u64>() as f64;
        let network = self.vnets.iter().map(|v| v.network_latency).sum::<u64>() as f64;
        let avg_queue_latency = queueing / flits / LATENCY_SCALE;
        let avg_network_latency = network / flits / LATENCY_SCALE;
        Record {
            injection_rate,
            packets_injected: injected as f64,
            packets_received: received as f64,
            avg_queue_latency,
            avg_network_latency,
            avg_latency: avg_queue_latency + avg_network_latency,
            avg_hops: self.vnets.iter().map(|v| v.hops).sum::<u64>() as f64 / flits,
            avg_dimension_reversals: self.vnets.iter().map(|v| v.reversals).sum::<u64>() as f64
                / flits,
            avg_misrouting_count: self.vnets.iter().map(|v| v.misroutes).sum::<u64>() as f64
                / flits,
            reception_rate: received as f64 / self.endpoints as f64 / sample_cycles as f64,
        }
    }
}

/// One measurement point of a sweep trace, in file line order.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub injection_rate: f64,
    pub packets_injected: f64,
    pub packets_received: f64,
    pub avg_queue_latency: f64,
    pub avg_network_latency: f64,
    pub avg_latency: f64,
    pub avg_hops: f64,
    pub avg_dimension_reversals: f64,
    pub avg_misrouting_count: f64,
    pub reception_rate: f64,
}

impl Record {
    /// Marker for a point whose sample received nothing.
    pub fn skip(injection_rate: f64, packets_injected: u64) -> Self {
        Self {
            injection_rate,
            packets_injected: packets_injected as f64,
            packets_received: -1.0,
            avg_queue_latency: 0.0,
            avg_network_latency: 0.0,
            avg_latency: 0.0,
            avg_hops: 0.0,
            avg_dimension_reversals: 0.0,
            avg_misrouting_count: 0.0,
            reception_rate: 0.0,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.packets_received < 0.0
    }

    fn fields(&self) -> [f64; RECORD_LINES] {
        [
            self.injection_rate,
            self.packets_injected,
            self.packets_received,
            self.avg_queue_latency,
            self.avg_network_latency,
            self.avg_latency,
            self.avg_hops,
            self.avg_dimension_reversals,
            self.avg_misrouting_count,
            self.reception_rate,
        ]
    }

    fn from_fields(fields: [f64; RECORD_LINES]) -> Self {
        Self {
            injection_rate: fields[0],
            packets_injected: fields[1],
            packets_received: fields[2],
            avg_queue_latency: fields[3],
            avg_network_latency: fields[4],
            avg_latency: fields[5],
            avg_hops: fields[6],
            avg_dimension_reversals: fields[7],
            avg_misrouting_count: fields[8],
            reception_rate: fields[9],
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for field in self.fields() {
            writeln!(writer, "{}", field)?;
        }
        Ok(())
    }
}

/// Iterator over every record of a trace, skip markers included.
pub struct Records<R> {
    lines: io::Lines<R>,
}

impl<R: BufRead> Records<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut fields = [0.0; RECORD_LINES];
        for (index, field) in fields.iter_mut().enumerate() {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(err)) => return Some(Err(err.into())),
                None if index == 0 => return None,
                None => {
                    return Some(Err(Error::MalformedRecord(format!(
                        "truncated record: {} of {} lines",
                        index, RECORD_LINES
                    ))))
                }
            };
            *field = match line.trim().parse() {
                Ok(value) => value,
                Err(_) => {
                    return Some(Err(Error::MalformedRecord(format!(
                        "not a number: {:?}",
                        line
                    ))))
                }
            };
        }
        Some(Ok(Record::from_fields(fields)))
    }
}

/// Records of a trace with the skip markers filtered out.
pub fn valid_records<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Record, Error>> {
    Records::new(reader).filter(|record| match record {
        Ok(record) => !record.is_skip(),
        Err(_) => true,
    })
}

#[cfg(test)]
mod stats_tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn averages_per_received_flit() {
        let mut stats = StatsRecorder::new(3, 16);
        stats.packet_injected(2, 1);
        stats.packet_injected(2, 1);
        stats.flit_received(2, 100, 50, 4, 1, 0);
        stats.packet_received(2);
        stats.flit_received(2, 200, 150, 6, 1, 2);
        stats.packet_received(2);
        let record = stats.record(0.1, 1000);
        assert!(!record.is_skip());
        assert_eq!(record.packets_injected, 2.0);
        assert_eq!(record.packets_received, 2.0);
        // (100 + 200) / 2 flits / 50-cycle window.
        assert_eq!(record.avg_queue_latency, 3.0);
        assert_eq!(record.avg_network_latency, 2.0);
        assert_eq!(record.avg_latency, 5.0);
        assert_eq!(record.avg_hops, 5.0);
        assert_eq!(record.avg_dimension_reversals, 1.0);
        assert_eq!(record.avg_misrouting_count, 1.0);
        assert_eq!(record.reception_rate, 2.0 / 16.0 / 1000.0);
    }

    #[test]
    fn empty_window_writes_the_skip_marker() {
        let mut stats = StatsRecorder::new(3, 16);
        stats.packet_injected(0, 1);
        let record = stats.record(0.5, 1000);
        assert!(record.is_skip());
        assert_eq!(record.packets_injected, 1.0);
        stats.reset();
        assert_eq!(stats.packets_injected(), 0);
    }

    #[test]
    fn records_survive_the_trace_file() {
        let mut stats = StatsRecorder::new(1, 4);
        stats.packet_injected(0, 2);
        stats.flit_received(0, 10, 40, 3, 0, 0);
        stats.flit_received(0, 10, 40, 3, 0, 0);
        stats.packet_received(0);
        let written = stats.record(0.25, 500);

        let mut buffer = Vec::new();
        written.write_to(&mut buffer).unwrap();
        Record::skip(0.5, 7).write_to(&mut buffer).unwrap();
        assert_eq!(buffer.iter().filter(|b| **b == b'\n').count(), 20);

        let all = Records::new(Cursor::new(&buffer))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], written);
        assert!(all[1].is_skip());

        let valid = valid_records(Cursor::new(&buffer))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(valid, vec![written]);
    }

    #[test]
    fn malformed_traces_are_rejected() {
        let truncated = "0.1\n5\n5\n";
        let result = Records::new(Cursor::new(truncated)).next().unwrap();
        assert!(matches!(result, Err(Error::MalformedRecord(_))));

        let garbage = "0.1\n5\nfive\n0\n0\n0\n0\n0\n0\n0\n";
        let result = Records::new(Cursor::new(garbage)).next().unwrap();
        assert!(matches!(result, Err(Error::MalformedRecord(_))));

        assert!(Records::new(Cursor::new("")).next().is_none());
    }
}
