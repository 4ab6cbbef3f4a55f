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

//! Latency/throughput sweep: one simulation per injection rate, one
//! trace record appended per point.
//!
//! A point that deadlocks or saturates past recovery is recorded as a
//! skip marker so the sweep keeps going and downstream analysis can
//! still plot the curve up to saturation.

use anyhow::Context;
use log::{info, warn};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use structopt::StructOpt;

use noc::{Network, Record, SweepConfig, TrafficGenerator};

#[derive(Debug, StructOpt)]
#[structopt(name = "sweep", about = "Sweep injection rates over a network config.")]
struct Opt {
    /// Sweep configuration (YAML).
    #[structopt(parse(from_os_str))]
    config: PathBuf,

    /// Trace file records are appended to.
    #[structopt(short, long, parse(from_os_str), default_value = "sweep.trace")]
    output: PathBuf,
}

fn measure(sweep: &SweepConfig, rate: f64) -> anyhow::Result<Record> {
    let mut network = Network::new(&sweep.network)?;
    let mut traffic_config = sweep.traffic.clone();
    traffic_config.injection_rate = rate;
    let mut traffic = TrafficGenerator::new(&traffic_config, &sweep.network)?;

    if let Err(err) = network.run(&mut traffic, sweep.warmup_cycles) {
        warn!("rate {}: {} during warmup", rate, err);
        return Ok(Record::skip(rate, network.stats().packets_injected()));
    }
    network.reset_stats();
    if let Err(err) = network.run(&mut traffic, sweep.sample_cycles) {
        warn!("rate {}: {} during sampling", rate, err);
        return Ok(Record::skip(rate, network.stats().packets_injected()));
    }
    Ok(network.record(rate, sweep.sample_cycles))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let config_path = opt
        .config
        .to_str()
        .context("config path is not valid UTF-8")?;
    let sweep = SweepConfig::from_file(config_path);
    sweep.validate()?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&opt.output)
        .with_context(|| format!("cannot open trace file {:?}", opt.output))?;
    let mut writer = BufWriter::new(file);

    for rate in sweep.rates() {
        let record = measure(&sweep, rate)?;
        if record.is_skip() {
            info!("rate {}: skipped", rate);
        } else {
            info!(
                "rate {}: received {} packets, avg latency {:.3}",
                rate, record.packets_received, record.avg_latency
            );
        }
        record.write_to(&mut writer)?;
    }
    writer.flush()?;
    Ok(())
}
