/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::Path;

use anyhow::Result;
use clap::{ArgAction, Parser};
use log::warn;
use signal_hook::{
    consts::{SIGHUP, TERM_SIGNALS},
    iterator::Signals,
};

use ::vrouter_agent::*;

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = common::DEFAULT_CONF_FILE)]
    config_file: String,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,
}

// Blocks until a termination signal, SIGHUP reloads the config file
fn wait_on_signals(agent: &agent::Agent) -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS.iter().chain(&[SIGHUP]))?;
    for signal in signals.forever() {
        if signal == SIGHUP {
            agent.reload();
            continue;
        }
        break;
    }
    signals.handle().close();
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.version {
        println!("vrouter-agent {}", agent::VERSION);
        return Ok(());
    }
    let mut agent = agent::Agent::start(&Path::new(&opts.config_file))?;
    if let Err(e) = wait_on_signals(&agent) {
        warn!("signal handling failed: {}", e);
    }
    agent.stop();

    Ok(())
}
