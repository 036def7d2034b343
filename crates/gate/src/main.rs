// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use kirogate::config::GateConfig;

#[tokio::main]
async fn main() {
    let config = GateConfig::parse();
    kirogate::init_tracing(&config);

    if let Err(e) = kirogate::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
