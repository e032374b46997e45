// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_m2m::{
    args::Args,
    pipeline::{self, PipelineConfig},
};
use std::{error::Error, process};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt as _, Layer as _, Registry};

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let stdout_log = tracing_subscriber::fmt::layer().with_filter(args.rust_log);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(args.rust_log)),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(args.rust_log))
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let json = args.json;
    let config = PipelineConfig::from(args);
    info!(
        "{} -> {} on {:?}, {} frames",
        config.transform.source.format,
        config.transform.destination.format,
        config.device,
        config.frames
    );

    match pipeline::run(&config) {
        Ok(report) if json => println!("{}", report.to_json()),
        Ok(report) => println!("{report}"),
        Err(e) => {
            error!("{}", e);
            process::exit(e.exit_code());
        }
    }
    Ok(())
}
