#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use gatehouse_proto::constants::DEFAULT_SERVER_CONFIG_PATH;
use gatehoused_core::config::{Configuration, LogLevel, ServerConfig};
use gatehoused_core::create_server_core;
use sketching::tracing_forest::traits::*;
use sketching::tracing_forest::util::*;
use sketching::tracing_forest::{self};
use tracing::{error, info};

include!("./opt.rs");

async fn wait_for_shutdown_signal() {
    #[cfg(target_family = "unix")]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(?e, "Unable to listen for SIGTERM, only ctrl-c will stop the server");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {}
            Some(()) = sigterm.recv() => {}
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    // Read CLI args, determine what the user has asked us to do.
    let opt = GatehousedParser::parse();

    // print the app version and bail
    if let GatehousedOpt::Version(_) = &opt.commands {
        println!("gatehoused {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    };

    let cfg_path = opt
        .commands
        .commonopt()
        .config_path
        .clone()
        .or_else(|| PathBuf::from_str(DEFAULT_SERVER_CONFIG_PATH).ok());

    let Some(cfg_path) = cfg_path else {
        eprintln!("Unable to start - can not locate any configuration file");
        return ExitCode::FAILURE;
    };

    if !cfg_path.exists() {
        eprintln!(
            "Refusing to run - config file {} does not exist",
            cfg_path.to_str().unwrap_or("<invalid filename>")
        );
        return ExitCode::FAILURE;
    }

    let sconfig = match ServerConfig::new(&cfg_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config Parse failure {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    // We only allow config file for log level now.
    let log_filter: EnvFilter = sconfig.log_level.unwrap_or(LogLevel::Info).into();
    let config = Configuration::from(sconfig);

    tracing_forest::worker_task()
        .set_global(true)
        .set_tag(sketching::event_tagger)
        // Fall back to stderr
        .map_sender(|sender| sender.or_stderr())
        .build_on(|subscriber| subscriber.with(log_filter))
        .on(async {
            match &opt.commands {
                GatehousedOpt::Server(_) | GatehousedOpt::ConfigTest(_) => {
                    let config_test = matches!(&opt.commands, GatehousedOpt::ConfigTest(_));
                    if config_test {
                        info!("Running in server configuration test mode ...");
                    } else {
                        info!("Running in server mode ...");
                    };

                    let sctx = create_server_core(config, config_test).await;
                    match sctx {
                        Ok(mut sctx) => {
                            if !config_test {
                                wait_for_shutdown_signal().await;
                                info!("Signal received, shutting down");
                                // Send a broadcast that we are done.
                                sctx.shutdown().await;
                            }
                        }
                        Err(_) => {
                            error!("Failed to start server core!");
                            return ExitCode::FAILURE;
                        }
                    }
                    info!("Stopped 🛑 ");
                }
                GatehousedOpt::Version(_) => {}
            }
            ExitCode::SUCCESS
        })
        .await
}
