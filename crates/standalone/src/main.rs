//! The `validana` binary.
//!
//! `validana start [config.json]` runs the master process, which forks one
//! worker per configured slot. Workers are the same binary started with
//! `VALIDANA_WORKER_ID` set by the master; nobody sets that variable by
//! hand.

mod supervisor;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{value_parser, Arg, Command};

fn cli() -> Command {
    Command::new("validana")
        .about("Client-facing gateway of the Validana blockchain platform")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("start")
                .about("Start the gateway (master process plus workers)")
                .arg(
                    Arg::new("config")
                        .value_name("CONFIG_FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON configuration file; VSERVER_* environment variables override it"),
                ),
        )
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("start", matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").cloned();
            match std::env::var(supervisor::WORKER_ENV) {
                Ok(id) => worker::main(config_path, &id),
                Err(_) => supervisor::main(config_path),
            }
        }
        _ => unreachable!("subcommand is required"),
    }
}
