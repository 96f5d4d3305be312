// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tokio::runtime;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetrc::config::{Discovery, DEFAULT_PATTERN};
use fleetrc::procs::{Launcher, Supervisor, WriterSink};
use fleetrc::Error;

const RUN: &str = "run";
const CHECK: &str = "check";

const LOG: &str = "log";
const CONFIG_DIR: &str = "config-dir";
const PATTERN: &str = "pattern";
const REQUIRE: &str = "require";
const WORKER: &str = "worker";
const WORKER_ARGS: &str = "worker-args";
const ENV: &str = "env";
const DRAIN_GRACE: &str = "drain-grace";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn discovery_opts(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn discovery_opts(self) -> Self {
        self.arg(
            Arg::with_name(CONFIG_DIR)
                .short("d")
                .long(CONFIG_DIR)
                .value_name("DIR")
                .help("Directory of worker configuration files, may be repeated")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .env("FLEET_CONFIG_DIR")
                .default_value("configs"),
        )
        .arg(
            Arg::with_name(PATTERN)
                .short("p")
                .long(PATTERN)
                .value_name("GLOB")
                .help("File name pattern of configuration files")
                .takes_value(true)
                .env("FLEET_PATTERN")
                .default_value(DEFAULT_PATTERN),
        )
        .arg(
            Arg::with_name(REQUIRE)
                .short("r")
                .long(REQUIRE)
                .value_name("KEY")
                .help("Key every configuration file must define, may be repeated")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
    }
}

fn main() {
    let args = App::new("fleet")
        .setup_clap_app()
        .about("Runs one bot per configuration file, merging their output")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name(LOG)
                .long(LOG)
                .value_name("FILTER")
                .help("Log filter for supervisor messages")
                .takes_value(true)
                .env("FLEET_LOG")
                .default_value("info"),
        )
        .subcommand(
            SubCommand::with_name(RUN)
                .about("Launch every configured bot and supervise them")
                .setup_clap_app()
                .discovery_opts()
                .arg(
                    Arg::with_name(WORKER)
                        .short("w")
                        .long(WORKER)
                        .value_name("PROGRAM")
                        .help("Program to run for each configuration file")
                        .takes_value(true)
                        .env("FLEET_WORKER")
                        .required(true),
                )
                .arg(
                    Arg::with_name(ENV)
                        .short("e")
                        .long(ENV)
                        .value_name("KEY=VALUE")
                        .help("Extra environment for every bot, may be repeated")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .validator(|v| {
                            if v.find('=').map_or(false, |i| i > 0) {
                                Ok(())
                            } else {
                                Err(format!("expected KEY=VALUE, got: {}", v))
                            }
                        }),
                )
                .arg(
                    Arg::with_name(DRAIN_GRACE)
                        .long(DRAIN_GRACE)
                        .value_name("SECS")
                        .help("How long to keep reading a bot's output after it exited")
                        .takes_value(true)
                        .default_value("5")
                        .validator(|v| {
                            v.parse::<u64>()
                                .map(|_| ())
                                .map_err(|e| format!("{}: {}", v, e))
                        }),
                )
                .arg(
                    Arg::with_name(WORKER_ARGS)
                        .help("Arguments passed to the program before the config path")
                        .multiple(true)
                        .last(true),
                ),
        )
        .subcommand(
            SubCommand::with_name(CHECK)
                .about("Validate every configuration file without launching anything")
                .setup_clap_app()
                .discovery_opts(),
        )
        .get_matches();

    init_logging(args.value_of(LOG).unwrap_or("info"));

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to initialize Tokio Runtime");

    let result = runtime.block_on(async move {
        match args.subcommand() {
            (RUN, Some(args)) => run(args).await,
            (CHECK, Some(args)) => check(args),
            (arg, _) => Err(Error::from(format!("unexpected command: {}", arg))),
        }
    });

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn discovery(args: &ArgMatches<'_>) -> Result<Discovery, Error> {
    let dirs = args
        .values_of_os(CONFIG_DIR)
        .map(|dirs| dirs.collect::<Vec<_>>())
        .unwrap_or_default();
    let pattern = args.value_of(PATTERN).unwrap_or(DEFAULT_PATTERN);

    Discovery::new(dirs, pattern)
}

fn required_keys(args: &ArgMatches<'_>) -> Vec<String> {
    args.values_of(REQUIRE)
        .map(|keys| keys.map(str::to_string).collect())
        .unwrap_or_default()
}

fn launcher(args: &ArgMatches<'_>) -> Result<Launcher, Error> {
    let program = args
        .value_of_os(WORKER)
        .ok_or("a worker program is required")?;

    let mut launcher = Launcher::new(program);
    if let Some(worker_args) = args.values_of_os(WORKER_ARGS) {
        launcher = launcher.args(worker_args);
    }

    for pair in args.values_of(ENV).into_iter().flatten() {
        let mut split = pair.splitn(2, '=');
        match (split.next(), split.next()) {
            (Some(key), Some(value)) => launcher = launcher.env(key, value),
            _ => return Err(Error::from(format!("expected KEY=VALUE, got: {}", pair))),
        }
    }

    for key in required_keys(args) {
        launcher = launcher.require(key);
    }

    Ok(launcher)
}

async fn run(args: &ArgMatches<'_>) -> Result<(), Error> {
    let grace = args
        .value_of(DRAIN_GRACE)
        .unwrap_or("5")
        .parse::<u64>()
        .map_err(|e| Error::from(format!("invalid {}: {}", DRAIN_GRACE, e)))?;

    // installed before any worker exists so no launch happens without a handler
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let mut supervisor = Supervisor::new(
        discovery(args)?,
        launcher(args)?,
        Arc::new(WriterSink::stdout()),
    )
    .with_drain_grace(Duration::from_secs(grace));

    // the supervisor only returns on a discovery error, anything else ends with a signal
    let received = tokio::select! {
        held = supervise(&mut supervisor) => match held? {},
        name = shutdown_signal(&mut terminate, &mut interrupt) => name,
    };

    info!("Received {}, stopping bots", received);
    supervisor.shutdown().await;

    Ok(())
}

async fn supervise(supervisor: &mut Supervisor) -> Result<Infallible, Error> {
    supervisor.run().await?;
    Ok(supervisor.hold().await)
}

async fn shutdown_signal(terminate: &mut Signal, interrupt: &mut Signal) -> &'static str {
    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    }
}

fn check(args: &ArgMatches<'_>) -> Result<(), Error> {
    let discovery = discovery(args)?;
    let required = required_keys(args);
    let units = discovery.discover()?;

    if units.is_empty() {
        println!("no configuration files found");
        return Ok(());
    }

    let mut failed = 0;
    for unit in &units {
        match unit.load_checked(&required) {
            Ok(config) => println!(
                "ok      {} ({})",
                unit.label(),
                config.keys().collect::<Vec<_>>().join(", ")
            ),
            Err(e) => {
                failed += 1;
                println!("failed  {}: {}", unit.label(), e);
            }
        }
    }

    if failed > 0 {
        return Err(Error::from(format!(
            "{} of {} configuration file(s) are invalid",
            failed,
            units.len()
        )));
    }

    Ok(())
}
