// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use slog::{error, info};
use tokio_util::sync::CancellationToken;

use snapshot_controller_config::Config;

const NAME: &str = "snapshot-controller";

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Reconciles KubeVirt VirtualMachineSnapshots and VirtualMachineRestores
struct Args {
    /// Path to a TOML configuration file. Defaults apply without one.
    #[clap(long, action)]
    config: Option<PathBuf>,

    /// Logging level for the controller. Overrides the configuration file.
    #[clap(long, value_parser = parse_log_level)]
    log_level: Option<slog::Level>,
}

/// Wraps `drain` so records are written off the reconcile path.
fn async_drain<D>(drain: D) -> slog_async::Async
where
    D: slog::Drain<Err = slog::Never, Ok = ()> + Send + 'static,
{
    slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build_no_guard()
}

/// Terminal output when attached to one, bunyan JSON otherwise. Every
/// record also goes to the slog-dtrace probes, unfiltered.
fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let output = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        async_drain(slog_term::CompactFormat::new(decorator).build().fuse())
    } else {
        async_drain(
            slog_bunyan::with_name(NAME, std::io::stdout()).build().fuse(),
        )
    };
    let (dtrace, registration) = slog_dtrace::Dtrace::new();

    let drain = slog::Duplicate::new(
        output.filter_level(level).fuse(),
        dtrace.fuse(),
    );
    let log = slog::Logger::root(
        drain.fuse(),
        slog::o!("component" => NAME, "version" => env!("CARGO_PKG_VERSION")),
    );

    if let slog_dtrace::ProbeRegistration::Failed(e) = registration {
        error!(log, "failed to register dtrace probes"; "error" => e);
    }
    log
}

/// Picks the log level: the command line wins over the config file.
fn log_level(args: &Args, config: &Config) -> anyhow::Result<slog::Level> {
    match (args.log_level, config.log_level.as_deref()) {
        (Some(level), _) => Ok(level),
        (None, Some(s)) => parse_log_level(s).context("config log-level"),
        (None, None) => Ok(slog::Level::Info),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => snapshot_controller_config::parse(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let log = build_logger(log_level(&args, &config)?);
    info!(log, "starting"; "config" => ?args.config);

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API server")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(log, "failed to wait for interrupt"; "error" => %e);
                return;
            }
            info!(log, "received interrupt, shutting down");
            cancel.cancel();
        });
    }

    snapshot_controller::run(client, &config, cancel, &log).await;
    Ok(())
}
