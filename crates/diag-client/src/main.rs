//! obd-diag - command line client for the OBD diagnostic core

use anyhow::Context;
use clap::{Parser, Subcommand};
use diag_client::{
    ApiClient, ClientError, DispatchEvent, DispatchHandle, Dispatcher, ExplainReply, Readings,
    DEFAULT_BASE_URL,
};
use serde::Serialize;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "obd-diag", version, about = "Talk to a running obd-core server")]
struct Cli {
    /// Base URL of the server
    #[arg(long, env = "OBD_DIAG_URL", default_value = DEFAULT_BASE_URL)]
    url: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the vehicle
    Connect,
    /// Stop polling and release the vehicle
    Disconnect,
    /// Detected trouble codes
    Dtc,
    /// Freeze-frame readings
    Freeze,
    /// Clear stored trouble codes
    Clear,
    /// Live polling control
    Live {
        #[command(subcommand)]
        action: LiveAction,
    },
    /// Start polling and print live readings until interrupted
    Watch {
        /// Seconds between refreshes
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Stop after this many refreshes
        #[arg(long)]
        count: Option<u64>,
        /// Explain this trouble code in the background while watching
        #[arg(long)]
        explain: Option<String>,
    },
    /// Ask the explanation service about a trouble code
    Explain { code: String },
    /// Check that the server is up
    Ping,
}

#[derive(Subcommand, Debug)]
enum LiveAction {
    Start,
    Stop,
    Data,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = Duration::try_from_secs_f64(cli.timeout).context("invalid --timeout")?;
    let client = ApiClient::new(&cli.url)?.with_timeout(timeout);

    match cli.command {
        Command::Connect => print_json(&client.connect().await?),
        Command::Disconnect => print_json(&client.disconnect().await?),
        Command::Dtc => {
            let faults = client.dtc().await?;
            if faults.is_empty() {
                println!("No trouble codes detected");
            }
            for fault in faults {
                println!("{}  {}", fault.code(), fault.description());
            }
            Ok(())
        }
        Command::Freeze => print_readings(&client.freeze().await?),
        Command::Clear => {
            println!("{}", client.clear().await?.result);
            Ok(())
        }
        Command::Live { action } => match action {
            LiveAction::Start => print_json(&client.start_live().await?),
            LiveAction::Stop => print_json(&client.stop_live().await?),
            LiveAction::Data => print_readings(&client.live_data().await?),
        },
        Command::Watch {
            interval,
            count,
            explain,
        } => {
            let interval = Duration::try_from_secs_f64(interval).context("invalid --interval")?;
            watch(client, interval, count, explain).await
        }
        Command::Explain { code } => print_explanation(&client.explain(&code).await?),
        Command::Ping => {
            let ok = client.ping().await?;
            println!("{}", if ok { "ok" } else { "unhealthy" });
            Ok(())
        }
    }
}

/// Poll live data until Ctrl-C or `count` refreshes, printing an optional
/// explanation whenever it arrives
async fn watch(
    client: ApiClient,
    interval: Duration,
    count: Option<u64>,
    explain: Option<String>,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::current().context("no async runtime")?;
    let started = client.start_live().await?;
    println!("Live polling {}", started.status);

    let mut pending: Option<DispatchHandle<ExplainReply, ClientError>> = explain.map(|code| {
        let client = client.clone();
        dispatcher.dispatch(async move { client.explain(&code).await })
    });

    let mut ticker = tokio::time::interval(interval);
    let mut refreshes = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        match client.live_data().await {
            Ok(readings) if readings.is_empty() => println!("Waiting for live data..."),
            Ok(readings) => print_readings(&readings)?,
            Err(e) => warn!("Live data fetch failed: {}", e),
        }

        if let Some(handle) = pending.as_mut() {
            if drain_explanation(handle)? {
                pending = None;
            }
        }

        refreshes += 1;
        if count.is_some_and(|n| refreshes >= n) {
            break;
        }
    }

    client.stop_live().await?;
    println!("Live polling stopped");
    Ok(())
}

/// Print whatever the explanation task delivered; true once it finished
fn drain_explanation(
    handle: &mut DispatchHandle<ExplainReply, ClientError>,
) -> anyhow::Result<bool> {
    while let Some(event) = handle.try_recv() {
        match event {
            DispatchEvent::Result(reply) => print_explanation(&reply)?,
            DispatchEvent::Error(e) => eprintln!("Explanation failed: {}", e),
            DispatchEvent::Finished => return Ok(true),
        }
    }
    Ok(false)
}

fn print_readings(readings: &Readings) -> anyhow::Result<()> {
    let width = readings.keys().map(String::len).max().unwrap_or(0);
    for (sensor, value) in readings {
        println!("{:<width$}  {}", sensor, value, width = width);
    }
    println!();
    Ok(())
}

fn print_explanation(reply: &ExplainReply) -> anyhow::Result<()> {
    println!("{}", reply.code);
    print_json(&reply.result)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
