use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vidcall_client::app::App;
use vidcall_client::call::{CallEvent, CallHandle};
use vidcall_client::cli::{CliCommand, HELP};
use vidcall_client::config::{AppConfig, ConfigOverrides, LoggingConfig};
use vidcall_signaling::transport::tokio::TokioTransport;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Peer-to-peer audio and video calls negotiated over a signaling relay")]
struct CliArgs {
    /// Endpoint id announced to the relay
    #[arg(short, long)]
    identity: Option<String>,

    /// WebSocket URL of the relay
    #[arg(short, long)]
    relay: Option<String>,

    /// Config file read after the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = AppConfig::parse(&ConfigOverrides {
        config_file: args.config,
        identity: args.identity,
        relay_url: args.relay,
    })?;
    init_tracing(&config.logging);

    tracing::trace!(?config, "Parsed config");

    let shutdown_token = CancellationToken::new();
    let transport = TokioTransport::new(&config.signaling.relay_url).with_heartbeat(
        config.signaling.ping_interval(),
        config.signaling.pong_timeout(),
    );
    let app = App::start(&config, transport, shutdown_token.clone()).await?;
    let printer = spawn_event_printer(app.handle().subscribe(), shutdown_token.clone());

    println!("Connected as {}. {HELP}", config.identity);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received ctrl-c, exiting");
                break;
            }
            line = lines.next_line() => line.context("Failed to read from stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<CliCommand>() {
            Ok(CliCommand::Quit) => break,
            Ok(command) => run_command(app.handle(), command).await,
            Err(err) => println!("{err}"),
        }
    }

    app.shutdown().await;
    if let Err(err) = printer.await {
        tracing::warn!(?err, "Event printer failed");
    }
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.filter.as_str().into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_command(handle: &CallHandle, command: CliCommand) {
    let result = match command {
        CliCommand::Call(id) => handle.call(&id).await.map(|_| format!("Ringing {id}")),
        CliCommand::Answer => handle.answer().await.map(|_| "Answered".to_string()),
        CliCommand::Reject => handle.reject().await.map(|_| "Rejected".to_string()),
        CliCommand::HangUp => handle.end_call().await.map(|_| "Hung up".to_string()),
        CliCommand::Mute(kind) => handle.toggle(kind).await.map(|muted| {
            format!("{kind} {}", if muted { "muted" } else { "unmuted" })
        }),
        CliCommand::Users => {
            let roster = handle.roster();
            Ok(if roster.is_empty() {
                "Nobody else is online".to_string()
            } else {
                roster.ids().collect::<Vec<_>>().join(", ")
            })
        }
        CliCommand::State => handle.status().await.map(|status| match status.peer_id {
            Some(peer_id) => format!(
                "{} with {peer_id}, {} remote candidates pending",
                status.state, status.buffered_candidates
            ),
            None => status.state.to_string(),
        }),
        CliCommand::Help => Ok(HELP.to_string()),
        CliCommand::Quit => return,
    };

    match result {
        Ok(output) => println!("{output}"),
        Err(err) => println!("Error: {err}"),
    }
}

fn spawn_event_printer(
    mut events_rx: broadcast::Receiver<CallEvent>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => break,
                event = events_rx.recv() => event,
            };

            match event {
                Ok(CallEvent::IncomingCall { peer_id }) => {
                    println!("Incoming call from {peer_id}, type `answer` or `reject`");
                }
                Ok(CallEvent::CallAnnounced { peer_id }) => {
                    println!("{peer_id} is about to call");
                }
                Ok(CallEvent::StateChanged { state, .. }) => {
                    tracing::debug!(%state, "Call state changed");
                }
                Ok(CallEvent::RemoteTrack { peer_id, kind }) => {
                    println!("Receiving {kind} from {peer_id}");
                }
                Ok(CallEvent::MuteChanged { .. }) => {}
                Ok(CallEvent::Ended { peer_id, reason }) => {
                    println!("Call with {peer_id} ended: {reason}");
                }
                Ok(CallEvent::Error(err)) => println!("Error: {err}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(?skipped, "Event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
