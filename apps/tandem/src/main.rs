use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_call_core::config::Config;
use tandem_call_core::media::SyntheticDevices;
use tandem_call_core::telemetry::logging::{self, LogConfig, LogLevel};
use tandem_call_core::transport::{HttpIceServerProvider, IceServerProvider, StaticIceServers};
use tandem_call_core::{
    CallSession, EndReason, Participant, SessionConfig, SessionDeps, SessionParams,
};

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Join a two-party call session")]
struct Cli {
    #[arg(long, env = "TANDEM_SESSION_ID")]
    session: String,

    #[arg(long, env = "TANDEM_RESERVATION_ID")]
    reservation: String,

    #[arg(long, env = "TANDEM_PARTICIPANT_ID")]
    participant: String,

    #[arg(long, env = "TANDEM_TOKEN", hide_env_values = true, default_value = "")]
    token: String,

    #[arg(long, help = "Routing token appended to the relay URL")]
    routing_token: Option<String>,

    #[arg(long, help = "Relay websocket URL (overrides TANDEM_RELAY_URL)")]
    relay: Option<String>,

    #[arg(long, help = "ICE server endpoint (overrides TANDEM_ICE_URL)")]
    ice_url: Option<String>,

    #[arg(long = "stun", default_value = "stun:stun.l.google.com:19302")]
    stun: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Print every status change as a JSON line on stdout")]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = logging::init(&log_config) {
        eprintln!("⚠️  {err}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if cli.ice_url.is_some() {
        config.ice_url = cli.ice_url;
    }
    let session_config = SessionConfig::from_config(&config)?;

    let bearer = Some(cli.token.clone()).filter(|t| !t.is_empty());
    let ice: Arc<dyn IceServerProvider> = match &config.ice_url {
        Some(url) => Arc::new(HttpIceServerProvider::new(
            url.parse().context("invalid ICE server url")?,
            bearer,
        )),
        None => Arc::new(StaticIceServers::stun(cli.stun)),
    };
    // No capture backend ships with the CLI; tracks are synthetic.
    let deps = SessionDeps::networked(ice, Arc::new(SyntheticDevices));
    let params = SessionParams {
        session_id: cli.session,
        reservation_id: cli.reservation,
        routing_token: cli.routing_token,
        participant: Participant {
            id: cli.participant,
            bearer_token: cli.token,
        },
    };

    let (handle, mut task) = CallSession::start(params, deps, session_config)?;
    let mut status = handle.watch_status();
    let json = cli.json;
    let reporter = tokio::spawn(async move {
        let mut last = None;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if json {
                match serde_json::to_string(&current) {
                    Ok(line) => println!("{line}"),
                    Err(err) => eprintln!("⚠️  status not serializable: {err}"),
                }
            }
            let phase = current.negotiation.phase;
            if last != Some(phase) {
                eprintln!("📞 {phase}");
                last = Some(phase);
            }
        }
    });

    let outcome = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("hanging up");
            handle.hang_up();
            task.await?
        }
    };
    drop(handle);
    reporter.abort();

    eprintln!("call ended in {}: {:?}", outcome.phase, outcome.reason);
    Ok(match outcome.reason {
        EndReason::LocalHangup | EndReason::RemoteEnded | EndReason::Detached => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
