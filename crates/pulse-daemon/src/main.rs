//! # pulsed
//!
//! Runs a Pulse authority (`serve`) or connects an agent to one and prints
//! the events it receives (`watch`).

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pulse_agent::{AgentConfig, AgentNotice, ConnectionAgent};
use pulse_auth::{
    AllowAllDirectory, CredentialSource, JwtCredentialValidator, SigningCredentialSource,
    StaticCredentialSource,
};
use pulse_core::logging::{LogFormat, init_subscriber};
use pulse_core::{Envelope, EventCategory};
use pulse_server::metrics::install_recorder;
use pulse_server::{NoUploadPipeline, PulseServer, ServerConfig};
use pulse_settings::PulseSettings;

/// Pulse real-time messaging daemon.
#[derive(Parser, Debug)]
#[command(name = "pulsed", about = "Pulse real-time messaging daemon")]
struct Cli {
    /// Settings file (defaults to `~/.pulse/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (overrides settings; `RUST_LOG` overrides both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: `compact` or `json`.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Connection Authority.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// Maximum concurrent connections (overrides settings).
        #[arg(long)]
        max_connections: Option<usize>,

        /// Do not expose `/metrics`.
        #[arg(long)]
        no_metrics: bool,
    },
    /// Connect an agent and print received events as JSON lines.
    Watch {
        /// Authority URL, e.g. `ws://127.0.0.1:8090` (overrides settings).
        #[arg(long)]
        url: Option<String>,

        /// Bearer token to present.
        #[arg(long, conflicts_with = "user")]
        token: Option<String>,

        /// Mint tokens for this identity with the configured secret.
        #[arg(long)]
        user: Option<String>,

        /// Categories to subscribe to (repeatable or comma separated).
        #[arg(long = "event", value_delimiter = ',')]
        events: Vec<EventCategory>,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<PulseSettings> {
    match path {
        Some(path) => pulse_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => pulse_settings::load_settings().with_context(|| {
            format!(
                "Failed to load settings from {}",
                pulse_settings::settings_path().display()
            )
        }),
    }
}

fn server_config(
    settings: &PulseSettings,
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
) -> ServerConfig {
    let mut config = ServerConfig::from(&settings.server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(max) = max_connections {
        config.max_connections = max;
    }
    config
}

async fn serve(settings: &PulseSettings, config: ServerConfig, metrics: bool) -> Result<()> {
    let validator =
        JwtCredentialValidator::from_settings(&settings.auth, Arc::new(AllowAllDirectory));
    let mut server = PulseServer::new(config, Arc::new(validator), Arc::new(NoUploadPipeline));
    if metrics {
        let handle = install_recorder().context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Pulse authority listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn credentials(
    settings: &PulseSettings,
    token: Option<String>,
    user: Option<String>,
) -> Result<Arc<dyn CredentialSource>> {
    match (token, user) {
        (Some(token), _) => Ok(Arc::new(StaticCredentialSource::new(token))),
        (None, Some(user)) => Ok(Arc::new(SigningCredentialSource::new(
            settings.auth.jwt_secret.clone(),
            user,
            chrono::Duration::hours(1),
        ))),
        (None, None) => bail!("watch needs --token or --user"),
    }
}

fn print_envelope(envelope: &Envelope) {
    match envelope.to_json() {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!(error = %err, "could not print event"),
    }
}

async fn watch(
    settings: &PulseSettings,
    url: Option<String>,
    source: Arc<dyn CredentialSource>,
    events: &[EventCategory],
) -> Result<()> {
    let mut config = AgentConfig::from(&settings.agent);
    if let Some(url) = url {
        config.url = url;
    }
    let agent = ConnectionAgent::new(config, source);

    let categories: Vec<EventCategory> = if events.is_empty() {
        EventCategory::ALL.to_vec()
    } else {
        events.to_vec()
    };
    for category in &categories {
        let _ = agent.on(*category, Arc::new(print_envelope));
    }
    agent.subscribe(&categories)?;

    let mut notices = agent.notices();
    if let Err(err) = agent.connect().await {
        tracing::warn!(error = %err, "initial connect failed");
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            notice = notices.recv() => match notice {
                Ok(AgentNotice::ReconnectExhausted { attempts }) => {
                    bail!("gave up after {attempts} reconnect attempts");
                }
                Ok(AgentNotice::AuthenticationFailed { reason }) => {
                    bail!("authentication failed: {reason}");
                }
                Ok(notice) => tracing::info!(?notice, "agent notice"),
                Err(err) => tracing::debug!(error = %err, "notice stream lagged"),
            },
        }
    }

    agent.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    init_subscriber(level, cli.log_format.unwrap_or(settings.logging.format));

    match cli.command {
        Command::Serve {
            host,
            port,
            max_connections,
            no_metrics,
        } => {
            let config = server_config(&settings, host, port, max_connections);
            serve(&settings, config, !no_metrics).await
        }
        Command::Watch {
            url,
            token,
            user,
            events,
        } => {
            let source = credentials(&settings, token, user)?;
            watch(&settings, url, source, &events).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::parse_from(["pulsed", "serve"]);
        assert!(cli.config.is_none());
        match cli.command {
            Command::Serve { host, port, no_metrics, .. } => {
                assert!(host.is_none());
                assert!(port.is_none());
                assert!(!no_metrics);
            }
            Command::Watch { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn serve_overrides_settings() {
        let cli = Cli::parse_from([
            "pulsed", "serve", "--host", "0.0.0.0", "--port", "9000", "--max-connections", "5",
        ]);
        let Command::Serve { host, port, max_connections, .. } = cli.command else {
            panic!("expected serve");
        };
        let config = server_config(&PulseSettings::default(), host, port, max_connections);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.per_user_limit, 3);
    }

    #[test]
    fn watch_parses_event_list() {
        let cli = Cli::parse_from([
            "pulsed", "watch", "--user", "ops", "--event", "review.created,file.ready",
        ]);
        let Command::Watch { events, user, .. } = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(user.as_deref(), Some("ops"));
        assert_eq!(events, [EventCategory::ReviewCreated, EventCategory::FileReady]);
    }

    #[test]
    fn watch_rejects_unknown_event() {
        let res = Cli::try_parse_from(["pulsed", "watch", "--token", "t", "--event", "nope"]);
        assert!(res.is_err());
    }

    #[test]
    fn token_and_user_conflict() {
        let res = Cli::try_parse_from(["pulsed", "watch", "--token", "t", "--user", "u"]);
        assert!(res.is_err());
    }

    #[test]
    fn global_log_flags() {
        let cli = Cli::parse_from(["pulsed", "--log-format", "json", "serve"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn credentials_need_token_or_user() {
        let settings = PulseSettings::default();
        assert!(credentials(&settings, None, None).is_err());
        assert!(credentials(&settings, Some("t".into()), None).is_ok());
        assert!(credentials(&settings, None, Some("ops".into())).is_ok());
    }
}
