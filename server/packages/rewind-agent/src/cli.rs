use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rewind_agent_connection::launch::{LaunchSpec, DEFAULT_PROGRAM};
use rewind_agent_connection::mock::MockConnector;
use rewind_agent_connection::process::{
    ProcessConnector, DEFAULT_DRAIN_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
use rewind_agent_connection::AgentConnector;
use rewind_agent_error::SessionError;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::input::ThreadLines;
use crate::router::{build_router_with_state, shutdown_sessions, AppState};
use crate::terminal::TerminalSession;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;
const REQUEST_TIMEOUT_ENV: &str = "REWIND_AGENT_REQUEST_TIMEOUT_MS";
const DRAIN_TIMEOUT_ENV: &str = "REWIND_AGENT_DRAIN_TIMEOUT_MS";

#[derive(Parser, Debug)]
#[command(name = "rewind-agent", bin_name = "rewind-agent", version)]
#[command(about = "Interruptible, rewindable sessions for a streaming coding agent")]
#[command(arg_required_else_help = true)]
pub struct RewindAgentCli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    agent: AgentArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Chat in the terminal. Esc interrupts a response, /rewind goes back.
    Chat,
    /// Serve sessions to many clients over HTTP.
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    #[arg(long, value_enum, default_value_t = AgentKind::Claude, global = true)]
    agent: AgentKind,

    /// Agent CLI executable.
    #[arg(long = "agent-bin", global = true)]
    agent_bin: Option<PathBuf>,

    #[arg(long = "permission-mode", global = true)]
    permission_mode: Option<String>,

    /// Working directory for the agent.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
    Mock,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_rewind_agent() -> Result<(), CliError> {
    let RewindAgentCli { command, agent } = RewindAgentCli::parse();
    if let Err(err) = init_logging(&command) {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let connector = build_connector(&agent);
    run_command(&command, connector)
}

pub fn init_logging(command: &Command) -> Result<(), CliError> {
    let default_level = match command {
        Command::Server(_) => "info",
        // Chat output shares the terminal with logs.
        Command::Chat => "warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command, connector: Arc<dyn AgentConnector>) -> Result<(), CliError> {
    match command {
        Command::Chat => run_chat(connector),
        Command::Server(args) => run_server(args, connector),
    }
}

pub fn build_connector(args: &AgentArgs) -> Arc<dyn AgentConnector> {
    match args.agent {
        AgentKind::Mock => Arc::new(MockConnector::echo()),
        AgentKind::Claude => {
            let mut launch = LaunchSpec {
                program: args
                    .agent_bin
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM)),
                cwd: args.cwd.clone(),
                ..LaunchSpec::default()
            };
            if let Some(mode) = &args.permission_mode {
                launch.permission_mode = mode.clone();
            }
            let connector = ProcessConnector::new(launch).with_timeouts(
                duration_from_env_ms(REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT),
                duration_from_env_ms(DRAIN_TIMEOUT_ENV, DEFAULT_DRAIN_TIMEOUT),
            );
            Arc::new(connector)
        }
    }
}

fn run_chat(connector: Arc<dyn AgentConnector>) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let input = ThreadLines::stdin()?;
    let result = runtime.block_on(async move {
        let mut session = TerminalSession::new(input, tokio::io::stdout(), connector);
        session.run().await?;
        Ok::<(), CliError>(())
    });
    // An agent connection may still be closing; the chat is over either way.
    runtime.shutdown_background();
    result
}

fn run_server(server: &ServerArgs, connector: Arc<dyn AgentConnector>) -> Result<(), CliError> {
    let state = Arc::new(AppState::new(connector));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down, closing agent sessions");
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}
