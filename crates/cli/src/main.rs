mod demo;
mod logging;
mod remote;
mod serve;

use std::{path::PathBuf, time::Duration};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    switchyard_config::LogFormat,
};

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "JSON-RPC 2.0 over WebSocket")]
struct Args {
    /// Config file. Defaults to ./switchyard.toml, then the user config dir.
    #[arg(long, short, global = true, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `switchyard_server=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server.
    Serve(serve::ServeArgs),
    /// Call a method and print its result.
    Call {
        method: String,
        /// JSON array or object.
        params: Option<String>,
        #[command(flatten)]
        conn: remote::ConnArgs,
        /// Seconds to wait for the reply.
        #[arg(long = "timeout")]
        timeout_secs: Option<u64>,
    },
    /// Subscribe to topics and print notifications as JSON lines.
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
        #[command(flatten)]
        conn: remote::ConnArgs,
    },
    /// Print the SHA-256 digest to store as `token_sha256`.
    Digest { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => switchyard_config::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => switchyard_config::discover_and_load().context("failed to load config")?,
    };
    config.apply_env()?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.format = LogFormat::Json;
    }
    logging::init(&config.logging);

    match args.command {
        Command::Serve(serve_args) => serve::run(config, serve_args).await,
        Command::Call {
            method,
            params,
            conn,
            timeout_secs,
        } => {
            let timeout = timeout_secs.map(Duration::from_secs);
            remote::call(&config, conn, &method, params.as_deref(), timeout).await
        },
        Command::Listen { topics, conn } => remote::listen(&config, conn, &topics).await,
        Command::Digest { token } => {
            println!("{}", switchyard_server::auth::token_digest_hex(&token));
            Ok(())
        },
    }
}
