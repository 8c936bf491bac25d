use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    switchyard_config::{AuthConfig, SwitchyardConfig},
    switchyard_server::{AllowAll, AuthBackend, Dispatcher, TokenAuthBackend, TokenUser, ws},
    tokio::net::TcpListener,
    tracing::{info, warn},
};

use crate::demo;

/// `serve` flags; each one overrides the matching `[server]` setting.
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// WebSocket route.
    #[arg(long)]
    pub path: Option<String>,

    /// Blocking-handler pool size; 0 runs them inline.
    #[arg(long)]
    pub max_workers: Option<usize>,
}

pub async fn run(mut config: SwitchyardConfig, args: ServeArgs) -> Result<()> {
    let server = &mut config.server;
    if let Some(bind) = args.bind {
        server.bind = bind;
    }
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(path) = args.path {
        server.path = path;
    }
    if let Some(max_workers) = args.max_workers {
        server.max_workers = max_workers;
    }

    let dispatcher = build_dispatcher(&config)?;
    let clock = tokio::spawn(demo::publish_clock(dispatcher.clone(), Duration::from_secs(1)));

    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, path = %config.server.path, "switchyard listening");

    axum::serve(listener, ws::router(dispatcher, &config.server.path))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    clock.abort();
    Ok(())
}

pub fn build_dispatcher(config: &SwitchyardConfig) -> Result<Dispatcher> {
    Ok(Dispatcher::builder()
        .auth_arc(auth_backend(&config.auth)?)
        .max_workers(config.server.max_workers)
        .call_timeout(config.server.call_timeout())
        .outbound_buffer(config.server.outbound_buffer)
        .delivery_timeout(config.server.delivery_timeout())
        .add_methods("", demo::methods())
        .add_topics(demo::TOPICS)
        .build())
}

/// Token authentication when users are configured, open access otherwise.
pub fn auth_backend(auth: &AuthConfig) -> Result<Arc<dyn AuthBackend>> {
    if auth.users.is_empty() {
        return Ok(Arc::new(AllowAll));
    }
    let users = auth
        .users
        .iter()
        .map(|user| {
            TokenUser::from_digest_hex(
                user.name.clone(),
                &user.token_sha256,
                user.permissions.iter().cloned(),
            )
            .with_context(|| {
                format!("user '{}': token_sha256 must be 64 hex characters", user.name)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    info!(users = users.len(), "token authentication enabled");
    Ok(Arc::new(TokenAuthBackend::new(users)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
