//! burrow binary: role dispatch.
//!
//! One executable runs as frontend (proxy), agent, or relay, selected by
//! `--mode` or inferred from which addresses are configured. Settings merge
//! CLI flags over an optional YAML overlay over defaults.

use clap::Parser;

use burrow::config::{Cli, Config, FileConfig, Role};
use burrow::frontend::Frontend;
use burrow::relay::Relay;
use burrow::{agent, Error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let cfg = Config::resolve(cli, file)?;

    init_tracing(cfg.debug);
    tokio::spawn(exit_on_signal());

    tracing::debug!(
        "resolved config: role={:?} socks={} tunnel_port={} tunnel_addr={:?} \
         relay_port={} relay_addr={:?} register={} retries={}",
        cfg.role,
        cfg.socks_listen_addr,
        cfg.tunnel_listen_port,
        cfg.tunnel_addr,
        cfg.relay_listen_port,
        cfg.relay_addr,
        cfg.register,
        cfg.max_retries,
    );

    match cfg.role {
        Role::Relay => {
            let relay = Relay::bind(cfg.relay_listen_port).await?;
            relay.run().await?;
        }
        Role::Agent => {
            // A configured relay takes precedence over a direct address,
            // mirroring the dispatch order of the flag set.
            if let Some(relay_addr) = &cfg.relay_addr {
                agent::run_via_relay(relay_addr, &cfg.secret, cfg.max_retries).await?;
            } else {
                let tunnel_addr = cfg
                    .tunnel_addr
                    .as_deref()
                    .ok_or_else(|| Error::config("agent mode needs --tunnel-addr"))?;
                agent::run_direct(tunnel_addr, &cfg.secret, cfg.max_retries).await?;
            }
        }
        Role::Frontend => {
            let frontend = if cfg.register {
                let relay_addr = cfg
                    .relay_addr
                    .as_deref()
                    .ok_or_else(|| Error::config("--register needs --relay-addr"))?;
                Frontend::bind_with_relay(&cfg.socks_listen_addr, relay_addr, &cfg.secret).await?
            } else {
                Frontend::bind(&cfg.socks_listen_addr, cfg.tunnel_listen_port, &cfg.secret).await?
            };
            frontend.run().await?;
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

/// SIGINT/SIGTERM exit the process immediately with code 0.
async fn exit_on_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                graceful_exit();
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    graceful_exit();
}

fn graceful_exit() -> ! {
    tracing::info!("shutdown signal received, exiting");
    std::process::exit(0);
}
