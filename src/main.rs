//! intercept-proxy command line entry point

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;

use intercept_proxy::config;
use intercept_proxy::core::{ChunkSink, HookRegistry, ProxyServer};
use intercept_proxy::display::{self, ConsoleSink, DisplayMode};
use intercept_proxy::logger::{self, log};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_level);

    let proxy_config = cli.proxy_config()?;
    let rules = cli.rule_set()?;
    let label = proxy_config.listen.to_string();

    let mode = if cli.hexdump {
        DisplayMode::Hexdump
    } else {
        DisplayMode::Raw
    };
    let sink: Arc<dyn ChunkSink> = Arc::new(ConsoleSink::new(mode, label.clone()));
    let hooks = if proxy_config.protocol.is_stream() {
        display::lifecycle_hooks(&label)
    } else {
        HookRegistry::new()
    };

    log::debug!(
        protocol = %proxy_config.protocol,
        upstream = %proxy_config.upstream,
        rules = rules.len(),
        "Starting intercept proxy"
    );

    let server = ProxyServer::builder(proxy_config)
        .rules(rules)
        .hooks(hooks)
        .sink(sink)
        .build();

    // Setup shutdown handler
    let server_for_shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => {
                            log::info!("SIGINT received, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            log::info!("SIGTERM received, shutting down...");
                        }
                    }
                }
                _ => {
                    log::warn!("Failed to install signal handlers, falling back to ctrl-c");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        server_for_shutdown.request_stop();
    });

    // Run server
    server.start().await?;
    Ok(())
}
