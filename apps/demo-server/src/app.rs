//! Wires the greetings engine and token hooks to the configured transport.

use std::sync::Arc;
use std::time::Duration;

use graphwire_server::{BlockingServer, GraphQlWsServer};

use crate::auth::TokenAuth;
use crate::config::{Config, Transport};
use crate::greetings::GreetingsGateway;

/// Runs the demo server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let server_config = config.server_config();
    let handler = TokenAuth {
        token: config.auth_token.clone(),
    };
    let gateway = GreetingsGateway::default();

    match config.transport {
        Transport::Async => {
            let server = GraphQlWsServer::new(server_config, gateway, handler);
            let server_run = Arc::clone(&server);
            let task = tokio::spawn(async move { server_run.run().await });

            // Wait for the server to bind.
            let port = loop {
                if task.is_finished() {
                    break 0;
                }
                let p = server.port().await;
                if p > 0 {
                    break p;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            if port == 0 {
                task.await??;
                anyhow::bail!("server stopped before binding");
            }
            tracing::info!(port, "ready: ws://{}:{port}/graphql", config.bind_addr);

            tokio::signal::ctrl_c().await?;
            tracing::info!("SIGINT received, shutting down");
            server.shutdown();
            task.await??;
        }
        Transport::Blocking => {
            let server = BlockingServer::new(
                server_config,
                gateway,
                handler,
                tokio::runtime::Handle::current(),
            );
            let server_run = Arc::clone(&server);
            let accept_thread = std::thread::Builder::new()
                .name("graphwire-accept".into())
                .spawn(move || server_run.run())?;

            let port = loop {
                if accept_thread.is_finished() {
                    break 0;
                }
                let p = server.port();
                if p > 0 {
                    break p;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            if port > 0 {
                tracing::info!(
                    port,
                    "ready (blocking transport): ws://{}:{port}/graphql",
                    config.bind_addr
                );
                tokio::signal::ctrl_c().await?;
                tracing::info!("SIGINT received, shutting down");
                server.shutdown();
            }
            let joined = tokio::task::spawn_blocking(move || accept_thread.join()).await?;
            match joined {
                Ok(res) => res?,
                Err(_) => anyhow::bail!("accept thread panicked"),
            }
        }
    }

    // Let connections finish their close handshake.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
