//! ACI registry server
//!
//! Run with: cargo run -p aci-registry --features cli -- --config registry.toml

use std::net::SocketAddr;

use aci_registry::config::RegistryConfig;
use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Serve an ACI image registry")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "registry.toml")]
    config: Utf8PathBuf,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let text = tokio::fs::read_to_string(&args.config)
        .await
        .wrap_err_with(|| format!("reading {}", args.config))?;
    let config: RegistryConfig =
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {}", args.config))?;

    let app = config.router().await.wrap_err("building registry")?;

    let addr = args.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    tracing::info!(server_name = %config.server_name, "ACI registry listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
