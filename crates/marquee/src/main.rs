mod server;

use anyhow::Context;
use clap::Parser;
use marquee_common::{telemetry, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "marquee.toml")]
    config: PathBuf,

    /// Session signing secret; overrides `session.jwt_secret`
    #[arg(long, env = "MARQUEE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading config from {:?}", args.config))?;
    if let Some(secret) = args.jwt_secret {
        config.session.jwt_secret = secret;
    }
    config.validate()?;

    telemetry::init(&config.logging)?;
    tracing::info!(config = ?args.config, "Marquee starting");

    server::run(config).await
}
