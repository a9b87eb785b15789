use clap::Parser;
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

use gatekeeper::settings::Settings;
use gatekeeper::{build_acl, web};

#[derive(Parser, Debug)]
#[command(
    name = "gatekeeper",
    version,
    about = "Role-based ACL evaluator"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // load rules
    let acl = build_acl(&settings.rules)?;
    tracing::info!(
        namespaces = acl.executors().count(),
        bypass = settings.rules.bypass_role.is_some(),
        "ACL ready"
    );

    // start web server
    web::serve(settings, acl).await?;
    Ok(())
}
