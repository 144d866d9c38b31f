use clap::Parser;
use topn_autovideo::cli::{Cli, execute};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("topn_autovideo=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{:#}", err);
            1
        }
    };
    std::process::exit(code);
}
