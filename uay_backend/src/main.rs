use anyhow::Result;
use clap::Parser;
use uay_backend::cli::{self, Command};
use uay_backend::config::UayConfig;
use uay_backend::node::UayNode;
use uay_backend::telemetry;

#[derive(Parser)]
#[command(author, version, about = "U-ay micro-blogging backend CLI")]
struct Args {
    /// Act as this user id
    #[arg(long = "as", global = true)]
    user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let args = Args::parse();
    let config = UayConfig::from_env()?;
    let node = UayNode::start(config)?;

    if let Some(user_id) = &args.user {
        node.sign_in(user_id)?;
    }
    cli::run_command(&node, args.command).await
}
