use anyhow::Result;
use clap::Parser;
use modelgateway::{app, config, telemetry};

#[derive(Parser, Debug)]
#[command(version, about = "OpenAI-compatible reverse proxy for chat-completion providers", long_about = None)]
struct Args {
	/// Path to the YAML configuration file
	#[arg(short, long, value_name = "file")]
	file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	telemetry::log::setup_logging();

	let args = Args::parse();
	let contents = tokio::fs::read_to_string(&args.file).await?;
	let cfg = config::parse_config(&contents)?;

	app::run(cfg).await
}
