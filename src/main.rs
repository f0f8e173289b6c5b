use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iceberg::config;
use iceberg::proxy::gateway::Gateway;
use iceberg::router::default_route_table;

const CONFIG_ENV: &str = "ICEBERG_CONFIG";

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let contents = match (args.config, args.file) {
		(Some(_), Some(_)) => bail!("only one of --config or --file may be given"),
		(Some(config), None) => config,
		(None, Some(file)) => tokio::fs::read_to_string(file).await?,
		(None, None) => match std::env::var(CONFIG_ENV) {
			Ok(contents) => contents,
			Err(_) => bail!("no configuration: pass --config/--file or set {CONFIG_ENV}"),
		},
	};

	let (metadata, spec) = config::parse(&contents)?;
	info!(name = metadata.name, "configuration loaded");
	let listen = config::bootstrap(&spec).await?;
	let gateway = Gateway::bind(&listen).await?;
	gateway.serve(default_route_table()).await
}
