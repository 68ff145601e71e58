mod config;
mod dispatch;
mod error;
mod metadata;
mod ops;
mod protocol;
mod resolver;
mod search;
mod server;
mod telemetry;
mod tools;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
	let config = config::load_config()?;
	telemetry::init_tracing(&config);
	let result = server::run(config).await;
	telemetry::shutdown();
	result
}
