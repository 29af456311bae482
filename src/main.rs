use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Dynamic database-API gateway.
#[derive(Debug, Parser)]
#[command(name = "dbgate", version)]
struct Args
{
	/// Address to listen on.
	#[arg(long, env = "DBGATE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
	listen_addr: SocketAddr,
}

/// The main server entrypoint for the gateway.
#[tokio::main]
async fn main() -> color_eyre::Result<()>
{
	color_eyre::install()?;

	#[allow(clippy::print_stderr, reason = "tracing isn't initialized yet")]
	if dotenvy::dotenv().is_err() {
		// Not an error: production deployments configure through the
		// environment directly.
		eprintln!("WARNING: no `.env` file found");
	}

	tracing_subscriber::fmt()
		.with_span_events(FmtSpan::CLOSE)
		.with_env_filter(EnvFilter::from_default_env())
		.init();

	let args = Args::parse();
	let config = dbgate::runtime::Config::new()?;
	let (server, resources) = dbgate::server(config).await?;
	let tcp_listener = TcpListener::bind(args.listen_addr).await?;

	tracing::info!("listening on {}", tcp_listener.local_addr()?);

	axum::serve(tcp_listener, server)
		.with_graceful_shutdown(dbgate::shutdown_signal())
		.await?;

	tracing::info!("shutting down");
	resources.dispose().await;

	Ok(())
}
