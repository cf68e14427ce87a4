use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{error, info};

use nyxsocks::config::Config;
use nyxsocks::{Client, Server};

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Mode {
	Server,
	Client,
}

#[derive(Parser)]
#[command(about = "Encrypted SOCKS5 proxy")]
struct Args {
	#[arg(long, value_enum)]
	mode: Mode,

	#[arg(long)]
	config: Option<PathBuf>,

	#[arg(long)]
	server: Option<String>,

	#[arg(long)]
	local: Option<String>,

	#[arg(long, env = "NYXSOCKS_PASSWORD")]
	password: Option<String>,

	#[arg(long)]
	timeout: Option<u64>,
}

impl Args {
	fn into_config(self) -> Result<Config, nyxsocks::Error> {
		let mut config = match &self.config {
			Some(path) => Config::load(path)?,
			None => Config::default(),
		};
		if let Some(server) = self.server {
			config.server_address = server;
		}
		if let Some(local) = self.local {
			config.local_address = local;
		}
		if let Some(password) = self.password {
			config.password = password;
		}
		if let Some(timeout) = self.timeout {
			config.timeout_secs = timeout;
		}
		config.validate()?;
		Ok(config)
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let args = Args::parse();
	let mode = args.mode;
	let config = match args.into_config() {
		Ok(c) => c,
		Err(e) => {
			error!("configuration error: {e}");
			return ExitCode::from(1);
		}
	};

	let result = match mode {
		Mode::Server => run_server(config).await,
		Mode::Client => run_client(config).await,
	};

	match result {
		Ok(()) => {
			info!("clean shutdown");
			ExitCode::SUCCESS
		}
		Err(RunError::Bind(e)) => {
			error!("bind error: {e}");
			ExitCode::from(1)
		}
		Err(RunError::Runtime(e)) => {
			error!("fatal runtime error: {e}");
			ExitCode::from(2)
		}
	}
}

enum RunError {
	Bind(nyxsocks::Error),
	Runtime(nyxsocks::Error),
}

impl From<nyxsocks::Error> for RunError {
	fn from(e: nyxsocks::Error) -> Self {
		match e {
			nyxsocks::Error::Bind(_) => RunError::Bind(e),
			other => RunError::Runtime(other),
		}
	}
}

async fn run_server(config: Config) -> Result<(), RunError> {
	let server = Server::new(config);
	let shutdown = server.shutdown_handle();
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		let _ = shutdown.send(true);
	});
	server.run().await?;
	Ok(())
}

async fn run_client(config: Config) -> Result<(), RunError> {
	let client = Client::new(config);
	let shutdown = client.shutdown_handle();
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		let _ = shutdown.send(true);
	});
	client.run().await?;
	Ok(())
}
