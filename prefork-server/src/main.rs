use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use prefork_server::config::{self, Overrides, ServerConfig};
use prefork_server::reactor::TokioReactor;
use prefork_server::{Server, ServerResult, logging};

/// Serve /plaintext and /json from one pinned worker process per CPU
#[derive(Parser)]
#[command(name = "prefork-server", version)]
struct Cli {
    /// YAML config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Port every worker listens on
    #[arg(long, env = "PREFORK_PORT")]
    port: Option<u16>,
    /// Number of workers (defaults to one per CPU)
    #[arg(long)]
    workers: Option<usize>,
    /// CPUs to run workers on, e.g. "0-3,6"
    #[arg(long)]
    cpus: Option<String>,
    /// Do not pin workers to their CPU
    #[arg(long)]
    no_affinity: bool,
    /// Skip busy-poll, nodelay, keepalive and CPU steering on listeners
    #[arg(long)]
    no_socket_tuning: bool,
    /// Do not install a log subscriber
    #[arg(long)]
    disable_log: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            workers: self.workers,
            cpus: self.cpus.clone(),
            no_affinity: self.no_affinity,
            no_socket_tuning: self.no_socket_tuning,
            disable_log: self.disable_log,
        }
    }
}

fn load_config(cli: &Cli) -> ServerResult<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load(path)?,
        None => ServerConfig::default(),
    };
    config.apply(cli.overrides())?;
    Ok(config)
}

// Synchronous on purpose: workers fork from this thread, and each one starts
// its own runtime after the fork.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log);

    let server = Server::new(config);
    let result = server.run(|shutdown| {
        let response = &server.config().response;
        TokioReactor::new(&response.server_name, response.date_header, Some(shutdown))
    });

    match result {
        Ok(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
