use crate::cam::{build_info, config, daemon, rpc};
use clap::ValueEnum;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cammaster", version, about = "camera worker supervisor")]
pub struct Args {
    /// Path to supervisor config YAML
    #[arg(short = 'c', long = "config", default_value = "cammaster.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start (or restart) the worker for a camera
    Start { name: String },
    /// Stop the worker for a camera
    Stop { name: String },
    /// Restart the worker for a camera
    Restart { name: String },
    /// Enable autolaunch for a camera (launches it if not running)
    Enable { name: String },
    /// Disable autolaunch for a camera (running worker is left alone)
    Disable { name: String },
    /// Show status for a camera, or all (default)
    Status {
        name: Option<String>,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Ask the running daemon to shut down (stops all workers)
    Shutdown,
    /// Print build metadata for this binary
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn print_message(resp: &rpc::Response) {
    if !resp.message.trim().is_empty() {
        println!("{}", resp.message.trim_end());
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Cmd::Version) = args.cmd {
        println!("{}", build_info::banner());
        return Ok(());
    }

    let cfg = config::load_config(&args.config)?;

    match args.cmd {
        None => daemon::run_daemon(&cfg),
        Some(Cmd::Start { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Start { name })?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Stop { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Stop { name })?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Restart { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Restart { name })?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Enable { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Enable { name })?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Disable { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Disable { name })?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Status { name, format }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Status { name })?;
            match format {
                OutputFormat::Text => println!("{}", resp.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
            Ok(())
        }
        Some(Cmd::Shutdown) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Shutdown)?;
            print_message(&resp);
            Ok(())
        }
        Some(Cmd::Version) => unreachable!("handled above"),
    }
}
