pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod launcher;
pub mod liveness;
pub mod policy;
pub mod rpc;
pub mod state;
pub mod supervisor;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
