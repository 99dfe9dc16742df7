#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use hermes_proxy::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hermes-proxy", about = "L4/L7 proxy data plane driven by xDS")]
struct Cli {
    /// Path to the bootstrap file (.json or .toml)
    #[arg(short, long, default_value = "bootstrap.json")]
    config: PathBuf,

    /// Admin API listen address, overrides admin.address from the bootstrap
    #[arg(long)]
    admin_listen: Option<String>,

    /// Node id reported to the management server
    #[arg(long)]
    node_id: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (worker_threads, source) = server::runtime::worker_threads();
    eprintln!(
        "hermes-proxy: worker_threads={}, source={}",
        worker_threads,
        source.as_str()
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        admin_listen: cli.admin_listen,
        node_id: cli.node_id,
    }))
}
