use std::path::PathBuf;
use std::time::Duration;

use log::info;
use structopt::StructOpt;

use tinymr::{coordinator_sock, Coordinator};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Files to process, one map task each
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,

    /// Number of reduce tasks
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Seconds before an unreported task is handed out again
    #[structopt(long, default_value = "10")]
    lease: u64,

    /// Socket path (defaults to the per-user well-known path)
    #[structopt(long, parse(from_os_str))]
    sock: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let sock = opt.sock.unwrap_or_else(coordinator_sock);
    let coordinator = Coordinator::new(opt.files, opt.nreduce, Duration::from_secs(opt.lease));

    let server = tokio::spawn({
        let coordinator = coordinator.clone();
        let sock = sock.clone();
        async move { coordinator.serve(&sock).await }
    });

    while !coordinator.done() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // Linger one poll so workers can pick up their Exit replies.
    tokio::time::sleep(Duration::from_secs(1)).await;
    server.abort();
    let _ = std::fs::remove_file(&sock);
    info!("job complete");
    Ok(())
}
