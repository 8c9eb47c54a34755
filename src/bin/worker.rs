use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use tinymr::app::wc;
use tinymr::{coordinator_sock, Worker};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Directory for intermediate and output files
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    dir: PathBuf,

    /// Socket path (defaults to the per-user well-known path)
    #[structopt(long, parse(from_os_str))]
    sock: Option<PathBuf>,

    /// Seconds to sleep before retrying when no task is ready
    #[structopt(long, default_value = "1")]
    poll: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let w = Worker {
        dir: opt.dir,
        sock: opt.sock.unwrap_or_else(coordinator_sock),
        poll_interval: Duration::from_secs(opt.poll),
        map: wc::map,
        reduce: wc::reduce,
    };
    w.run().await
}
