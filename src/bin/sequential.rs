//! Single-process oracle: the same word-count job without any distribution.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use atomicwrites::{AllowOverwrite, AtomicFile};
use structopt::StructOpt;

use tinymr::app::wc::{map, reduce};
use tinymr::bucket_of;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,

    /// Directory for output files
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    dir: PathBuf,

    #[structopt(long, default_value = "10")]
    nreduce: usize,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let mut grouped = HashMap::<String, Vec<String>>::new();
    for f in &opt.files {
        let contents = fs::read_to_string(f)?;
        for kv in map(f, &contents) {
            grouped.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut outputs: Vec<Vec<(String, String)>> = vec![Vec::new(); opt.nreduce];
    for (k, vs) in &grouped {
        outputs[bucket_of(k, opt.nreduce)].push((k.clone(), reduce(k, vs)));
    }
    for (r, mut lines) in outputs.into_iter().enumerate() {
        lines.sort();
        let path = opt.dir.join(format!("mr-out-{}", r));
        AtomicFile::new(&path, AllowOverwrite).write(|f| {
            for (k, v) in &lines {
                writeln!(f, "{} {}", k, v)?;
            }
            Ok::<_, std::io::Error>(())
        })?;
    }
    Ok(())
}
