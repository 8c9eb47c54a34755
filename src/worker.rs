use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::{info, trace, warn};
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::{bucket_of, AssignReply, KeyValue, SchedulerClient, TaskKind};

/// User-supplied map function: input file name and contents in, records out.
pub type MapFn = fn(&Path, &str) -> Vec<KeyValue>;
/// User-supplied reduce function: one key and all its values in, result out.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// A stateless worker: one task at a time, no internal concurrency.
pub struct Worker {
    /// Shared directory for intermediate and output files.
    pub dir: PathBuf,
    /// Coordinator socket path.
    pub sock: PathBuf,
    /// Delay before retrying after a `Wait` reply.
    pub poll_interval: Duration,
    pub map: MapFn,
    pub reduce: ReduceFn,
}

impl Worker {
    /// Ask for tasks and execute them until the coordinator says `Exit` or
    /// becomes unreachable, either of which means the job is over.
    pub async fn run(&self) -> anyhow::Result<()> {
        let transport = match tarpc::serde_transport::unix::connect(&self.sock, Json::default).await
        {
            Ok(t) => t,
            Err(e) => {
                info!("coordinator unreachable, exiting: {}", e);
                return Ok(());
            }
        };
        let client = SchedulerClient::new(client::Config::default(), transport).spawn();

        loop {
            let reply = match client.assign_task(context::current()).await {
                Ok(r) => r,
                Err(e) => {
                    info!("coordinator gone, exiting: {}", e);
                    break;
                }
            };
            match reply.kind {
                TaskKind::Map | TaskKind::Reduce => match self.execute(&reply) {
                    Ok(()) => {
                        if let Err(e) = client
                            .report_done(context::current(), reply.kind, reply.id, true)
                            .await
                        {
                            info!("coordinator gone, exiting: {}", e);
                            break;
                        }
                    }
                    // Leave the task unreported; the coordinator reassigns
                    // it once its lease expires.
                    Err(e) => warn!("{:?} task {} failed: {:#}", reply.kind, reply.id, e),
                },
                TaskKind::Wait => tokio::time::sleep(self.poll_interval).await,
                TaskKind::Exit => break,
            }
        }
        Ok(())
    }

    fn execute(&self, task: &AssignReply) -> anyhow::Result<()> {
        let id = task.id as usize;
        match task.kind {
            TaskKind::Map => self.run_map(id, &task.input, task.n_reduce),
            TaskKind::Reduce => self.run_reduce(id, task.n_map),
            TaskKind::Wait | TaskKind::Exit => Ok(()),
        }
    }

    /// Map: partition the records for one input file into per-reduce bucket
    /// files. Buckets that received no records get no file.
    fn run_map(&self, id: usize, input: &Path, n_reduce: usize) -> anyhow::Result<()> {
        let contents = fs::read_to_string(input)
            .with_context(|| format!("reading map input {}", input.display()))?;
        let records = (self.map)(input, &contents);

        let mut buckets: Vec<Vec<&KeyValue>> = vec![Vec::new(); n_reduce];
        for kv in &records {
            buckets[bucket_of(&kv.key, n_reduce)].push(kv);
        }
        for (r, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let path = self.intermediate_path(id, r);
            // Atomic rename: a reduce task never sees a half-written file,
            // and a stale duplicate writer just rewrites identical content.
            AtomicFile::new(&path, AllowOverwrite)
                .write(|f| {
                    let mut w = BufWriter::new(f);
                    for kv in bucket {
                        serde_json::to_writer(&mut w, kv)?;
                        w.write_all(b"\n")?;
                    }
                    w.flush()?;
                    Ok::<_, io::Error>(())
                })
                .with_context(|| format!("writing {}", path.display()))?;
            trace!("map {} wrote {}", id, path.display());
        }
        Ok(())
    }

    /// Reduce: merge every map task's bucket for this reduce id, group by
    /// key, and emit one sorted output line per distinct key.
    fn run_reduce(&self, id: usize, n_map: usize) -> anyhow::Result<()> {
        let mut records = Vec::<KeyValue>::new();
        for m in 0..n_map {
            let path = self.intermediate_path(m, id);
            let file = match File::open(&path) {
                Ok(f) => f,
                // Map tasks skip empty buckets, so a missing file is normal.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("opening {}", path.display())),
            };
            for line in BufReader::new(file).lines() {
                let line = line.with_context(|| format!("reading {}", path.display()))?;
                let kv: KeyValue = serde_json::from_str(&line)
                    .with_context(|| format!("bad record in {}", path.display()))?;
                records.push(kv);
            }
        }

        // Stable sort keeps values in file-encounter order within a key run.
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let path = self.output_path(id);
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| {
                let mut w = BufWriter::new(f);
                let mut i = 0;
                while i < records.len() {
                    let mut j = i + 1;
                    while j < records.len() && records[j].key == records[i].key {
                        j += 1;
                    }
                    let values: Vec<String> =
                        records[i..j].iter().map(|kv| kv.value.clone()).collect();
                    let key = &records[i].key;
                    writeln!(w, "{} {}", key, (self.reduce)(key, &values))?;
                    i = j;
                }
                w.flush()
            })
            .with_context(|| format!("writing {}", path.display()))?;
        trace!("reduce {} wrote {}", id, path.display());
        Ok(())
    }

    fn intermediate_path(&self, map_id: usize, reduce_id: usize) -> PathBuf {
        self.dir.join(format!("mr-{}-{}", map_id, reduce_id))
    }

    fn output_path(&self, reduce_id: usize) -> PathBuf {
        self.dir.join(format!("mr-out-{}", reduce_id))
    }
}
