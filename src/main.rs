use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest as _, Md5};
use md5_lanes::{
    baseline::Baseline, Digest, LaneAssignment, Md5Server, PlanMode, ServerConfig, LANES,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KernelChoice {
    /// Portable scalar kernel
    Baseline,
    /// 8-lane AVX2 kernel
    Avx2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AssignmentChoice {
    Modulo,
    Fibonacci,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Files to hash
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Number of files hashed concurrently
    #[arg(short, long, value_name = "NUM", default_value_t = LANES)]
    worker: usize,

    /// Microseconds a partial batch waits for more blocks
    #[arg(long, value_name = "MICROS", default_value_t = 50)]
    idle_flush: u64,

    /// Compression kernel driving the lanes
    #[arg(long, value_enum, default_value_t = KernelChoice::Baseline)]
    kernel: KernelChoice,

    /// Mapping from sessions to lanes
    #[arg(long, value_enum, default_value_t = AssignmentChoice::Modulo)]
    assignment: AssignmentChoice,

    /// Invoke the kernel once per 64-byte round instead of once per group
    #[arg(long)]
    per_round: bool,

    /// Cross-check every digest against the reference md-5 implementation
    #[arg(long)]
    verify: bool,

    /// Do not draw a progress bar
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_idle_flush(Duration::from_micros(self.idle_flush))
            .with_assignment(match self.assignment {
                AssignmentChoice::Modulo => LaneAssignment::Modulo,
                AssignmentChoice::Fibonacci => LaneAssignment::Fibonacci,
            })
            .with_plan(if self.per_round {
                PlanMode::PerRound
            } else {
                PlanMode::Grouped
            })
    }

    fn server(&self) -> Result<Md5Server, String> {
        let config = self.config();
        let server = match self.kernel {
            KernelChoice::Baseline => Md5Server::with_kernel(config, Baseline),
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            KernelChoice::Avx2 => match md5_lanes::x86::Avx2::new() {
                Some(kernel) => Md5Server::with_kernel(config, kernel),
                None => return Err("AVX2 is not supported by this CPU".to_owned()),
            },
            #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
            KernelChoice::Avx2 => return Err("AVX2 requires an x86 target".to_owned()),
        };
        server.map_err(|err| err.to_string())
    }
}

/// Hash one file through a fresh session.
fn hash_file(
    server: &Md5Server,
    path: &Path,
    bar: &ProgressBar,
    verify: bool,
) -> io::Result<Digest> {
    let mut session = server.session();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut bar.wrap_write(&mut session))?;
    let digest = session.finalize()?;

    if verify {
        let mut reference = Md5::new();
        io::copy(&mut File::open(path)?, &mut reference)?;
        let reference: [u8; 16] = reference.finalize().into();
        if reference != digest {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "digest differs from reference implementation",
            ));
        }
    }
    Ok(digest)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let server = match cli.server() {
        Ok(server) => server,
        Err(err) => {
            eprintln!("md5-lanes: {err}");
            return ExitCode::FAILURE;
        }
    };

    let total = cli
        .files
        .iter()
        .filter_map(|path| path.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    let bar = if cli.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total).with_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bytes_per_sec:.green} {bytes}/{total_bytes} {wide_bar}",
            )
            .expect("progress template is valid"),
        )
    };

    // spawn workers
    let (job_send, job_recv) = unbounded::<(usize, PathBuf)>();
    let (result_send, result_recv) = unbounded();
    for (index, path) in cli.files.iter().cloned().enumerate() {
        job_send.send((index, path)).expect("job queue is open");
    }
    drop(job_send);

    for _ in 0..cli.worker.max(1) {
        thread::spawn({
            let server = server.clone();
            let bar = bar.clone();
            let job_recv = job_recv.clone();
            let result_send = result_send.clone();
            let verify = cli.verify;

            move || {
                while let Ok((index, path)) = job_recv.recv() {
                    let result = hash_file(&server, &path, &bar, verify);
                    if result_send.send((index, result)).is_err() {
                        break;
                    }
                }
            }
        });
    }
    drop(result_send);
    drop(server);

    let mut results: Vec<_> = result_recv.iter().collect();
    results.sort_by_key(|(index, _)| *index);
    bar.finish_and_clear();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut failed = false;
    for (index, result) in results {
        let path = cli.files[index].display();
        match result {
            Ok(digest) => {
                let mut line = String::with_capacity(2 * digest.len());
                for b in digest.iter() {
                    line.push_str(&format!("{b:02x}"));
                }
                if writeln!(out, "{line}  {path}").is_err() {
                    return ExitCode::FAILURE;
                }
            }
            Err(err) => {
                eprintln!("md5-lanes: {path}: {err}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
