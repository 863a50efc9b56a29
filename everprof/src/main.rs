use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use everprof::aggregator::ProfileLabels;
use everprof::perf_event::EventSource;
use everprof::pump::{EventPump, PumpConfig};
use everprof::sink::FileSink;

/// Continuous whole-system sampling profiler.
#[derive(Debug, Parser)]
#[command(name = "everprof", version)]
struct Args {
    /// Process to attach to (with its children). Omit for agent-only mode.
    #[arg(short, long)]
    pid: Option<u32>,

    /// Samples per second per CPU.
    #[arg(short = 'F', long, default_value = "99")]
    frequency: u64,

    /// Use hardware CPU cycles instead of the software CPU clock.
    #[arg(long)]
    cycles: bool,

    /// Seconds between profile exports.
    #[arg(short = 'u', long, default_value = "60")]
    upload_period: u64,

    /// Unix socket where in-process agents request the allocation ring
    /// buffer; enables allocation profiling.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Mean sampled-allocation byte interval.
    #[arg(long, default_value = "524288")]
    allocation_interval: u64,

    /// Track matching deallocations and report live heap bytes.
    #[arg(long)]
    live_heap: bool,

    /// Directory receiving the serialized pprof profiles.
    #[arg(short, long, default_value = "./profiles")]
    output: PathBuf,

    #[arg(long, default_value = "myservice")]
    service: String,

    #[arg(long, default_value = "unspecified")]
    environment: String,

    #[arg(long, default_value = "0.0.0")]
    service_version: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.pid.is_none() && args.socket.is_none() {
        eprintln!("nothing to profile: pass --pid, --socket, or both");
        std::process::exit(1);
    }

    let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_sender.try_send(());
    })
    .expect("cannot install the signal handler");

    let config = PumpConfig {
        target_pid: args.pid,
        frequency: args.frequency,
        event_source: if args.cycles {
            EventSource::HwCpuCycles
        } else {
            EventSource::SwCpuClock
        },
        upload_period: Duration::from_secs(args.upload_period.max(1)),
        socket_path: args.socket,
        allocation_interval: args.allocation_interval.max(1),
        track_live_heap: args.live_heap,
        labels: ProfileLabels {
            service: args.service,
            environment: args.environment,
            service_version: args.service_version,
            runtime: "native".to_owned(),
        },
    };

    let sink = match FileSink::new(args.output) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("cannot open output directory: {err}");
            std::process::exit(1);
        }
    };

    let mut pump = match EventPump::new(config, sink, shutdown_receiver) {
        Ok(pump) => pump,
        Err(err) => {
            eprintln!("profiler setup failed: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = pump.run() {
        eprintln!("profiler exited with an error: {err}");
        std::process::exit(1);
    }
}
