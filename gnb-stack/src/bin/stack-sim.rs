//! Stack scheduler simulator.
//!
//! Drives a small demo stack with a synthetic radio tick source and a
//! gateway thread writing SDUs, then prints the scheduler metrics.
//!
//! # Usage
//!
//! ```sh
//! stack-sim --ticks 2000 --period-us 1000 --workers 2
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use gnb_stack::{
    GatewayInterface, ProtocolStack, RadioInterface, SchedulerBuilder, SchedulerConfig,
    SchedulerError, TaskContext, TimerHandle, Tti, WorkerFailure,
};

/// Default number of ticks to simulate.
const DEFAULT_TICKS: u32 = 1000;

/// Default tick period (one NR slot at 15 kHz SCS).
const DEFAULT_PERIOD_US: u64 = 1000;

/// LCID the demo bearer runs on.
const DATA_LCID: u32 = 4;

/// Ticks between status reports from the periodic timer.
const STATUS_PERIOD: u32 = 20;

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

struct SimArgs {
    ticks: u32,
    period: Duration,
    workers: Option<usize>,
}

/// Demo stack: counts SDUs, reports status on a periodic timer and hashes
/// every hundredth SDU batch on the background pool.
#[derive(Default)]
struct DemoStack {
    sdus: u64,
    bytes: u64,
    status_reports: u64,
    digests: u64,
    last_digest: u64,
    /// Held so the periodic timer lives as long as the stack.
    _status_timer: Option<TimerHandle<DemoStack>>,
}

impl DemoStack {
    fn record_digest(&mut self, digest: Result<u64, WorkerFailure>) -> Result<(), SchedulerError> {
        self.last_digest = digest?;
        self.digests += 1;
        Ok(())
    }
}

impl ProtocolStack for DemoStack {
    fn run_tti(&mut self, tti: Tti, ctx: &mut TaskContext<'_, Self>) {
        if tti.get() % 1000 == 0 {
            eprintln!(
                "stack-sim: tti {tti}: {} SDUs ({} bytes), {} status reports, {} digests (last {:#x})",
                self.sdus, self.bytes, self.status_reports, self.digests, self.last_digest
            );
        }
        if tti.get() % 100 != 0 || self.sdus == 0 {
            return;
        }
        let seed = self.bytes;
        let submitted = ctx.enqueue_background(
            move |_| (0..10_000u64).fold(seed, |acc, x| acc.rotate_left(5) ^ x),
            |stack: &mut DemoStack, _, digest: Result<u64, WorkerFailure>| {
                if let Err(err) = stack.record_digest(digest) {
                    eprintln!("stack-sim: {err}");
                }
            },
        );
        if let Err(err) = submitted {
            eprintln!("stack-sim: background submit failed: {err}");
        }
    }

    fn write_sdu(&mut self, _lcid: u32, sdu: Bytes, _ctx: &mut TaskContext<'_, Self>) {
        self.sdus += 1;
        self.bytes += sdu.len() as u64;
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("stack-sim: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), SimError> {
    gnb_stack::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let sim = parse_args(&args)?;

    let config = SchedulerConfig::simulation()
        .with_background_workers(sim.workers.or(Some(1)))
        .with_loop_thread_name("stack-sim");
    let modulus = config.tti_modulus;
    let stack_loop = SchedulerBuilder::<DemoStack>::new(config)?.spawn(|ctx| {
        let mut stack = DemoStack::default();
        ctx.lcids().enable(DATA_LCID);
        match ctx.create_timer() {
            Ok(mut timer) => {
                let id = timer.id();
                timer.set(
                    STATUS_PERIOD,
                    move |stack: &mut DemoStack, ctx: &mut TaskContext<'_, DemoStack>| {
                        stack.status_reports += 1;
                        ctx.timers().run(id);
                    },
                );
                stack._status_timer = Some(timer);
            }
            Err(err) => eprintln!("stack-sim: no status timer: {err}"),
        }
        stack
    })?;

    eprintln!("stack-sim: {} ticks every {:?}", sim.ticks, sim.period);

    let done = Arc::new(AtomicBool::new(false));
    let gateway = stack_loop.handle();
    let gateway_done = Arc::clone(&done);
    let gateway_thread = thread::Builder::new()
        .name("sim-gateway".into())
        .spawn(move || {
            let sdu = Bytes::from_static(&[0u8; 1400]);
            let mut rejected = 0u64;
            while !gateway_done.load(Ordering::Relaxed) {
                if gateway.is_lcid_enabled(DATA_LCID)
                    && gateway.write_sdu(DATA_LCID, sdu.clone(), false).is_err()
                {
                    rejected += 1;
                }
                thread::sleep(Duration::from_micros(200));
            }
            rejected
        })
        .map_err(|source| SchedulerError::Spawn {
            name: "sim-gateway".into(),
            source,
        })?;

    stack_loop.start()?;
    let radio = stack_loop.handle();
    for tti in 0..sim.ticks {
        radio.tick_indication(Tti::new(tti % modulus));
        thread::sleep(sim.period);
    }
    stack_loop.stop()?;
    done.store(true, Ordering::Relaxed);
    let rejected = gateway_thread.join().unwrap_or(0);

    let metrics = stack_loop.metrics();
    stack_loop.shutdown()?;

    eprintln!("stack-sim: gateway SDUs rejected: {rejected}");
    println!("{metrics:#?}");
    Ok(())
}

fn parse_args(args: &[String]) -> Result<SimArgs, SimError> {
    let mut ticks = DEFAULT_TICKS;
    let mut period_us = DEFAULT_PERIOD_US;
    let mut workers = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ticks" | "-n" => {
                ticks = parse_value(args, &mut i, "--ticks")?;
            }
            "--period-us" | "-p" => {
                period_us = parse_value(args, &mut i, "--period-us")?;
            }
            "--workers" | "-w" => {
                workers = Some(parse_value(args, &mut i, "--workers")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                return Err(SimError::Args(format!("unknown argument: {other}")));
            }
        }
        i += 1;
    }

    Ok(SimArgs {
        ticks,
        period: Duration::from_micros(period_us),
        workers,
    })
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, SimError> {
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| SimError::Args(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|_| SimError::Args(format!("invalid value for {flag}: {raw}")))
}

fn print_usage() {
    eprintln!(
        r"stack-sim - gNB stack scheduler simulator

USAGE:
    stack-sim [OPTIONS]

OPTIONS:
    -n, --ticks <N>         Ticks to simulate [default: 1000]
    -p, --period-us <US>    Tick period in microseconds [default: 1000]
    -w, --workers <N>       Background workers [default: 1]
    -h, --help              Print help"
    );
}
