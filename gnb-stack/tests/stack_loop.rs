//! Integration tests for the loop thread driven through its public handles.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=gnb_stack=trace cargo test --features tracing --test stack_loop -- --nocapture
//! ```

use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use gnb_stack::{
    GatewayInterface, LoopState, MacInterface, ProtocolStack, QueueConfig, RadioInterface,
    RxDataIndication, SchedulerBuilder, SchedulerConfig, SchedulerError, StackLoop, TaskContext,
    TimerHandle, Tti, WorkerFailure,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        gnb_stack::init_tracing();
    });
}

type Log = Arc<Mutex<Vec<String>>>;

/// Stack that records everything it is asked to do.
struct LoggingStack {
    log: Log,
    _timer: Option<TimerHandle<LoggingStack>>,
}

impl LoggingStack {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

impl ProtocolStack for LoggingStack {
    fn run_tti(&mut self, tti: Tti, _ctx: &mut TaskContext<'_, Self>) {
        self.record(format!("tti@{tti}"));
    }

    fn rx_data_indication(&mut self, indication: RxDataIndication, _ctx: &mut TaskContext<'_, Self>) {
        self.record(format!("rx:{}", indication.rnti));
    }

    fn write_sdu(&mut self, _lcid: u32, sdu: Bytes, _ctx: &mut TaskContext<'_, Self>) {
        self.record(String::from_utf8_lossy(&sdu));
    }

    fn process_pdus(&mut self, _ctx: &mut TaskContext<'_, Self>) {
        self.record("pdus");
    }
}

fn spawn_with<F>(config: SchedulerConfig, setup: F) -> (StackLoop<LoggingStack>, Log)
where
    F: FnOnce(&mut LoggingStack, &mut TaskContext<'_, LoggingStack>) + Send + 'static,
{
    init_test_tracing();
    let log: Log = Arc::default();
    let stack_log = Arc::clone(&log);
    let stack_loop = SchedulerBuilder::new(config)
        .expect("valid config")
        .spawn(move |ctx| {
            let mut stack = LoggingStack {
                log: stack_log,
                _timer: None,
            };
            setup(&mut stack, ctx);
            stack
        })
        .expect("spawn loop");
    (stack_loop, log)
}

fn spawn() -> (StackLoop<LoggingStack>, Log) {
    spawn_with(SchedulerConfig::simulation(), |_, _| {})
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn sync_data_runs_before_gateway_sdus() {
    let (stack_loop, log) = spawn();
    let handle = stack_loop.handle();

    for sdu in ["A", "B", "C"] {
        handle.write_sdu(4, Bytes::from(sdu), true).unwrap();
    }
    handle
        .rx_data_indication(RxDataIndication {
            tti: Tti::new(0),
            rnti: 0x4601,
            payload: Bytes::new(),
        })
        .unwrap();
    handle.process_pdus().unwrap();

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(0));
    wait_for("first tick", || stack_loop.metrics().ticks == 1);

    assert_eq!(
        entries(&log),
        ["rx:17921", "A", "B", "C", "pdus", "tti@0"]
    );
    stack_loop.shutdown().unwrap();
}

#[test]
fn background_result_arrives_on_a_later_tick() {
    let (stack_loop, log) = spawn();
    let handle = stack_loop.handle();
    handle
        .push(stack_loop.queues().generic, |_: &mut LoggingStack, ctx: &mut TaskContext<'_, LoggingStack>| {
            ctx.enqueue_background(
                |_| thread::current().name().map(str::to_owned),
                |stack: &mut LoggingStack,
                 ctx: &mut TaskContext<'_, LoggingStack>,
                 result: Result<Option<String>, WorkerFailure>| {
                    let worker = result.unwrap().unwrap_or_default();
                    stack.record(format!("result@{} from {worker}", ctx.tti()));
                },
            )
            .unwrap();
        })
        .unwrap();

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(1));
    wait_for("first tick", || stack_loop.metrics().ticks == 1);
    wait_for("background result", || {
        stack_loop
            .metrics()
            .queues
            .iter()
            .any(|q| q.name == "background" && q.depth == 1)
    });
    assert_eq!(entries(&log), ["tti@1"]);

    handle.tick_indication(Tti::new(2));
    wait_for("second tick", || stack_loop.metrics().ticks == 2);
    assert_eq!(
        entries(&log),
        ["tti@1", "result@2 from gnb-bg-0", "tti@2"]
    );
    stack_loop.shutdown().unwrap();
}

#[test]
fn restart_resyncs_and_fires_overdue_timers() {
    let (stack_loop, log) = spawn_with(SchedulerConfig::simulation(), |stack, ctx| {
        let mut timer = ctx.create_timer().unwrap();
        timer.set(10, |stack: &mut LoggingStack, ctx: &mut TaskContext<'_, LoggingStack>| {
            stack.record(format!("timer@{}", ctx.tti()));
        });
        stack._timer = Some(timer);
    });
    let handle = stack_loop.handle();

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(0));
    wait_for("first tick", || stack_loop.metrics().ticks == 1);
    stack_loop.stop().unwrap();
    assert_eq!(stack_loop.state(), LoopState::Stopped);

    for tti in 1..6 {
        handle.tick_indication(Tti::new(tti));
    }
    assert_eq!(stack_loop.metrics().ticks_ignored, 5);

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(50));
    wait_for("resynced tick", || stack_loop.metrics().ticks == 2);

    assert_eq!(entries(&log), ["tti@0", "timer@50", "tti@50"]);
    stack_loop.shutdown().unwrap();
}

#[test]
fn overrunning_ticks_are_counted_and_still_processed() {
    let (stack_loop, _log) = spawn();
    let handle = stack_loop.handle();
    handle
        .push(stack_loop.queues().generic, |_: &mut LoggingStack, _: &mut TaskContext<'_, LoggingStack>| {
            thread::sleep(Duration::from_millis(100));
        })
        .unwrap();

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(0));
    handle.tick_indication(Tti::new(1));
    handle.tick_indication(Tti::new(2));
    wait_for("all ticks", || stack_loop.metrics().ticks == 3);

    let metrics = stack_loop.metrics();
    assert_eq!(metrics.overruns, 2);
    assert_eq!(metrics.tti, 2);
    stack_loop.shutdown().unwrap();
}

#[test]
fn non_blocking_sdu_write_reports_backpressure() {
    let config = SchedulerConfig::simulation().with_gateway_queue(QueueConfig::rejecting(2));
    let (stack_loop, _log) = spawn_with(config, |_, ctx| {
        ctx.lcids().enable(3);
    });
    let handle = stack_loop.handle();
    assert!(handle.is_lcid_enabled(3));
    assert!(!handle.is_lcid_enabled(4));

    handle.write_sdu(3, Bytes::from("x"), false).unwrap();
    handle.write_sdu(3, Bytes::from("y"), false).unwrap();
    let err = handle.write_sdu(3, Bytes::from("z"), false).unwrap_err();
    assert!(matches!(err, SchedulerError::Backpressure { ref queue } if queue == "gateway"));

    let gateway = &stack_loop.metrics().queues[1];
    assert_eq!(gateway.rejected, 1);
    stack_loop.shutdown().unwrap();
}

/// Background result whose destructor panics.
struct PanicsOnDrop;

impl Drop for PanicsOnDrop {
    fn drop(&mut self) {
        panic!("result destructor failed");
    }
}

#[test]
fn dead_background_worker_terminates_the_loop() {
    let config = SchedulerConfig::simulation().with_background_queue(QueueConfig::rejecting(2));
    let (stack_loop, log) = spawn_with(config, |_, _| {});
    let handle = stack_loop.handle();
    let background = handle.queue(stack_loop.queues().background);
    for label in ["first", "second"] {
        background
            .push(move |stack: &mut LoggingStack, _: &mut TaskContext<'_, LoggingStack>| stack.record(label))
            .unwrap();
    }
    handle
        .enqueue_background(
            |_| PanicsOnDrop,
            |_: &mut LoggingStack, _: &mut TaskContext<'_, LoggingStack>, _: Result<PanicsOnDrop, WorkerFailure>| {},
        )
        .unwrap();
    wait_for("pool fault", || stack_loop.metrics().pool.faulted);

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(0));
    wait_for("loop termination", || {
        stack_loop.state() == LoopState::Terminated
    });
    assert!(entries(&log).is_empty());

    let err = stack_loop.shutdown().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("result destructor failed"), "{err}");
}

#[test]
fn panicking_task_terminates_the_loop() {
    let (stack_loop, _log) = spawn();
    let handle = stack_loop.handle();
    handle
        .push(stack_loop.queues().generic, |_: &mut LoggingStack, _: &mut TaskContext<'_, LoggingStack>| {
            panic!("rrc state corrupted");
        })
        .unwrap();

    stack_loop.start().unwrap();
    handle.tick_indication(Tti::new(0));
    wait_for("loop termination", || {
        stack_loop.state() == LoopState::Terminated
    });

    assert!(stack_loop.start().unwrap_err().is_fatal());
    handle.tick_indication(Tti::new(1));
    assert_eq!(stack_loop.metrics().ticks_ignored, 1);

    let err = stack_loop.shutdown().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("rrc state corrupted"));
}
