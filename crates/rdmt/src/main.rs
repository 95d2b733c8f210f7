#![warn(missing_docs)]
//! RDMT demo: a client and a server engine talking over the simulated fabric.
//!
//! The client PUTs a greeting and GETs it back, once per iteration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use rdmt::{
    CompletionCode, ConnId, Engine, EngineEvent, RdmtConfig, SimFabric, SimNode, TaskContext,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rdmt-demo", about = "Run a GET/PUT exchange over the simulated fabric")]
struct Args {
    /// Engine configuration file (TOML or JSON).
    #[arg(short, long, env = "RDMT_CONFIG")]
    config: Option<PathBuf>,

    /// Number of PUT/GET round trips.
    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: usize,

    /// Give up on a round trip after this many milliseconds.
    #[arg(long, default_value_t = 5000)]
    deadline_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RdmtConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RdmtConfig::default(),
    };
    tracing::info!(addr = %config.listen_addr, "RDMT demo starting");

    let fabric = SimFabric::new();
    let mut server = Engine::new(Arc::new(fabric.node("server")), config.clone())?;
    server.listen(&config.listen_addr)?;

    let stop = Arc::new(AtomicBool::new(false));
    let server_stop = stop.clone();
    let server_thread = thread::spawn(move || serve(server, &server_stop));

    let client_result = run_client(&fabric, &config, &args);
    stop.store(true, Ordering::Release);
    let server_result = server_thread
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?;
    client_result?;
    server_result?;

    let stats = fabric.stats();
    tracing::info!(
        sends = stats.sends,
        writes = stats.writes,
        bytes = stats.bytes_moved,
        "fabric totals"
    );
    Ok(())
}

fn serve(mut engine: Engine<SimNode>, stop: &AtomicBool) -> Result<()> {
    let timeout = engine.config().poll_timeout().min(Duration::from_millis(10));
    while !stop.load(Ordering::Acquire) {
        engine.run_once(timeout)?;
        for event in engine.take_events() {
            match event {
                EngineEvent::PutReceived { conn, len } => {
                    let staged = engine.staged(conn)?;
                    tracing::info!(%conn, len, "server received: {}", String::from_utf8_lossy(&staged));
                }
                EngineEvent::GetServed { conn, len } => tracing::debug!(%conn, len, "GET served"),
                EngineEvent::Connected { conn, .. } => tracing::info!(%conn, "client connected"),
                EngineEvent::Closed { conn, .. } => tracing::info!(%conn, "client left"),
                other => tracing::debug!(?other, "server event"),
            }
        }
    }
    let metrics = engine.metrics().snapshot();
    tracing::info!("server metrics: {}", serde_json::to_string(&metrics)?);
    engine.shutdown();
    Ok(())
}

fn run_client(fabric: &SimFabric, config: &RdmtConfig, args: &Args) -> Result<()> {
    let mut engine = Engine::new(Arc::new(fabric.node("client")), config.clone())?;
    let deadline = Duration::from_millis(args.deadline_ms);
    let conn = engine.connect(&config.listen_addr)?;
    wait_for(&mut engine, deadline, |event| {
        matches!(event, EngineEvent::Connected { conn: c, .. } if *c == conn)
    })?;

    for i in 0..args.iterations {
        let greeting = format!("Client Hello World {}", i);
        let task = engine.create_task(TaskContext::Client, 2);
        engine.set_task_callback(
            task,
            Box::new(move |outcome: &rdmt::TaskOutcome| {
                tracing::debug!(task = %outcome.task, result = %outcome.result, "round trip done");
                Ok(())
            }),
        )?;

        engine.put(conn, greeting.as_bytes(), Some(task))?;
        expect_success(&mut engine, deadline, conn, "PUT")?;

        engine.get(conn, 0, Some(task))?;
        let len = expect_success(&mut engine, deadline, conn, "GET")?;
        let echoed = engine.bulk_contents(conn, len)?;
        if echoed != greeting.as_bytes() {
            bail!("GET {} returned {:?}", i, String::from_utf8_lossy(&echoed));
        }
        tracing::info!(%conn, "client got back: {}", String::from_utf8_lossy(&echoed));
        engine.destroy_task(task)?;
    }

    engine.close(conn)?;
    let metrics = engine.metrics().snapshot();
    tracing::info!("client metrics: {}", serde_json::to_string(&metrics)?);
    Ok(())
}

/// Waits for the next GET or PUT completion on `conn`, returning its length.
fn expect_success(
    engine: &mut Engine<SimNode>,
    deadline: Duration,
    conn: ConnId,
    what: &str,
) -> Result<usize> {
    let event = wait_for(engine, deadline, |event| match event {
        EngineEvent::GetCompleted { conn: c, .. } | EngineEvent::PutCompleted { conn: c, .. } => {
            *c == conn
        }
        EngineEvent::Closed { conn: c, .. } => *c == conn,
        _ => false,
    })?;
    match event {
        EngineEvent::GetCompleted { len, result, .. } | EngineEvent::PutCompleted { len, result, .. } => {
            if result != CompletionCode::Success {
                bail!("{} failed: {}", what, result);
            }
            Ok(len)
        }
        _ => bail!("connection closed during {}", what),
    }
}

fn wait_for<F>(engine: &mut Engine<SimNode>, deadline: Duration, mut matches: F) -> Result<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        engine.run_once(Duration::from_millis(10))?;
        let mut found = None;
        for event in engine.take_events() {
            if let EngineEvent::SetupFailed { reason, .. } = &event {
                bail!("setup failed: {}", reason);
            }
            if found.is_none() && matches(&event) {
                found = Some(event);
            }
        }
        if let Some(event) = found {
            return Ok(event);
        }
    }
    bail!("timed out after {:?}", deadline)
}
