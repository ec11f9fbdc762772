//! Run command implementation for the tandem CLI.
//!
//! Dispatches one call (or several concurrent copies of it) to a worker pool
//! serving the built-in modules and prints what comes back.

use std::time::{Duration, Instant};

use anyhow::Context;
use futures::StreamExt;
use serde_json::Value;
use tandem_core::{Adapter, Dispatcher, Payload, PoolConfig, RunOptions, WorkerPool};

use crate::colors;

/// A parsed `run` invocation.
pub struct Request {
    pub module: String,
    pub args: Option<String>,
    pub function: String,
    pub timeout: Option<u64>,
    pub keep_alive: bool,
    pub adapter: Adapter,
    pub iterate: bool,
    pub max_workers: Option<usize>,
    pub repeat: usize,
}

/// Execute a `run` request.
pub async fn execute(request: Request) -> anyhow::Result<()> {
    let start = Instant::now();
    let args = parse_args(request.args.as_deref())?;

    let mut config = PoolConfig::from_env()?;
    if let Some(max_workers) = request.max_workers {
        config = config.with_max_workers(max_workers)?;
    }
    let pool = WorkerPool::with_errors(
        config,
        tandem_worker::builtin_modules(),
        tandem_worker::builtin_errors(),
    );
    let dispatcher = Dispatcher::new(pool);

    let mut options = RunOptions::call(&request.function)
        .with_keep_alive(request.keep_alive)
        .with_adapter(request.adapter);
    if let Some(ms) = request.timeout {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let calls = (0..request.repeat.max(1)).map(|_| {
        call(&dispatcher, &request.module, args.clone(), options.clone(), request.iterate)
    });
    let outcomes = futures::future::join_all(calls).await;
    dispatcher.pool().shutdown();

    let total = outcomes.len();
    for outcome in outcomes {
        outcome?;
    }
    if request.repeat > 1 {
        eprintln!(
            "{}Completed{} {} calls in {:.2}s",
            colors::GREEN,
            colors::RESET,
            total,
            start.elapsed().as_secs_f64()
        );
    }
    tracing::debug!("run finished in {:?}", start.elapsed());
    Ok(())
}

async fn call(
    dispatcher: &Dispatcher,
    module: &str,
    args: Vec<Payload>,
    options: RunOptions,
    iterate: bool,
) -> anyhow::Result<()> {
    let mut task = dispatcher.run(module, args, options).await?;

    if !iterate {
        let value = task.result().await?;
        println!("{}", serde_json::to_string_pretty(&value.into_json())?);
        return Ok(());
    }

    let mut stream = task.iterate()?;
    while let Some(item) = stream.next().await {
        println!("{}", serde_json::to_string(&item?.into_json())?);
    }
    if let Some(returned) = stream.return_value() {
        let returned = serde_json::to_string(&returned.clone().into_json())?;
        println!("{}return{} {}", colors::DIM, colors::RESET, returned);
    }
    Ok(())
}

/// Arguments as JSON: an array is spread, anything else is one argument.
fn parse_args(raw: Option<&str>) -> anyhow::Result<Vec<Payload>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(raw).context("arguments must be valid JSON")?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(Payload::Value).collect(),
        single => vec![Payload::Value(single)],
    })
}
