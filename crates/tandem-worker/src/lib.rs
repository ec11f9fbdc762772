//! Built-in modules served by tandem workers.
//!
//! The `tandem-worker` binary serves these over stdin/stdout; the CLI also
//! hands them to thread workers so both adapters expose the same functions.

use std::time::Duration;

use futures::stream;
use serde_json::{Value, json};
use tandem_core::{
    ErrorRegistry, Exception, Invocation, Module, ModuleRegistry, Payload, RemoteChannel,
    StreamGenerator,
};

/// Error kind raised by `errors.fail`.
pub const VALIDATION_ERROR: &str = "ValidationError";

/// Every module a worker exposes.
pub fn builtin_modules() -> ModuleRegistry {
    ModuleRegistry::new()
        .with("math", math())
        .with("stream", streams())
        .with("time", time())
        .with("echo", echo())
        .with("errors", errors())
        .with("channels", channels())
        .with("bytes", bytes())
}

/// The built-in error kinds plus the ones raised by [`builtin_modules`].
pub fn builtin_errors() -> ErrorRegistry {
    let mut registry = ErrorRegistry::with_builtins();
    registry.register(VALIDATION_ERROR, |exception| exception);
    registry
}

fn number(args: &[Payload], index: usize) -> Result<f64, Exception> {
    args.get(index)
        .and_then(Payload::as_value)
        .and_then(Value::as_f64)
        .ok_or_else(|| Exception::type_error(format!("argument {} must be a number", index)))
}

fn count_arg(args: &[Payload], index: usize) -> Result<u64, Exception> {
    args.get(index)
        .and_then(Payload::as_value)
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            Exception::type_error(format!("argument {} must be a non-negative integer", index))
        })
}

fn channel_arg(args: &[Payload]) -> Result<RemoteChannel, Exception> {
    args.first()
        .and_then(Payload::as_channel)
        .cloned()
        .ok_or_else(|| Exception::type_error("argument 0 must be a channel"))
}

/// Integers stay integers so results compare cleanly.
fn to_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn sum(args: &[Payload]) -> Result<Value, Exception> {
    let mut total = 0.0;
    for index in 0..args.len() {
        total += number(args, index)?;
    }
    Ok(to_number(total))
}

fn math() -> Module {
    Module::new()
        .function("add", |args| Invocation::Value(sum(&args).map(Payload::Value)))
        .function("default", |args| Invocation::Value(sum(&args).map(Payload::Value)))
        .function("divide", |args| {
            let quotient = number(&args, 0).and_then(|a| {
                let b = number(&args, 1)?;
                if b == 0.0 {
                    return Err(Exception::of_kind("RangeError", "division by zero"));
                }
                Ok(to_number(a / b))
            });
            Invocation::Value(quotient.map(Payload::Value))
        })
}

fn streams() -> Module {
    Module::new()
        // count(n): yields 1..=n, returns "done".
        .function("count", |args| {
            let n = match count_arg(&args, 0) {
                Ok(n) => n,
                Err(e) => return Invocation::error(e),
            };
            let items = (1..=n).map(|i| Ok(Payload::Value(json!(i))));
            Invocation::stream(StreamGenerator::new(stream::iter(items)).returning(json!("done")))
        })
        // ticks(interval_ms): yields 0, 1, 2, ... forever.
        .function("ticks", |args| {
            let interval = Duration::from_millis(count_arg(&args, 0).unwrap_or(10));
            let ticks = stream::unfold(0u64, move |tick| async move {
                tokio::time::sleep(interval).await;
                Some((Ok(Payload::Value(json!(tick))), tick + 1))
            });
            Invocation::stream(StreamGenerator::new(ticks))
        })
}

fn time() -> Module {
    Module::new()
        .function("sleep", |args| {
            let ms = match count_arg(&args, 0) {
                Ok(ms) => ms,
                Err(e) => return Invocation::error(e),
            };
            Invocation::deferred(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Payload::Value(json!(ms)))
            })
        })
        .function("hang", |_| {
            Invocation::deferred(std::future::pending::<Result<Payload, Exception>>())
        })
}

fn echo() -> Module {
    Module::new().function("default", |mut args| {
        if args.is_empty() {
            return Invocation::value(Payload::null());
        }
        Invocation::value(args.swap_remove(0))
    })
}

fn errors() -> Module {
    Module::new()
        .function("fail", |args| {
            let message = args
                .first()
                .and_then(Payload::as_value)
                .and_then(Value::as_str)
                .unwrap_or("validation failed")
                .to_string();
            Invocation::error(
                Exception::of_kind(VALIDATION_ERROR, message)
                    .with_field("code", 422)
                    .with_cause(Exception::type_error("expected a well-formed input")),
            )
        })
        .function("rethrow", |args| {
            let exception = match args.first() {
                Some(Payload::Error(exception)) => exception.clone(),
                Some(other) => Exception::from_thrown(&other.clone().into_json()),
                None => Exception::new(""),
            };
            Invocation::error(exception)
        })
}

fn channels() -> Module {
    Module::new()
        // drain(channel): every value until the channel closes.
        .function("drain", |args| {
            let channel = match channel_arg(&args) {
                Ok(channel) => channel,
                Err(e) => return Invocation::error(e),
            };
            Invocation::deferred(async move {
                let mut values = Vec::new();
                while let Some(value) = channel.recv().await? {
                    values.push(value);
                }
                Ok(Payload::Value(Value::Array(values)))
            })
        })
        // produce(channel, n): sends 1..=n, then closes the channel.
        .function("produce", |args| {
            let channel = match channel_arg(&args) {
                Ok(channel) => channel,
                Err(e) => return Invocation::error(e),
            };
            let n = match count_arg(&args, 1) {
                Ok(n) => n,
                Err(e) => return Invocation::error(e),
            };
            Invocation::deferred(async move {
                for i in 1..=n {
                    channel.send(json!(i)).await.map_err(|e| e.into_exception())?;
                }
                channel.close(None);
                Ok(Payload::Value(json!(n)))
            })
        })
}

fn bytes() -> Module {
    Module::new().function("reverse", |args| {
        match args.first().and_then(Payload::as_bytes) {
            Some(data) => {
                let mut reversed = data.to_vec();
                reversed.reverse();
                Invocation::value(Payload::Bytes(reversed))
            }
            None => Invocation::error(Exception::type_error("argument 0 must be a buffer")),
        }
    })
}
