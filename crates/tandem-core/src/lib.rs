//! Core engine for tandem: running functions on pooled worker threads and
//! processes.
//!
//! This crate provides:
//! - A closeable, optionally buffered [`Channel`]
//! - Channel proxying across worker boundaries ([`RemoteChannel`])
//! - A bounded [`WorkerPool`] of thread and process workers
//! - Task dispatch with results, streams, timeouts and abort ([`Dispatcher`])
//! - The worker-side [`CallHandler`]
//! - Error objects that survive the boundary ([`Exception`], [`ErrorRegistry`])

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod handler;
pub mod ipc;
pub mod pool;
pub mod wire;

pub use channel::{Channel, ChannelState};
pub use config::{Adapter, PoolConfig, RunOptions};
pub use dispatch::{Dispatcher, GeneratorSession, TaskHandle, TaskStream};
pub use error::{Error, Result};
pub use exception::{Cause, ErrorRegistry, Exception};
pub use handler::{
    CallHandler, Generator, Invocation, Module, ModuleRegistry, Resume, Step, StreamGenerator,
    serve_stdio,
};
pub use pool::{Worker, WorkerPool};
pub use wire::{ChannelRegistry, Payload, PayloadCodec, RemoteChannel};
