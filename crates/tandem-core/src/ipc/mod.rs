//! Inter-process communication with tandem workers.
//!
//! This module provides the message protocol, its framing over byte streams,
//! and the thread and process endpoints that speak it.

mod endpoint;
pub mod protocol;

pub use endpoint::{
    Endpoint, KillSwitch, WORKER_BINARY, WorkerEvent, find_worker_binary, spawn_process,
    spawn_thread,
};
pub use protocol::{MAX_FRAME_LEN, Request, Response, read_frame, write_frame};
