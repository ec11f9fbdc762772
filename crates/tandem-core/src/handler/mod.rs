//! Worker-side call handling.
//!
//! A [`CallHandler`] owns one worker's view of the world: the modules it can
//! invoke, the generators callers are driving remotely, and the channels it
//! shares with its parent. [`CallHandler::serve`] runs the request loop over
//! any pair of message queues; [`serve_stdio`] wires it to framed stdin/stdout
//! for worker processes.

mod module;

pub use module::{
    Generator, Invocation, Module, ModuleFn, ModuleRegistry, Resume, Step, StreamGenerator,
};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::io::{BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::channel::reserve_ids_from;
use crate::error::{Error, Result};
use crate::exception::{ErrorRegistry, Exception};
use crate::ipc::{Request, Response, read_frame, write_frame};
use crate::wire::{ChannelRegistry, PARENT_PEER, Payload, PayloadCodec, Writer};

type SharedGenerator = Arc<tokio::sync::Mutex<Box<dyn Generator>>>;

/// Executes requests from a parent endpoint.
#[derive(Clone)]
pub struct CallHandler {
    modules: Arc<ModuleRegistry>,
    errors: Arc<ErrorRegistry>,
    channels: ChannelRegistry,
    /// Generators registered under caller-chosen task ids.
    tasks: Arc<Mutex<FxHashMap<u64, SharedGenerator>>>,
}

impl CallHandler {
    pub fn new(modules: Arc<ModuleRegistry>, errors: Arc<ErrorRegistry>) -> Self {
        Self {
            channels: ChannelRegistry::new(Arc::clone(&errors)),
            modules,
            errors,
            tasks: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Number of generators waiting to be driven.
    pub fn pending_tasks(&self) -> usize {
        self.lock_tasks().len()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, FxHashMap<u64, SharedGenerator>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve requests until the request queue closes.
    ///
    /// Announces readiness first. Channel traffic is applied in arrival
    /// order; calls and generator steps run as separate tasks.
    pub async fn serve(
        self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        responses: mpsc::UnboundedSender<Response>,
    ) {
        if responses.send(Response::Ready).is_err() {
            return;
        }

        let writer: Writer = {
            let responses = responses.clone();
            Arc::new(move |channel_id, op| {
                responses
                    .send(Response::channel(channel_id, op))
                    .map_err(|_| Error::Ipc("parent endpoint is gone".to_string()))
            })
        };
        let codec = PayloadCodec::new(self.channels.clone(), PARENT_PEER, writer);

        while let Some(request) = requests.recv().await {
            match request.into_channel_op() {
                Ok((channel_id, op)) => self.channels.deliver(PARENT_PEER, channel_id, op),
                Err(request) => {
                    // Decode here so channels in the arguments are known before later traffic.
                    let job = self.prepare(request, &codec);
                    let handler = self.clone();
                    let codec = codec.clone();
                    let responses = responses.clone();
                    tokio::spawn(async move { handler.run(job, &codec, &responses).await });
                }
            }
        }
        tracing::debug!("request queue closed, worker handler stopping");
    }

    fn prepare(&self, request: Request, codec: &PayloadCodec) -> Job {
        match request {
            Request::Call {
                module,
                function,
                args,
                task_id,
            } => Job::Call {
                module,
                function,
                args: codec.decode_all(args),
                task_id,
            },
            Request::Next { task_id, args } => Job::Drive {
                task_id,
                input: first_arg(codec, args).map(Resume::Next),
            },
            Request::Return { task_id, args } => Job::Drive {
                task_id,
                input: first_arg(codec, args).map(Resume::Return),
            },
            Request::Throw { task_id, mut args } => {
                let thrown = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                let exception = self
                    .errors
                    .from_object(&thrown)
                    .unwrap_or_else(|| Exception::from_thrown(&thrown));
                Job::Drive {
                    task_id,
                    input: Ok(Resume::Throw(exception)),
                }
            }
            Request::Send { .. } | Request::Close { .. } => Job::Ignore,
        }
    }

    /// Run one call or generator step, emitting its responses.
    async fn run(&self, job: Job, codec: &PayloadCodec, out: &Outbox) {
        match job {
            Job::Call {
                module,
                function,
                args,
                task_id,
            } => self.call(&module, &function, args, task_id, codec, out).await,
            Job::Drive { task_id, input } => emit(out, self.drive(task_id, input, codec).await),
            Job::Ignore => {}
        }
    }

    async fn call(
        &self,
        module: &str,
        function: &str,
        args: Result<Vec<Payload>>,
        task_id: Option<u64>,
        codec: &PayloadCodec,
        out: &Outbox,
    ) {
        let fail = |exception: Exception| {
            emit(
                out,
                Response::Error {
                    error: exception.to_object(),
                    task_id,
                },
            )
        };

        let args = match args {
            Ok(args) => args,
            Err(e) => return fail(e.into_exception()),
        };
        let target = match self.modules.resolve(module, function) {
            Ok(target) => target,
            Err(exception) => return fail(exception),
        };

        tracing::debug!("invoking {}.{}", module, function);
        let invocation = match std::panic::catch_unwind(AssertUnwindSafe(|| target(args))) {
            Ok(invocation) => invocation,
            Err(panic) => return fail(panic_exception(panic)),
        };

        let settled = match invocation {
            Invocation::Value(result) => result,
            Invocation::Deferred(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(panic_exception(panic)),
            },
            Invocation::Stream(generator) => {
                match task_id {
                    Some(task_id) => {
                        self.lock_tasks()
                            .insert(task_id, Arc::new(tokio::sync::Mutex::new(generator)));
                        emit(out, Response::Gen { task_id });
                    }
                    None => drain(generator, codec, out).await,
                }
                return;
            }
        };

        match settled {
            Ok(value) => emit(
                out,
                Response::Return {
                    value: codec.encode(value),
                    task_id,
                },
            ),
            Err(exception) => fail(exception),
        }
    }

    /// Resume the generator registered under `task_id`.
    async fn drive(&self, task_id: u64, input: Result<Resume>, codec: &PayloadCodec) -> Response {
        let error = |exception: Exception| Response::Error {
            error: exception.to_object(),
            task_id: Some(task_id),
        };

        let generator = self.lock_tasks().get(&task_id).cloned();
        let Some(generator) = generator else {
            return error(Exception::new(format!("Task {} does not exist", task_id)));
        };
        let input = match input {
            Ok(input) => input,
            Err(e) => return error(e.into_exception()),
        };

        let step = {
            let mut generator = generator.lock().await;
            resume_guarded(generator.as_mut(), input).await
        };

        match step {
            Ok(Step::Yielded(value)) => Response::Yield {
                value: codec.encode(value),
                done: false,
                task_id: Some(task_id),
            },
            Ok(Step::Complete(value)) => {
                self.lock_tasks().remove(&task_id);
                Response::Yield {
                    value: codec.encode(value),
                    done: true,
                    task_id: Some(task_id),
                }
            }
            Err(exception) => {
                self.lock_tasks().remove(&task_id);
                error(exception)
            }
        }
    }
}

impl std::fmt::Debug for CallHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandler")
            .field("modules", &self.modules.names())
            .field("pending_tasks", &self.pending_tasks())
            .field("channels", &self.channels)
            .finish()
    }
}

type Outbox = mpsc::UnboundedSender<Response>;

/// A request ready to run, with its arguments decoded.
enum Job {
    Call {
        module: String,
        function: String,
        args: Result<Vec<Payload>>,
        task_id: Option<u64>,
    },
    Drive {
        task_id: u64,
        input: Result<Resume>,
    },
    Ignore,
}

fn emit(out: &Outbox, response: Response) {
    if out.send(response).is_err() {
        tracing::debug!("parent endpoint is gone, dropping response");
    }
}

/// Resume a generator, turning a panic into an error.
async fn resume_guarded(generator: &mut dyn Generator, input: Resume) -> std::result::Result<Step, Exception> {
    match AssertUnwindSafe(generator.resume(input)).catch_unwind().await {
        Ok(step) => step,
        Err(panic) => Err(panic_exception(panic)),
    }
}

/// Run a generator to completion, emitting one response per step.
async fn drain(mut generator: Box<dyn Generator>, codec: &PayloadCodec, out: &Outbox) {
    loop {
        let response = match resume_guarded(generator.as_mut(), Resume::Next(Payload::null())).await {
            Ok(Step::Yielded(value)) => Response::Yield {
                value: codec.encode(value),
                done: false,
                task_id: None,
            },
            Ok(Step::Complete(value)) => {
                emit(out, Response::Yield {
                    value: codec.encode(value),
                    done: true,
                    task_id: None,
                });
                return;
            }
            Err(exception) => {
                emit(out, Response::Error {
                    error: exception.to_object(),
                    task_id: None,
                });
                return;
            }
        };
        if out.is_closed() {
            return;
        }
        emit(out, response);
    }
}

fn first_arg(codec: &PayloadCodec, mut args: Vec<Value>) -> Result<Payload> {
    if args.is_empty() {
        return Ok(Payload::null());
    }
    codec.decode(args.swap_remove(0))
}

fn panic_exception(panic: Box<dyn Any + Send>) -> Exception {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Exception::new(format!("worker function panicked: {}", message))
}

/// Serve a parent process over framed stdin/stdout.
///
/// Returns when stdin closes.
pub async fn serve_stdio(modules: Arc<ModuleRegistry>, errors: Arc<ErrorRegistry>) -> Result<()> {
    // Channel ids minted here must not collide with the parent's.
    reserve_ids_from(u64::from(std::process::id()) << 32);

    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();

    let reader = tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match read_frame::<_, Request>(&mut stdin).await {
                Ok(Some(request)) => {
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("failed to read request: {}", e);
                    break;
                }
            }
        }
    });

    let mut writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(response) = response_rx.recv().await {
            write_frame(&mut stdout, &response).await?;
        }
        Ok::<_, Error>(())
    });

    let result = tokio::select! {
        _ = CallHandler::new(modules, errors).serve(request_rx, response_tx) => Ok(()),
        written = &mut writer => match written {
            Ok(result) => result,
            Err(e) => Err(Error::Ipc(format!("response writer failed: {}", e))),
        },
    };

    // Channels may still hold response senders; nothing is listening anymore.
    reader.abort();
    writer.abort();
    result
}
