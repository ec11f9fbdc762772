//! Modules a worker can invoke, and the shapes their results take.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use rustc_hash::FxHashMap;

use crate::exception::Exception;
use crate::wire::Payload;

/// Outcome of invoking an exported function.
pub enum Invocation {
    /// Settled immediately.
    Value(Result<Payload, Exception>),
    /// Settles later.
    Deferred(BoxFuture<'static, Result<Payload, Exception>>),
    /// Produces a sequence of values through a generator.
    Stream(Box<dyn Generator>),
}

impl Invocation {
    pub fn value(payload: impl Into<Payload>) -> Self {
        Self::Value(Ok(payload.into()))
    }

    pub fn error(exception: Exception) -> Self {
        Self::Value(Err(exception))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Payload, Exception>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn stream(generator: impl Generator + 'static) -> Self {
        Self::Stream(Box::new(generator))
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(result) => f.debug_tuple("Value").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// How a generator is resumed.
#[derive(Debug, Clone)]
pub enum Resume {
    Next(Payload),
    Return(Payload),
    Throw(Exception),
}

/// What a generator produced when resumed.
#[derive(Debug, Clone)]
pub enum Step {
    Yielded(Payload),
    /// The generator finished with a return value.
    Complete(Payload),
}

impl Step {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn into_payload(self) -> Payload {
        match self {
            Self::Yielded(payload) | Self::Complete(payload) => payload,
        }
    }
}

/// A resumable producer of values, driven one step at a time.
///
/// After completing or failing, further `Next` resumes complete with null.
pub trait Generator: Send {
    fn resume(&mut self, input: Resume) -> BoxFuture<'_, Result<Step, Exception>>;
}

/// Adapts a [`Stream`] into a [`Generator`].
///
/// Values passed with `Next` are ignored; `Return` stops the stream early and
/// `Throw` stops it with the given error.
pub struct StreamGenerator {
    stream: Option<BoxStream<'static, Result<Payload, Exception>>>,
    returns: Payload,
}

impl StreamGenerator {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Payload, Exception>> + Send + 'static,
    {
        Self {
            stream: Some(stream.boxed()),
            returns: Payload::null(),
        }
    }

    /// Value reported once the stream is exhausted.
    pub fn returning(mut self, value: impl Into<Payload>) -> Self {
        self.returns = value.into();
        self
    }
}

impl Generator for StreamGenerator {
    fn resume(&mut self, input: Resume) -> BoxFuture<'_, Result<Step, Exception>> {
        async move {
            match input {
                Resume::Next(_) => {
                    let Some(stream) = self.stream.as_mut() else {
                        return Ok(Step::Complete(Payload::null()));
                    };
                    match stream.next().await {
                        Some(Ok(value)) => Ok(Step::Yielded(value)),
                        Some(Err(exception)) => {
                            self.stream = None;
                            Err(exception)
                        }
                        None => {
                            self.stream = None;
                            Ok(Step::Complete(std::mem::take(&mut self.returns)))
                        }
                    }
                }
                Resume::Return(value) => {
                    self.stream = None;
                    Ok(Step::Complete(value))
                }
                Resume::Throw(exception) => {
                    self.stream = None;
                    Err(exception)
                }
            }
        }
        .boxed()
    }
}

/// An exported function.
pub type ModuleFn = Arc<dyn Fn(Vec<Payload>) -> Invocation + Send + Sync>;

/// A named set of exported functions.
#[derive(Clone, Default)]
pub struct Module {
    functions: FxHashMap<String, ModuleFn>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an export.
    pub fn function(
        mut self,
        name: impl Into<String>,
        f: impl Fn(Vec<Payload>) -> Invocation + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModuleFn> {
        self.functions.get(name)
    }

    /// Sorted export names.
    pub fn exports(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module").field("exports", &self.exports()).finish()
    }
}

/// Modules resolvable by name.
#[derive(Clone, Default, Debug)]
pub struct ModuleRegistry {
    modules: FxHashMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, module: Module) -> &mut Self {
        self.modules.insert(name.into(), module);
        self
    }

    pub fn with(mut self, name: impl Into<String>, module: Module) -> Self {
        self.register(name, module);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Sorted module names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up `function` in `module`.
    pub fn resolve(&self, module: &str, function: &str) -> Result<ModuleFn, Exception> {
        let found = self.modules.get(module).ok_or_else(|| {
            Exception::new(format!("Cannot find module '{}'", module))
                .with_field("code", "ERR_MODULE_NOT_FOUND")
        })?;
        found
            .get(function)
            .cloned()
            .ok_or_else(|| Exception::type_error(format!("{} is not a function", function)))
    }
}
