//! Error objects that survive the thread boundary.
//!
//! An [`Exception`] is the in-process form of an error raised by a task: it
//! keeps the constructor kind, `name`, `message`, `stack`, an optional `cause`
//! chain, the nested `errors` of aggregate errors, and any custom fields such
//! as a numeric `code`.
//!
//! [`Exception::to_object`] flattens it into a plain JSON object tagged with
//! `"@@type"`; [`ErrorRegistry::from_object`] inflates such an object back,
//! looking the kind up in an explicit registry of known error kinds.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

/// Key holding the constructor name in serialized error objects.
pub const TYPE_TAG: &str = "@@type";

/// Keys with fixed meaning in a serialized error object.
const RESERVED_KEYS: [&str; 6] = [TYPE_TAG, "name", "message", "stack", "cause", "errors"];

/// Error kinds every registry knows about.
const BUILTIN_KINDS: [&str; 10] = [
    "Error",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
    "AggregateError",
    "Exception",
    "DOMException",
];

/// A structured error value.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    /// Constructor kind, e.g. `TypeError` or `DOMException`.
    kind: String,
    name: String,
    message: String,
    stack: Option<String>,
    cause: Option<Box<Cause>>,
    /// Nested errors of an `AggregateError`.
    errors: Vec<Exception>,
    /// Custom enumerable fields (`code` and friends).
    fields: Map<String, Value>,
}

/// The `cause` of an exception: either another error or an arbitrary value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause {
    Exception(Exception),
    Value(Value),
}

impl Exception {
    /// Create a plain `Error`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::of_kind("Error", message)
    }

    /// Create an error of the given kind; the name defaults to the kind.
    pub fn of_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            name: kind.clone(),
            kind,
            message: message.into(),
            stack: None,
            cause: None,
            errors: Vec::new(),
            fields: Map::new(),
        }
    }

    /// Create a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::of_kind("TypeError", message)
    }

    /// Create a `DOMException` with the given name, filling the legacy `code`.
    pub fn dom(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut exception = Self::of_kind("DOMException", message).with_name(name);
        exception
            .fields
            .insert("code".to_string(), Value::from(dom_legacy_code(&exception.name)));
        exception
    }

    /// Create an `AggregateError` wrapping several errors.
    pub fn aggregate(errors: Vec<Exception>, message: impl Into<String>) -> Self {
        Self::of_kind("AggregateError", message).with_errors(errors)
    }

    /// Build an error from an arbitrary thrown value.
    pub fn from_thrown(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new(message.clone()),
            Value::Null => Self::new(""),
            other => Self::new(other.to_string()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Box::new(Cause::Exception(cause)));
        self
    }

    pub fn with_cause_value(mut self, cause: Value) -> Self {
        self.cause = Some(Box::new(Cause::Value(cause)));
        self
    }

    pub fn with_errors(mut self, errors: Vec<Exception>) -> Self {
        self.errors = errors;
        self
    }

    /// Attach a custom field. Reserved keys are ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_deref()
    }

    pub fn errors(&self) -> &[Exception] {
        &self.errors
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Flatten into a plain, transferable object.
    pub fn to_object(&self) -> Value {
        let mut object = Map::new();
        object.insert(TYPE_TAG.to_string(), Value::from(self.kind.clone()));
        object.insert("name".to_string(), Value::from(self.name.clone()));
        object.insert("message".to_string(), Value::from(self.message.clone()));
        if let Some(stack) = &self.stack {
            object.insert("stack".to_string(), Value::from(stack.clone()));
        }
        if let Some(cause) = self.cause.as_deref() {
            let cause = match cause {
                Cause::Exception(exception) => exception.to_object(),
                Cause::Value(value) => value.clone(),
            };
            object.insert("cause".to_string(), cause);
        }
        if !self.errors.is_empty() || self.kind == "AggregateError" {
            let errors = self.errors.iter().map(Exception::to_object).collect();
            object.insert("errors".to_string(), Value::Array(errors));
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.cause.as_deref() {
            Some(Cause::Exception(cause)) => Some(cause),
            _ => None,
        }
    }
}

/// Legacy numeric code of a `DOMException` name, 0 when it has none.
pub fn dom_legacy_code(name: &str) -> u16 {
    match name {
        "IndexSizeError" => 1,
        "HierarchyRequestError" => 3,
        "WrongDocumentError" => 4,
        "InvalidCharacterError" => 5,
        "NoModificationAllowedError" => 7,
        "NotFoundError" => 8,
        "NotSupportedError" => 9,
        "InvalidStateError" => 11,
        "SyntaxError" => 12,
        "InvalidModificationError" => 13,
        "NamespaceError" => 14,
        "InvalidAccessError" => 15,
        "TypeMismatchError" => 17,
        "SecurityError" => 18,
        "NetworkError" => 19,
        "AbortError" => 20,
        "URLMismatchError" => 21,
        "QuotaExceededError" => 22,
        "TimeoutError" => 23,
        "InvalidNodeTypeError" => 24,
        "DataCloneError" => 25,
        _ => 0,
    }
}

/// Post-processing applied to an inflated exception of a registered kind.
pub type ErrorFactory = Arc<dyn Fn(Exception) -> Exception + Send + Sync>;

/// Registry of error kinds that can be reconstructed from their object form.
///
/// Populated once at startup and shared by reference afterwards.
#[derive(Clone)]
pub struct ErrorRegistry {
    kinds: FxHashMap<String, ErrorFactory>,
}

impl ErrorRegistry {
    /// An empty registry. Every object inflates as a plain `Error`.
    pub fn new() -> Self {
        Self {
            kinds: FxHashMap::default(),
        }
    }

    /// A registry pre-seeded with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in BUILTIN_KINDS {
            registry.register(kind, |exception| exception);
        }
        registry.register("DOMException", |mut exception: Exception| {
            if !exception.fields.contains_key("code") {
                let code = dom_legacy_code(&exception.name);
                exception.fields.insert("code".to_string(), Value::from(code));
            }
            exception
        });
        registry
    }

    /// Register (or replace) an error kind.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(Exception) -> Exception + Send + Sync + 'static,
    ) -> &mut Self {
        self.kinds.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Inflate an error object.
    ///
    /// Returns `None` when the value is not error-shaped (no string `name`).
    /// Unknown kinds fall back to a plain `Error` that keeps its name.
    pub fn from_object(&self, value: &Value) -> Option<Exception> {
        let object = value.as_object()?;
        let name = object.get("name")?.as_str()?;

        let tagged = object.get(TYPE_TAG).and_then(Value::as_str);
        let (kind, factory) = match tagged
            .into_iter()
            .chain(std::iter::once(name))
            .find_map(|candidate| self.kinds.get(candidate).map(|f| (candidate, f)))
        {
            Some((kind, factory)) => (kind.to_string(), Some(factory)),
            None => ("Error".to_string(), None),
        };

        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut exception = Exception::of_kind(kind, message).with_name(name);
        exception.stack = object
            .get("stack")
            .and_then(Value::as_str)
            .map(str::to_string);
        exception.cause = object.get("cause").map(|cause| {
            let cause = match self.from_object(cause) {
                Some(inner) if is_tagged(cause) => Cause::Exception(inner),
                _ => Cause::Value(cause.clone()),
            };
            Box::new(cause)
        });
        if let Some(errors) = object.get("errors").and_then(Value::as_array) {
            exception.errors = errors.iter().filter_map(|e| self.from_object(e)).collect();
        }
        for (key, value) in object {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                exception.fields.insert(key.clone(), value.clone());
            }
        }

        Some(match factory {
            Some(factory) => factory(exception),
            None => exception,
        })
    }
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("ErrorRegistry").field("kinds", &kinds).finish()
    }
}

/// Whether a value is an object carrying the `"@@type"` tag.
fn is_tagged(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key(TYPE_TAG))
}
