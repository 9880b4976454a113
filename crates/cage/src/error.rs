use deno_core::v8;

use crate::{
    helpers::{
        get_property,
        to_rust_string,
    },
    is_instance_of_error::is_instance_of_error,
};

/// An error that originated in (or is destined for) the guest, dumped to its
/// `name` and `message` properties.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct GuestError {
    pub name: String,
    pub message: String,
}

impl GuestError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new("RangeError", message)
    }
}

/// A value that could not cross the host/guest boundary.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum MarshalError {
    #[error("cannot marshal {0} to a guest value")]
    Unmarshallable(&'static str),
    #[error("value nesting exceeds the marshalling depth limit")]
    DepthExceeded,
}

/// Everything `run_code` can report. The evaluation never panics or throws
/// for guest-induced failures; each failure mode lands in exactly one of
/// these kinds.
#[derive(Debug, thiserror::Error)]
pub enum CageError {
    /// Guest code threw, at parse time or at run time.
    #[error("{0}")]
    Guest(GuestError),
    /// A module's `def` failed during setup; evaluation never ran.
    #[error("module registration failed: {0}")]
    ModuleRegistration(anyhow::Error),
    /// A guest microtask threw and nothing caught it.
    #[error("unhandled error in the guest job queue: {0}")]
    JobQueue(GuestError),
    /// An after-script hook failed.
    #[error("after-script hook failed: {0}")]
    Hook(anyhow::Error),
    /// A value could not be marshalled across the boundary.
    #[error(transparent)]
    Marshal(MarshalError),
    /// The engine itself failed; host-originated and not attributable to the
    /// guest program.
    #[error("engine error: {0}")]
    Engine(anyhow::Error),
}

impl CageError {
    /// The human-readable message of the underlying failure, whichever kind
    /// it is.
    pub fn message(&self) -> String {
        match self {
            CageError::Guest(e) | CageError::JobQueue(e) => e.message.clone(),
            CageError::ModuleRegistration(e) | CageError::Hook(e) | CageError::Engine(e) => {
                e.to_string()
            },
            CageError::Marshal(e) => e.to_string(),
        }
    }

    /// Classify an error propagated out of the evaluation pipeline. Typed
    /// kinds pass through; anything untyped is an engine failure.
    pub(crate) fn classify(err: anyhow::Error) -> CageError {
        let err = match err.downcast::<CageError>() {
            Ok(e) => return e,
            Err(err) => err,
        };
        let err = match err.downcast::<MarshalError>() {
            Ok(e) => return CageError::Marshal(e),
            Err(err) => err,
        };
        match err.downcast::<GuestError>() {
            Ok(e) => CageError::Guest(e),
            Err(err) => CageError::Engine(err),
        }
    }
}

/// The outcome of one `run_code` evaluation.
#[derive(Debug)]
pub enum EvalResult {
    Ok,
    Err(CageError),
}

impl EvalResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, EvalResult::Ok)
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    pub fn err(&self) -> Option<&CageError> {
        match self {
            EvalResult::Ok => None,
            EvalResult::Err(e) => Some(e),
        }
    }

    /// Unwrap the error kind, panicking on `Ok`. Test convenience.
    pub fn expect_err(self, context: &str) -> CageError {
        match self {
            EvalResult::Ok => panic!("expected an error: {context}"),
            EvalResult::Err(e) => e,
        }
    }
}

/// Dump a guest exception to its `name` and `message`. Error instances (and
/// subclasses) report their own properties; any other thrown value is
/// stringified through the engine's exception message.
pub fn guest_error_from_exception(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
) -> anyhow::Result<GuestError> {
    if is_instance_of_error(scope, exception) {
        let exception_obj: v8::Local<v8::Object> = exception.try_into()?;
        let name = get_property(scope, exception_obj, "name")?
            .filter(|v| !v.is_undefined())
            .and_then(|v| v.to_string(scope))
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "Error".to_string());
        let message = get_property(scope, exception_obj, "message")?
            .filter(|v| !v.is_undefined())
            .and_then(|v| v.to_string(scope))
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_default();
        return Ok(GuestError { name, message });
    }
    let message = v8::Exception::create_message(scope, exception);
    let message = message.get(scope);
    let message = to_rust_string(scope, &message)?;
    Ok(GuestError {
        name: "Error".to_string(),
        message,
    })
}

/// Render a guest error for sandbox-function failures that must surface into
/// the guest rather than the host.
pub(crate) fn guest_error_from_host_failure(err: &anyhow::Error) -> GuestError {
    if let Some(ge) = err.downcast_ref::<GuestError>() {
        return ge.clone();
    }
    if let Some(me) = err.downcast_ref::<MarshalError>() {
        return GuestError::type_error(me.to_string());
    }
    GuestError::error(err.to_string())
}

#[allow(unused)]
fn _assert_error_types() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<GuestError>();
    assert_send_sync::<MarshalError>();
}
