use anyhow::anyhow;
use deno_core::v8;

/// A host-held reference to a guest value.
///
/// The engine's values are garbage collected; a `Handle` pins one of them as
/// a GC root for as long as the handle is alive. Each handle must be released
/// exactly once, either explicitly via [`Handle::dispose`] or by a managing
/// [`Scope`](crate::scope::Scope) at evaluation teardown. [`Handle::dup`]
/// yields an additional, independently-owned root for the same value.
pub struct Handle {
    raw: Option<v8::Global<v8::Value>>,
}

impl Handle {
    pub(crate) fn new(scope: &mut v8::HandleScope<'_>, value: v8::Local<'_, v8::Value>) -> Self {
        Self {
            raw: Some(v8::Global::new(scope, value)),
        }
    }

    /// Produce an additional owner of the referenced value.
    pub fn dup(&self) -> Handle {
        debug_assert!(self.raw.is_some(), "dup() on a disposed handle");
        Self {
            raw: self.raw.clone(),
        }
    }

    /// Release this handle's root. Releasing an already-disposed handle is a
    /// bug caught in debug builds and a no-op in release builds.
    pub fn dispose(&mut self) {
        debug_assert!(self.raw.is_some(), "dispose() on a disposed handle");
        self.raw = None;
    }

    pub fn is_alive(&self) -> bool {
        self.raw.is_some()
    }

    pub(crate) fn global(&self) -> anyhow::Result<&v8::Global<v8::Value>> {
        self.raw
            .as_ref()
            .ok_or_else(|| anyhow!("use of a disposed handle"))
    }

    /// Reopen the referenced value as a local inside `scope`.
    pub(crate) fn open<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> anyhow::Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Local::new(scope, self.global()?))
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
