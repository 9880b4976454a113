use deno_core::v8;

/// An ASCII string the runtime preallocates as a V8 external one-byte
/// string, so repeated guest interactions don't re-copy it onto the heap.
pub struct StaticString {
    string: &'static str,
}

impl StaticString {
    const fn new(string: &'static str) -> Self {
        Self { string }
    }

    pub fn create<'s>(
        &'static self,
        scope: &mut v8::HandleScope<'s, ()>,
    ) -> anyhow::Result<v8::Local<'s, v8::String>> {
        v8::String::new_external_onebyte_static(scope, self.string.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("Failed to create static string for {:?}", self.string))
    }

    pub fn rust_str(&self) -> &'static str {
        self.string
    }
}

macro_rules! declare_strings {
    ($s:ident $(,)?) => {
        #[allow(non_upper_case_globals)]
        pub const $s: StaticString = StaticString::new(stringify!($s));
    };

    ($name:ident => $s:expr $(,)?) => {
        #[allow(non_upper_case_globals)]
        pub const $name: StaticString = StaticString::new($s);
    };

    ($s:ident , $($rest:tt)*) => {
        declare_strings!($s);
        declare_strings!($($rest)*);
    };

    ($s:ident => $v:expr , $($rest:tt)*) => {
        declare_strings!($s => $v);
        declare_strings!($($rest)*);
    };
}

// Preallocate static strings the runtime uses when talking to the guest. A
// bare identifier declares that identifier as its own string; the
// `$name => $string` syntax names the string explicitly.
declare_strings!(
    cage_ref => "__cageRef",
    empty => "",
    import_meta_unsupported => "import.meta unsupported",
    internal_error => "the sandbox host encountered an internal error",
    name,
);
