use std::sync::Once;

use deno_core::v8;

use crate::{
    cage::CageOptions,
    callback_context::CallbackContext,
};

/// Synthetic specifier for the user's script, evaluated in module mode.
pub const MAIN_MODULE_URL: &str = "cage:///main.js";

/// Set a 64KB initial heap size
const INITIAL_HEAP_SIZE: usize = 1 << 16;

static V8_INIT: Once = Once::new();

fn initialize_v8() {
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);

        // Disable `eval` and `new Function()`: scripts arrive as source text
        // through one front door only.
        let argv = vec![
            "".to_owned(), // first arg is ignored
            "--disallow-code-generation-from-strings".to_string(),
        ];
        let misunderstood = v8::V8::set_flags_from_command_line(argv);
        assert_eq!(misunderstood, vec![""]);

        v8::V8::initialize();
    });
}

/// Thin wrapper over `v8::OwnedIsolate` carrying the sandbox configuration.
/// One is created per evaluation and torn down with it; isolates are never
/// shared or reused across evaluations.
pub struct Isolate {
    v8_isolate: v8::OwnedIsolate,
}

impl Isolate {
    pub fn new(options: &CageOptions) -> Self {
        initialize_v8();

        let mut create_params = v8::CreateParams::default();
        if let Some(max_heap) = options.max_heap_size_bytes {
            create_params = create_params.heap_limits(INITIAL_HEAP_SIZE, max_heap);
        }
        let mut v8_isolate = v8::Isolate::new(create_params);

        // Tells V8 to capture current stack trace when uncaught exception occurs and
        // report it to the message listeners. The option is off by default.
        v8_isolate.set_capture_stack_trace_for_uncaught_exceptions(
            true, // capture
            10,   // frame_limit
        );

        // We never support the `import.meta` object, so set the callback at this layer.
        v8_isolate
            .set_host_initialize_import_meta_object_callback(CallbackContext::import_meta_callback);

        // Dynamic `import()` parks a promise on the context state; the pump
        // loop services it between job drains.
        v8_isolate
            .set_host_import_module_dynamically_callback(CallbackContext::dynamic_import_callback);

        // Disallow synchronous `Atomics.wait`.
        v8_isolate.set_allow_atomics_wait(false);

        // The job queue is drained only when the evaluation pipeline says so.
        v8_isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        v8_isolate.set_promise_reject_callback(CallbackContext::promise_reject_callback);

        Self { v8_isolate }
    }

    pub fn handle_scope(&mut self) -> v8::HandleScope<'_, ()> {
        v8::HandleScope::new(&mut self.v8_isolate)
    }
}
