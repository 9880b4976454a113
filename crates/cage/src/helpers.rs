use anyhow::anyhow;
use deno_core::v8;

use crate::{
    error::GuestError,
    strings,
};

// The below methods were taken from `deno_core`
// https://github.com/denoland/deno_core/blob/main/LICENSE.md - MIT License
// Copyright 2018-2024 the Deno authors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

/// Taken from `deno_core::bindings::module_origin`.
pub fn module_origin<'a>(
    s: &mut v8::HandleScope<'a>,
    resource_name: v8::Local<'a, v8::String>,
    is_module: bool,
) -> v8::ScriptOrigin<'a> {
    let source_map_url = strings::empty.create(s).unwrap();
    v8::ScriptOrigin::new(
        s,
        resource_name.into(),  // resource_name
        0,                     // resource_line_offset
        0,                     // resource_column_offset
        false,                 // resource_is_shared_cross_origin
        0,                     // script_id
        source_map_url.into(), // source_map_url
        true,                  // resource_is_opaque
        false,                 // is_wasm
        is_module,             // is_module
    )
}

/// Taken from `deno_core::bindings::throw_type_error`.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: impl AsRef<str>) {
    let message = v8::String::new(scope, message.as_ref()).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}

/// Taken from `deno_core`'s string helpers.
pub fn to_rust_string(scope: &mut v8::Isolate, s: &v8::String) -> anyhow::Result<String> {
    let n = s.utf8_length(scope);
    let mut buf = vec![0; n];
    // Don't set `REPLACE_INVALID_UTF8` since we want unpaired surrogates to fail
    // the UTF8 check below.
    let opts = v8::WriteOptions::NO_NULL_TERMINATION;
    let num_written = s.write_utf8(scope, &mut buf, None, opts);
    anyhow::ensure!(n == num_written);
    let s = String::from_utf8(buf)?;
    Ok(s)
}

/// Taken from `deno_core`'s error-introspection helpers.
pub fn get_property<'a>(
    scope: &mut v8::HandleScope<'a>,
    object: v8::Local<v8::Object>,
    key: &str,
) -> anyhow::Result<Option<v8::Local<'a, v8::Value>>> {
    let key = v8::String::new(scope, key).ok_or_else(|| anyhow!("Failed to create string for {key}"))?;
    Ok(object.get(scope, key.into()))
}

/// Throw `err` into the guest as an exception carrying its name and message.
pub fn throw_guest_error(scope: &mut v8::HandleScope, err: &GuestError) {
    let Some(message) = v8::String::new(scope, &err.message) else {
        // If we can't even allocate the message string, fall back to a static
        // error so the guest still observes a throw.
        let message = strings::internal_error
            .create(scope)
            .expect("failed to create static error string");
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
        return;
    };
    let exception = if err.name == "TypeError" {
        v8::Exception::type_error(scope, message)
    } else if err.name == "RangeError" {
        v8::Exception::range_error(scope, message)
    } else {
        let exception = v8::Exception::error(scope, message);
        if err.name != "Error" {
            if let (Some(obj), Ok(key), Some(name)) = (
                exception.to_object(scope),
                strings::name.create(scope),
                v8::String::new(scope, &err.name),
            ) {
                obj.set(scope, key.into(), name.into());
            }
        }
        exception
    };
    scope.throw_exception(exception);
}
