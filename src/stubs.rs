//! Extern "C" entry points for native addon code
//!
//! This is the whole ABI surface. Everything crosses as either a NaN-boxed
//! u64 value handle or an opaque pointer; the runtime's concrete types
//! never appear in a signature, so addons compiled against one ABI version
//! stay compatible across runtime-internal changes.
//!
//! The calling convention follows the rest of the runtime's stubs:
//! - Script values are passed and returned as u64 (NaN-boxed)
//! - Out-params are raw pointers written only on `Status::Ok`
//! - Null pointers are rejected with `Status::InvalidArg` before anything
//!   else is looked at

use std::ffi::c_void;

use crate::abi::QuillValue;
use crate::abi_version::ABI_VERSION;
use crate::env::{AsyncContext, Environment};
use crate::error::Status;
use crate::heap::{heap, NativeObject, ObjectHeader, ObjectKind};
use crate::scope::CallbackScope;

/// Opaque handle to an async operation registered with `quill_async_init`.
#[allow(non_camel_case_types)]
pub type quill_async_context = *mut c_void;

/// Opaque handle to an open callback scope.
#[allow(non_camel_case_types)]
pub type quill_callback_scope = *mut c_void;

// =========================================================================
// Callback Scope Stubs
// =========================================================================

/// Open a callback scope for the async operation `async_context`, with
/// `resource_value` (an object) describing the operation to diagnostics.
///
/// On success writes the scope handle to `result` and returns `Ok`. The
/// handle must be passed to `quill_close_callback_scope` exactly once,
/// and nested scopes must close in reverse order of opening.
///
/// Must be called on the thread the environment is bound to.
#[unsafe(no_mangle)]
pub extern "C" fn quill_open_callback_scope(
    async_context: quill_async_context,
    resource_value: u64,
    result: *mut quill_callback_scope,
) -> Status {
    if async_context.is_null() || result.is_null() {
        return Status::InvalidArg;
    }
    let env = match Environment::current() {
        Ok(env) => env,
        Err(err) => return err.status(),
    };
    let ctx = unsafe { &*(async_context as *const AsyncContext) };
    match CallbackScope::open(env, QuillValue::from_bits(resource_value), ctx) {
        Ok(scope) => {
            unsafe {
                *result = Box::into_raw(scope) as quill_callback_scope;
            }
            Status::Ok
        }
        Err(err) => err.status(),
    }
}

/// Close a callback scope previously opened with
/// `quill_open_callback_scope`.
///
/// Passing a handle that was never opened, or closing twice, is a
/// contract violation: debug builds detect it and abort; release builds
/// document it as undefined.
#[unsafe(no_mangle)]
pub extern "C" fn quill_close_callback_scope(scope: quill_callback_scope) -> Status {
    if scope.is_null() {
        return Status::InvalidArg;
    }
    #[cfg(debug_assertions)]
    if !crate::scope::handle_is_live(scope as usize) {
        panic!(
            "quill_close_callback_scope: handle {:p} was never opened or is already closed",
            scope
        );
    }
    let scope = unsafe { Box::from_raw(scope as *mut CallbackScope) };
    scope.close();
    Status::Ok
}

// =========================================================================
// Async Operation Stubs
// =========================================================================

/// Register a new async operation. `resource_value` must be an object;
/// `name` is a UTF-8 label for diagnostics (may be null when `name_len`
/// is 0). Writes the context handle to `result` on success.
#[unsafe(no_mangle)]
pub extern "C" fn quill_async_init(
    resource_value: u64,
    name: *const u8,
    name_len: usize,
    result: *mut quill_async_context,
) -> Status {
    if result.is_null() || (name.is_null() && name_len != 0) {
        return Status::InvalidArg;
    }
    let env = match Environment::current() {
        Ok(env) => env,
        Err(err) => return err.status(),
    };
    let name = if name_len == 0 {
        ""
    } else {
        let slice = unsafe { std::slice::from_raw_parts(name, name_len) };
        match std::str::from_utf8(slice) {
            Ok(s) => s,
            Err(_) => return Status::StringExpected,
        }
    };
    match env.async_init(QuillValue::from_bits(resource_value), name) {
        Ok(ctx) => {
            unsafe {
                *result = Box::into_raw(Box::new(ctx)) as quill_async_context;
            }
            Status::Ok
        }
        Err(err) => err.status(),
    }
}

/// Destroy an async operation handle created by `quill_async_init`.
#[unsafe(no_mangle)]
pub extern "C" fn quill_async_destroy(async_context: quill_async_context) -> Status {
    if async_context.is_null() {
        return Status::InvalidArg;
    }
    let env = match Environment::current() {
        Ok(env) => env,
        Err(err) => return err.status(),
    };
    let ctx = unsafe { Box::from_raw(async_context as *mut AsyncContext) };
    env.async_destroy(*ctx);
    Status::Ok
}

/// Depth of the current thread's async-context stack, or 0 when no
/// environment is bound. Diagnostic accessor.
#[unsafe(no_mangle)]
pub extern "C" fn quill_async_stack_depth() -> u64 {
    match Environment::current() {
        Ok(env) => env.stack_depth() as u64,
        Err(_) => 0,
    }
}

// =========================================================================
// Allocation Stubs
// =========================================================================

/// Allocate a new empty object.
///
/// Returns a value handle containing the object pointer, or undefined on
/// failure.
#[unsafe(no_mangle)]
pub extern "C" fn quill_alloc_object() -> u64 {
    match heap().alloc_object() {
        Some(ptr) => QuillValue::pointer(ptr).to_bits(),
        None => QuillValue::undefined().to_bits(),
    }
}

/// Allocate a new string from UTF-8 bytes.
///
/// Returns a value handle containing the string pointer, or undefined on
/// failure.
#[unsafe(no_mangle)]
pub extern "C" fn quill_alloc_string(data: *const u8, len: usize) -> u64 {
    if data.is_null() {
        return QuillValue::undefined().to_bits();
    }

    let s = unsafe {
        let slice = std::slice::from_raw_parts(data, len);
        match std::str::from_utf8(slice) {
            Ok(s) => s,
            Err(_) => return QuillValue::undefined().to_bits(),
        }
    };

    match heap().alloc_string(s) {
        Some(ptr) => QuillValue::pointer(ptr).to_bits(),
        None => QuillValue::undefined().to_bits(),
    }
}

// =========================================================================
// Property Access Stubs
// =========================================================================

/// Get a named property from an object. Returns undefined when the value
/// is not an object or the property is absent.
#[unsafe(no_mangle)]
pub extern "C" fn quill_get_named_property(object: u64, key: *const u8, key_len: usize) -> u64 {
    let val = QuillValue::from_bits(object);
    let ptr = match val.as_pointer() {
        Some(p) if heap().contains(p) => p,
        _ => return QuillValue::undefined().to_bits(),
    };

    let key_str = unsafe {
        let slice = std::slice::from_raw_parts(key, key_len);
        match std::str::from_utf8(slice) {
            Ok(s) => s,
            Err(_) => return QuillValue::undefined().to_bits(),
        }
    };

    unsafe {
        let header = ptr.as_ref::<ObjectHeader>();
        match header.kind {
            ObjectKind::Object => ptr
                .as_ref::<NativeObject>()
                .get_property(key_str)
                .unwrap_or_else(|| QuillValue::undefined().to_bits()),
            ObjectKind::String => QuillValue::undefined().to_bits(),
        }
    }
}

/// Set a named property on an object. Non-object values are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn quill_set_named_property(
    object: u64,
    key: *const u8,
    key_len: usize,
    value: u64,
) {
    let val = QuillValue::from_bits(object);
    let ptr = match val.as_pointer() {
        Some(p) if heap().contains(p) => p,
        _ => return,
    };

    let key_str = unsafe {
        let slice = std::slice::from_raw_parts(key, key_len);
        match std::str::from_utf8(slice) {
            Ok(s) => s,
            Err(_) => return,
        }
    };

    unsafe {
        let header = ptr.as_ref::<ObjectHeader>();
        if header.kind == ObjectKind::Object {
            ptr.as_mut::<NativeObject>().set_property(key_str, value);
        }
    }
}

// =========================================================================
// Version Stubs
// =========================================================================

/// The ABI version this runtime build speaks.
#[unsafe(no_mangle)]
pub extern "C" fn quill_abi_version() -> u32 {
    ABI_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> quill_async_context {
        Environment::init();
        let resource = quill_alloc_object();
        let name = "test.op";
        let mut ctx: quill_async_context = std::ptr::null_mut();
        let status = quill_async_init(resource, name.as_ptr(), name.len(), &mut ctx);
        assert_eq!(status, Status::Ok);
        assert!(!ctx.is_null());
        ctx
    }

    #[test]
    fn test_open_close_roundtrip() {
        let ctx = make_context();
        let depth = quill_async_stack_depth();

        let mut scope: quill_callback_scope = std::ptr::null_mut();
        let status = quill_open_callback_scope(ctx, quill_alloc_object(), &mut scope);
        assert_eq!(status, Status::Ok);
        assert!(!scope.is_null());
        assert_eq!(quill_async_stack_depth(), depth + 1);

        assert_eq!(quill_close_callback_scope(scope), Status::Ok);
        assert_eq!(quill_async_stack_depth(), depth);

        assert_eq!(quill_async_destroy(ctx), Status::Ok);
    }

    #[test]
    fn test_open_rejects_primitive_resource() {
        let ctx = make_context();

        let mut scope: quill_callback_scope = std::ptr::null_mut();
        let status =
            quill_open_callback_scope(ctx, QuillValue::number(3.0).to_bits(), &mut scope);
        assert_eq!(status, Status::ObjectExpected);
        // The out-param is untouched on failure
        assert!(scope.is_null());

        assert_eq!(quill_async_destroy(ctx), Status::Ok);
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        let ctx = make_context();

        let mut scope: quill_callback_scope = std::ptr::null_mut();
        assert_eq!(
            quill_open_callback_scope(std::ptr::null_mut(), quill_alloc_object(), &mut scope),
            Status::InvalidArg
        );
        assert_eq!(
            quill_open_callback_scope(ctx, quill_alloc_object(), std::ptr::null_mut()),
            Status::InvalidArg
        );
        assert_eq!(quill_close_callback_scope(std::ptr::null_mut()), Status::InvalidArg);
        assert_eq!(quill_async_destroy(std::ptr::null_mut()), Status::InvalidArg);

        assert_eq!(quill_async_destroy(ctx), Status::Ok);
    }

    #[test]
    fn test_property_stubs() {
        Environment::init();
        let obj = quill_alloc_object();
        let key = "kind";
        let value = quill_alloc_string("timer".as_ptr(), 5);

        quill_set_named_property(obj, key.as_ptr(), key.len(), value);
        let got = quill_get_named_property(obj, key.as_ptr(), key.len());
        assert_eq!(got, value);

        // Property reads on primitives yield undefined
        let missing = quill_get_named_property(
            QuillValue::number(1.0).to_bits(),
            key.as_ptr(),
            key.len(),
        );
        assert!(QuillValue::from_bits(missing).is_undefined());
    }

    #[test]
    fn test_abi_version_stub() {
        assert_eq!(quill_abi_version(), ABI_VERSION);
    }
}
