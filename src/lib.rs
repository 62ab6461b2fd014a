//! quill-native: native-addon interop kernel for the Quill runtime
//!
//! Native addon code that invokes script-visible callbacks from outside
//! the normal call stack (thread-pool completions, timers, I/O) must tell
//! the runtime it is executing "inside" a specific async operation, or
//! async stack traces and diagnostic hooks go wrong. This crate is that
//! bridge:
//!
//! - `abi`: the NaN-boxed value handle and opaque-handle conversion
//! - `heap`: the object heap backing async resource objects
//! - `env`: per-thread environment, async contexts, diagnostic hooks
//! - `scope`: callback scope open/close with LIFO enforcement
//! - `stubs`: the extern "C" surface addons link against
//! - `executor`: futures polled on the runtime thread, every poll
//!   bracketed by a callback scope

pub mod abi;
pub mod abi_version;
pub mod env;
pub mod error;
pub mod heap;
pub mod scope;
pub mod stubs;

#[cfg(feature = "executor")]
pub mod executor;

pub use abi::QuillValue;
pub use abi_version::{ABI_NAME, ABI_VERSION};
pub use env::{AsyncContext, Environment, HookEvent};
pub use error::{Error, Result, Status};
pub use heap::{HeapPtr, NativeHeap};
pub use scope::{CallbackScope, ScopeGuard};

#[cfg(feature = "executor")]
pub use executor::ScopedExecutor;
