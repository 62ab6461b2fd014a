//! ABI identity constants
//!
//! Addons record the version they were compiled against and compare it to
//! `quill_abi_version()` at load time. Any breaking change to the value
//! encoding, the status codes, or an entry-point signature requires a
//! bump here.

/// Version of the native-addon ABI this build speaks.
pub const ABI_VERSION: u32 = 1;

/// Name of the ABI, for addon loader diagnostics.
pub const ABI_NAME: &str = "quill";
