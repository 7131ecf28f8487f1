/// Provide interoperability with C return values and errno codes.
pub(crate) mod interop;

/// Poison-tolerant lock helpers.
pub(crate) mod sync;
