use std::io;

/// Converts a C return value to a Rust `Result`, reading `errno` on failure.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Make an [`io::Error`] out of an errno value.
#[inline(always)]
pub(crate) fn from_errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Converts a C return value that carries the error code itself (as the
/// `ibv_*` verbs do) to a Rust `Result`.
#[allow(unused)]
#[inline(always)]
pub(crate) fn from_c_err(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret.abs()))
    }
}
