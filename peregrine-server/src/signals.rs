//! Self-pipe signal plumbing.
//!
//! The handler does the one async-signal-safe thing it can: write the
//! signal number into a nonblocking pipe the reactor watches. `SIGPIPE` is
//! ignored so a peer reset during `writev` surfaces as `EPIPE` instead of
//! killing the process.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = sig as u8;
    // Only write(2) here, and errno is restored for the interrupted code.
    unsafe {
        let saved = *libc::__errno_location();
        let _ = libc::write(fd, (&byte as *const u8).cast(), 1);
        *libc::__errno_location() = saved;
    }
}

/// Route `SIGALRM` and `SIGTERM` into `pipe_wr` and ignore `SIGPIPE`.
pub fn install(pipe_wr: RawFd) -> nix::Result<()> {
    SIGNAL_PIPE_WR.store(pipe_wr, Ordering::Relaxed);

    let forward = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::all(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGALRM, &forward)?;
        sigaction(Signal::SIGTERM, &forward)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}
