//! The native call boundary.
//!
//! Invokers return the raw call result: `>= 0` is the driver's value,
//! negative is a negated `errno`. They never retry.

use std::os::unix::io::RawFd;

use libc::c_int;
use nix::errno::Errno;

use crate::buffer::Relocations;
use crate::offsets;

/// Performs the actual device-control call.
///
/// Implemented by [`SysInvoker`] for the real system call, and by test
/// doubles that record calls without touching the OS.
pub trait IoctlInvoker {
    /// Pass `value` directly as the ioctl argument.
    ///
    /// # Safety
    ///
    /// `command` must be valid for `fd`; if the driver treats `value` as an
    /// address it must point at memory the driver may access.
    unsafe fn ioctl_scalar(&self, fd: RawFd, command: u64, value: i32) -> i32;

    /// Relocate every hole of `payload`, then pass the payload's base address
    /// as the ioctl argument.
    ///
    /// # Safety
    ///
    /// `command` must be valid for `fd` and the driver must not access memory
    /// outside `payload` beyond what the relocated pointers describe.
    unsafe fn ioctl_structured(
        &self,
        fd: RawFd,
        command: u64,
        payload: &mut [u8],
        relocations: Relocations<'_>,
    ) -> i32;
}

/// Invoker backed by `libc::ioctl`. Blocks the calling thread until the
/// driver returns; there is no way to cancel it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysInvoker;

impl SysInvoker {
    fn result(rc: c_int) -> i32 {
        if rc < 0 {
            -(Errno::last() as i32)
        } else {
            rc
        }
    }
}

impl IoctlInvoker for SysInvoker {
    unsafe fn ioctl_scalar(&self, fd: RawFd, command: u64, value: i32) -> i32 {
        Self::result(libc::ioctl(fd, command as _, value as c_int))
    }

    unsafe fn ioctl_structured(
        &self,
        fd: RawFd,
        command: u64,
        payload: &mut [u8],
        relocations: Relocations<'_>,
    ) -> i32 {
        // Marshaller validates before calling, so only direct callers get
        // here with a bad table. They see EINVAL and no syscall is made.
        if offsets::relocate(payload, relocations).is_err() {
            return -libc::EINVAL;
        }
        Self::result(libc::ioctl(fd, command as _, payload.as_mut_ptr()))
    }
}

impl<I: IoctlInvoker + ?Sized> IoctlInvoker for &I {
    unsafe fn ioctl_scalar(&self, fd: RawFd, command: u64, value: i32) -> i32 {
        (**self).ioctl_scalar(fd, command, value)
    }

    unsafe fn ioctl_structured(
        &self,
        fd: RawFd,
        command: u64,
        payload: &mut [u8],
        relocations: Relocations<'_>,
    ) -> i32 {
        (**self).ioctl_structured(fd, command, payload, relocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{normalize_table, OffsetTable};
    use crate::scratch::{self, ScratchSlot};

    #[test]
    fn test_bad_table_rejected_without_syscall() {
        let mut payload = [0u8; 8];
        let rc = scratch::with_slot(ScratchSlot::Offsets, |s| {
            let relocations = normalize_table(&OffsetTable::new(&[0, 64]), s)?;
            // An fd of -1 would give EBADF if the call reached the kernel.
            Ok(unsafe { SysInvoker.ioctl_structured(-1, 0, &mut payload, relocations) })
        })
        .unwrap();
        assert_eq!(rc, -libc::EINVAL);
        assert_eq!(payload, [0u8; 8]);
    }

    #[test]
    fn test_kernel_errno_is_negated() {
        let rc = unsafe { SysInvoker.ioctl_scalar(-1, 0, 0) };
        assert_eq!(rc, -libc::EBADF);
    }
}
