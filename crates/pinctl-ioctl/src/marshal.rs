//! The two ioctl entry points.
//!
//! Order of checks for the structured form: descriptor, table shape (byte
//! order, framing, parity), offsets normalization, payload normalization,
//! bounds. Only then is the invoker reached. Results are copied back into a
//! staged payload after a successful call and never after a failed one.

use std::os::unix::io::RawFd;

use crate::buffer::{self, OffsetTable, Payload};
use crate::error::{ArgumentError, IoctlError, Result};
use crate::invoker::{IoctlInvoker, SysInvoker};
use crate::offsets::validate;
use crate::scratch::{self, ScratchSlot};

/// Map a raw call result to the driver's value or a typed failure.
pub fn translate(result: i32) -> Result<i32> {
    if result < 0 {
        Err(IoctlError::Failure {
            errno: result.saturating_neg(),
        })
    } else {
        Ok(result)
    }
}

fn check_fd(fd: RawFd) -> Result<RawFd> {
    if fd < 1 {
        return Err(IoctlError::InvalidDescriptor { fd });
    }
    Ok(fd)
}

/// Runs ioctls through an [`IoctlInvoker`].
///
/// The marshaller keeps no state of its own: scratch buffers belong to the
/// calling thread, and the descriptor belongs to the caller. Calls on the
/// same descriptor from several threads are not serialized here.
#[derive(Debug, Clone, Default)]
pub struct Marshaller<I = SysInvoker> {
    invoker: I,
}

impl Marshaller<SysInvoker> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<I: IoctlInvoker> Marshaller<I> {
    pub fn with_invoker(invoker: I) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Issue an ioctl whose argument is a plain integer.
    ///
    /// # Safety
    ///
    /// `command` must be valid for `fd`. If the driver interprets `value` as
    /// an address, it must be one the driver may access. The call blocks
    /// until the driver returns and cannot be cancelled.
    pub unsafe fn ioctl(&self, fd: RawFd, command: u64, value: i32) -> Result<i32> {
        let fd = check_fd(fd)?;
        translate(self.invoker.ioctl_scalar(fd, command, value))
    }

    /// Issue an ioctl whose argument is a C struct image with embedded
    /// pointers.
    ///
    /// Each `(hole, target)` pair in `offsets` makes the hole point at the
    /// target byte of the payload as seen by the driver. A staged payload is
    /// updated with the driver's response on success.
    ///
    /// # Safety
    ///
    /// `command` must be valid for `fd`, and `payload` must be laid out the
    /// way the native compiler lays out the driver's struct, so the driver
    /// never reads or writes past what the payload and its relocated pointers
    /// describe. The call blocks until the driver returns and cannot be
    /// cancelled.
    pub unsafe fn ioctl_structured(
        &self,
        fd: RawFd,
        command: u64,
        payload: Payload<'_>,
        offsets: OffsetTable<'_>,
    ) -> Result<i32> {
        let fd = check_fd(fd)?;
        offsets.check_shape()?;

        scratch::with_slot(ScratchSlot::Offsets, |table_scratch| -> Result<i32> {
            let relocations = buffer::normalize_table(&offsets, table_scratch)?;
            scratch::with_slot(ScratchSlot::Payload, |data_scratch| -> Result<i32> {
                let mut staged = buffer::normalize_payload(payload, data_scratch)?;
                validate(relocations, staged.region.len())?;

                let rc = self.invoker.ioctl_structured(
                    fd,
                    command,
                    &mut *staged.region,
                    relocations,
                );
                let value = translate(rc)?;
                staged.copy_back();
                Ok(value)
            })
        })
    }

    /// Structured ioctl over raw pointers, for foreign callers.
    ///
    /// `data` is treated as non-stable memory and staged through scratch.
    /// `count` is the number of offset entries, not pairs.
    ///
    /// # Safety
    ///
    /// As for [`Marshaller::ioctl_structured`]; in addition, non-null `data`
    /// must be valid for `len` bytes of reads and writes and non-null
    /// `offsets` valid for `count` reads, neither aliased during the call.
    pub unsafe fn ioctl_structured_raw(
        &self,
        fd: RawFd,
        command: u64,
        data: *mut u8,
        len: usize,
        offsets: *const isize,
        count: usize,
    ) -> Result<i32> {
        if data.is_null() {
            return Err(ArgumentError::NullPayload.into());
        }
        if offsets.is_null() {
            return Err(ArgumentError::NullOffsets.into());
        }
        let align = std::mem::align_of::<isize>();
        if offsets as usize % align != 0 {
            return Err(ArgumentError::MisalignedOffsets { align }.into());
        }
        let payload = std::slice::from_raw_parts_mut(data, len);
        let table = std::slice::from_raw_parts(offsets, count);
        self.ioctl_structured(fd, command, Payload::staged(payload), OffsetTable::new(table))
    }
}

/// Scalar ioctl through the system invoker.
///
/// # Safety
///
/// See [`Marshaller::ioctl`].
pub unsafe fn ioctl(fd: RawFd, command: u64, value: i32) -> Result<i32> {
    Marshaller::new().ioctl(fd, command, value)
}

/// Structured ioctl through the system invoker.
///
/// # Safety
///
/// See [`Marshaller::ioctl_structured`].
pub unsafe fn ioctl_structured(
    fd: RawFd,
    command: u64,
    payload: Payload<'_>,
    offsets: OffsetTable<'_>,
) -> Result<i32> {
    Marshaller::new().ioctl_structured(fd, command, payload, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate() {
        assert_eq!(translate(0), Ok(0));
        assert_eq!(translate(7), Ok(7));
        assert_eq!(translate(-5), Err(IoctlError::Failure { errno: 5 }));
        assert_eq!(
            translate(i32::MIN),
            Err(IoctlError::Failure { errno: i32::MAX })
        );
    }

    #[test]
    fn test_invalid_descriptors() {
        for fd in [-1, 0] {
            let err = unsafe { ioctl(fd, 0, 0) }.unwrap_err();
            assert_eq!(err, IoctlError::InvalidDescriptor { fd });
        }
    }

    #[test]
    fn test_raw_rejects_null_pointers() {
        let marshaller = Marshaller::new();
        let mut data = [0u8; 8];
        let table = [0isize; 2];

        let err = unsafe {
            marshaller.ioctl_structured_raw(3, 0, std::ptr::null_mut(), 8, table.as_ptr(), 2)
        };
        assert_eq!(
            err,
            Err(IoctlError::InvalidArgument(ArgumentError::NullPayload))
        );

        let err = unsafe {
            marshaller.ioctl_structured_raw(3, 0, data.as_mut_ptr(), 8, std::ptr::null(), 0)
        };
        assert_eq!(
            err,
            Err(IoctlError::InvalidArgument(ArgumentError::NullOffsets))
        );
    }

    #[test]
    fn test_raw_rejects_misaligned_table() {
        let marshaller = Marshaller::new();
        let mut data = [0u8; 8];
        let table = [0isize; 3];
        let misaligned = unsafe { (table.as_ptr() as *const u8).add(1) } as *const isize;
        let err = unsafe {
            marshaller.ioctl_structured_raw(3, 0, data.as_mut_ptr(), 8, misaligned, 2)
        };
        assert!(matches!(
            err,
            Err(IoctlError::InvalidArgument(ArgumentError::MisalignedOffsets { .. }))
        ));
    }
}
