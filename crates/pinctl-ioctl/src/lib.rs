//! # pinctl-ioctl
//!
//! Structured ioctl marshalling for device drivers that take C structs with
//! embedded pointers.
//!
//! A caller builds the struct image as bytes, leaving pointer-width holes,
//! and describes each hole with an `(hole, target)` offset pair. The
//! marshaller makes sure the bytes sit at a stable address, fills every hole
//! with the absolute address of its target inside that same region, calls
//! `ioctl`, and maps the result to `Ok(value)` or a typed error.
//!
//! ```no_run
//! use pinctl_ioctl::{command, Access, DeviceFile, OffsetTable, Payload};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dev = DeviceFile::open("/dev/spidev0.0", Access::ReadWrite)?;
//!
//! // struct { u64 tx_buf; ... } followed by the tx bytes at offset 32.
//! let mut msg = vec![0u8; 32 + 4];
//! msg[32..].copy_from_slice(&[0x9f, 0, 0, 0]);
//! msg[16..20].copy_from_slice(&4u32.to_ne_bytes());
//! let offsets = [0isize, 32];
//!
//! unsafe {
//!     dev.ioctl_structured(
//!         command::iow(b'k', 0, 32),
//!         Payload::staged(&mut msg),
//!         OffsetTable::new(&offsets),
//!     )?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Staging
//!
//! Payloads that are not in stable memory are copied into a per-thread
//! scratch buffer of [`SCRATCH_CAPACITY`] bytes, and copied back after a
//! successful call. Larger payloads must be supplied as [`StableBuf`] or a
//! memory mapping.
//!
//! ## Blocking
//!
//! Every call blocks the calling thread until the driver returns and cannot
//! be cancelled. Nothing here serializes calls on one descriptor.

pub mod buffer;
pub mod command;
pub mod error;
pub mod file;
pub mod invoker;
pub mod marshal;
pub mod offsets;
pub mod scratch;

pub use buffer::{
    ByteOrder, OffsetTable, Payload, Relocations, StableBuf, StableMemory, STABLE_ALIGN,
    WORD_SIZE,
};
pub use error::{ArgumentError, IoctlError, OffsetKind, Result};
pub use file::{Access, DeviceFile, MapMode};
pub use invoker::{IoctlInvoker, SysInvoker};
pub use marshal::{ioctl, ioctl_structured, translate, Marshaller};
pub use offsets::{relocate, validate};
pub use scratch::{thread_allocations, ScratchSlot, SCRATCH_CAPACITY};
