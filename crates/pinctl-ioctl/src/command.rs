//! ioctl request codes.
//!
//! Builders for the `_IO`, `_IOR`, `_IOW` and `_IOWR` encodings from
//! `<asm-generic/ioctl.h>`, widened to the 64-bit command values the
//! marshaller takes. Direction bits follow the target architecture.

/// `_IO(ty, nr)`: no argument data.
pub const fn io(ty: u8, nr: u8) -> u64 {
    nix::request_code_none!(ty, nr) as u32 as u64
}

/// `_IOR(ty, nr, size)`: the driver writes `size` bytes to user memory.
pub const fn ior(ty: u8, nr: u8, size: usize) -> u64 {
    nix::request_code_read!(ty, nr, size) as u32 as u64
}

/// `_IOW(ty, nr, size)`: the driver reads `size` bytes from user memory.
pub const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
    nix::request_code_write!(ty, nr, size) as u32 as u64
}

/// `_IOWR(ty, nr, size)`: both directions.
pub const fn iowr(ty: u8, nr: u8, size: usize) -> u64 {
    nix::request_code_readwrite!(ty, nr, size) as u32 as u64
}

#[cfg(all(
    test,
    target_os = "linux",
    any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "arm"
    )
))]
mod tests {
    use super::*;

    #[test]
    fn test_spidev_codes() {
        // SPI_IOC_RD_MODE / SPI_IOC_WR_MODE from <linux/spi/spidev.h>
        assert_eq!(ior(b'k', 1, 1), 0x8001_6b01);
        assert_eq!(iow(b'k', 1, 1), 0x4001_6b01);
        // SPI_IOC_MESSAGE(1): one 32-byte spi_ioc_transfer
        assert_eq!(iow(b'k', 0, 32), 0x4020_6b00);
    }

    #[test]
    fn test_io_and_iowr() {
        assert_eq!(io(b'T', 0x01), 0x5401);
        assert_eq!(iowr(b'V', 0, 104), 0xc068_5600);
    }
}
