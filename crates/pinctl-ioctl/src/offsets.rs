//! Relocation table validation and pointer relocation.
//!
//! This is the only module that turns offsets into absolute addresses.

use crate::buffer::{Relocations, WORD_SIZE};
use crate::error::{IoctlError, OffsetKind, Result};

/// Check every `(hole, target)` pair against a payload of `capacity` bytes.
///
/// A target must address a payload byte; a hole must hold a whole pointer.
/// Parity and byte order were already checked when the table was shaped.
pub fn validate(relocations: Relocations<'_>, capacity: usize) -> Result<()> {
    for (hole, target) in relocations.pairs() {
        if !fits(target, 1, capacity) {
            return Err(IoctlError::OutOfBounds {
                kind: OffsetKind::Target,
                offset: target,
                capacity,
            });
        }
        if !fits(hole, WORD_SIZE, capacity) {
            return Err(IoctlError::OutOfBounds {
                kind: OffsetKind::Hole,
                offset: hole,
                capacity,
            });
        }
    }
    Ok(())
}

fn fits(offset: isize, width: usize, capacity: usize) -> bool {
    usize::try_from(offset)
        .ok()
        .and_then(|start| start.checked_add(width))
        .is_some_and(|end| end <= capacity)
}

/// Write, for every pair, the address of `payload[target]` into
/// `payload[hole..hole + WORD_SIZE]` in native byte order.
///
/// Validates first, so a bad table never writes anything.
pub fn relocate(payload: &mut [u8], relocations: Relocations<'_>) -> Result<()> {
    validate(relocations, payload.len())?;
    let base = payload.as_mut_ptr() as usize;
    for (hole, target) in relocations.pairs() {
        let hole = hole as usize;
        let addr = base + target as usize;
        payload[hole..hole + WORD_SIZE].copy_from_slice(&addr.to_ne_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{normalize_table, OffsetTable};
    use crate::scratch::{self, ScratchSlot};

    fn with_table<R>(words: &[isize], f: impl FnOnce(Relocations<'_>) -> R) -> R {
        scratch::with_slot(ScratchSlot::Offsets, |s| {
            let table = OffsetTable::new(words);
            table.check_shape().unwrap();
            Ok(f(normalize_table(&table, s)?))
        })
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_last_word() {
        let cap = 4 * WORD_SIZE;
        let hole = (cap - WORD_SIZE) as isize;
        with_table(&[hole, 0], |r| assert!(validate(r, cap).is_ok()));
    }

    #[test]
    fn test_validate_rejects_target_at_capacity() {
        with_table(&[0, 16], |r| {
            assert_eq!(
                validate(r, 16),
                Err(IoctlError::OutOfBounds {
                    kind: OffsetKind::Target,
                    offset: 16,
                    capacity: 16
                })
            );
        });
    }

    #[test]
    fn test_validate_rejects_negative_offsets() {
        with_table(&[-1, 0], |r| {
            assert!(matches!(
                validate(r, 64),
                Err(IoctlError::OutOfBounds { kind: OffsetKind::Hole, offset: -1, .. })
            ));
        });
        with_table(&[0, isize::MIN], |r| {
            assert!(matches!(
                validate(r, 64),
                Err(IoctlError::OutOfBounds { kind: OffsetKind::Target, .. })
            ));
        });
    }

    #[test]
    fn test_validate_rejects_hole_straddling_end() {
        let cap = 2 * WORD_SIZE;
        let hole = (cap - WORD_SIZE + 1) as isize;
        with_table(&[hole, 0], |r| {
            assert!(matches!(
                validate(r, cap),
                Err(IoctlError::OutOfBounds { kind: OffsetKind::Hole, .. })
            ));
        });
    }

    #[test]
    fn test_relocate_writes_native_addresses() {
        let mut payload = vec![0u8; 4 * WORD_SIZE];
        let words = [0, (2 * WORD_SIZE) as isize, WORD_SIZE as isize, 0];
        with_table(&words, |r| relocate(&mut payload, r).unwrap());

        let base = payload.as_ptr() as usize;
        let first = usize::from_ne_bytes(payload[..WORD_SIZE].try_into().unwrap());
        let second = usize::from_ne_bytes(payload[WORD_SIZE..2 * WORD_SIZE].try_into().unwrap());
        assert_eq!(first, base + 2 * WORD_SIZE);
        assert_eq!(second, base);
    }

    #[test]
    fn test_relocate_leaves_payload_untouched_on_error() {
        let mut payload = vec![0xAAu8; 2 * WORD_SIZE];
        let words = [0, 0, 0, 999];
        let result = with_table(&words, |r| relocate(&mut payload, r));
        assert!(result.is_err());
        assert!(payload.iter().all(|&b| b == 0xAA));
    }
}
