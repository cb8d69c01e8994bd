//! In-place rewrite of length-prefixed NAL units into start-code form.

/// Inconsistencies found while repacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RepackError {
    #[error("truncated {width}-byte length prefix at offset {offset} after {units} units")]
    TruncatedPrefix {
        offset: usize,
        width: u8,
        units: usize,
    },
    #[error("unit at offset {offset} declares {declared} bytes, {remaining} remain")]
    Overrun {
        offset: usize,
        declared: usize,
        remaining: usize,
        units: usize,
    },
}

impl RepackError {
    /// Units successfully rewritten before the inconsistency.
    pub fn units(&self) -> usize {
        match *self {
            RepackError::TruncatedPrefix { units, .. } | RepackError::Overrun { units, .. } => {
                units
            }
        }
    }
}

/// Rewrites `[len][payload][len][payload]...` into `[00..01][payload]...` in place.
///
/// Each big-endian length prefix is zeroed and its last byte set to `1`, so a 4-byte
/// prefix becomes the `00 00 00 01` start code and a 3-byte prefix becomes `00 00 01`.
/// The transform is not idempotent; apply it once per unit.
///
/// # Example
/// ```rust
/// use ilkit_component::nal::NalRepacker;
///
/// let mut buf = vec![0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x41];
/// let units = NalRepacker::new(4).unwrap().repack(&mut buf).unwrap();
/// assert_eq!(units, 2);
/// assert_eq!(buf, [0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x41]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalRepacker {
    length_size: u8,
}

impl NalRepacker {
    /// Repacker for `length_size`-byte prefixes; `None` outside `1..=4`.
    pub fn new(length_size: u8) -> Option<Self> {
        (1..=4)
            .contains(&length_size)
            .then_some(Self { length_size })
    }

    pub fn length_size(&self) -> u8 {
        self.length_size
    }

    /// Rewrite every unit of `buf`, returning how many were rewritten.
    ///
    /// On a truncated prefix or a length running past the end, the offending prefix and
    /// everything after it are left untouched.
    pub fn repack(&self, buf: &mut [u8]) -> Result<usize, RepackError> {
        let width = usize::from(self.length_size);
        let mut offset = 0;
        let mut units = 0;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            if remaining < width {
                return Err(RepackError::TruncatedPrefix {
                    offset,
                    width: self.length_size,
                    units,
                });
            }
            let prefix = &mut buf[offset..offset + width];
            let declared = prefix
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            let payload = remaining - width;
            if declared > payload {
                return Err(RepackError::Overrun {
                    offset,
                    declared,
                    remaining: payload,
                    units,
                });
            }
            prefix.fill(0);
            prefix[width - 1] = 1;
            offset += width + declared;
            units += 1;
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn length_prefixed(width: u8, units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            let len = unit.len().to_be_bytes();
            out.extend_from_slice(&len[len.len() - usize::from(width)..]);
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn widths_one_to_four_write_a_marker() {
        for width in 1..=4u8 {
            let mut buf = length_prefixed(width, &[&[0x67, 0x42], &[0x68]]);
            let units = NalRepacker::new(width).unwrap().repack(&mut buf).unwrap();
            assert_eq!(units, 2);
            let w = usize::from(width);
            assert!(buf[..w - 1].iter().all(|b| *b == 0));
            assert_eq!(buf[w - 1], 1);
            assert_eq!(&buf[w..w + 2], &[0x67, 0x42]);
        }
        assert!(NalRepacker::new(0).is_none());
        assert!(NalRepacker::new(5).is_none());
    }

    #[test]
    fn overrun_leaves_tail_untouched() {
        let mut buf = length_prefixed(4, &[&[1, 2, 3]]);
        buf.extend_from_slice(&[0, 0, 0, 9, 0xaa, 0xbb]);
        let original_tail = buf[7..].to_vec();
        let err = NalRepacker::new(4).unwrap().repack(&mut buf).unwrap_err();
        assert_eq!(
            err,
            RepackError::Overrun {
                offset: 7,
                declared: 9,
                remaining: 2,
                units: 1,
            }
        );
        assert_eq!(&buf[7..], original_tail.as_slice());
        assert_eq!(&buf[..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn empty_buffer_has_no_units() {
        assert_eq!(NalRepacker::new(4).unwrap().repack(&mut []), Ok(0));
    }

    // Truncating a valid stream at every possible point must never write past the cut, and
    // every byte after the first inconsistent prefix must keep its original value.
    #[test]
    fn random_truncations_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(0xa11c);
        for _ in 0..500 {
            let width = rng.gen_range(1..=4u8);
            let max_len = if width == 1 { 255 } else { 600 };
            let count = rng.gen_range(1..6);
            let units: Vec<Vec<u8>> = (0..count)
                .map(|_| {
                    let len = rng.gen_range(0..max_len);
                    (0..len).map(|_| rng.r#gen::<u8>()).collect()
                })
                .collect();
            let refs: Vec<&[u8]> = units.iter().map(|u| u.as_slice()).collect();
            let full = length_prefixed(width, &refs);
            let cut = rng.gen_range(0..=full.len());
            let mut buf = full[..cut].to_vec();
            let pristine = buf.clone();
            let repacker = NalRepacker::new(width).unwrap();
            match repacker.repack(&mut buf) {
                Ok(n) => assert!(n <= count),
                Err(RepackError::TruncatedPrefix { offset, .. })
                | Err(RepackError::Overrun { offset, .. }) => {
                    assert!(offset < cut);
                    assert_eq!(&buf[offset..], &pristine[offset..]);
                }
            }
            assert_eq!(buf.len(), cut);
        }
    }
}
