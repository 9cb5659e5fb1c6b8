//! Splitting an object into the bounded-size segments carried by
//! datagroups. Each segment is prefixed with the 2-byte segment header
//! of EN 300 401, 5.3.3.2.

use log::debug;

use crate::{MscError, Result};

/// Maximum data segment size in bytes: the 13-bit SegmentSize field less
/// the 2-byte segment header.
pub const MAX_SEGMENT_SIZE: usize = 8189;

/// Policy deciding the byte length of the next segment, given the
/// segments already emitted and the current position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentingStrategy {
    /// Each segment is the same size, apart from the last one, which may
    /// be smaller.
    ConstantSegmentSize {
        maximum_segment_size: usize,
    },
    /// The final segment is kept small enough to be held within a single
    /// packet, so that the arrival of that one packet completes the whole
    /// set of datagroups. Used for synchronised imagery triggers.
    CompletionTrigger {
        target_final_segment_size: usize,
        maximum_segment_size: usize,
    },
}

impl SegmentingStrategy {
    /// Equal-sized segments of at most `maximum_segment_size` bytes.
    pub fn constant(maximum_segment_size: usize) -> Self {
        Self::ConstantSegmentSize {
            maximum_segment_size,
        }
    }

    /// A completion trigger strategy with the default maximum segment size.
    ///
    /// # Errors
    ///
    /// [MscError::InvalidArgument] if `target_final_segment_size` exceeds
    /// [MAX_SEGMENT_SIZE].
    pub fn completion_trigger(target_final_segment_size: usize) -> Result<Self> {
        Self::completion_trigger_with_maximum(target_final_segment_size, MAX_SEGMENT_SIZE)
    }

    /// A completion trigger strategy with an explicit maximum segment size.
    ///
    /// # Errors
    ///
    /// [MscError::InvalidArgument] if `target_final_segment_size` exceeds
    /// `maximum_segment_size`.
    pub fn completion_trigger_with_maximum(
        target_final_segment_size: usize,
        maximum_segment_size: usize,
    ) -> Result<Self> {
        if target_final_segment_size > maximum_segment_size {
            return Err(MscError::InvalidArgument(format!(
                "target final segment size {target_final_segment_size:} must be no greater than the maximum segment size {maximum_segment_size:}"
            )));
        }
        Ok(Self::CompletionTrigger {
            target_final_segment_size,
            maximum_segment_size,
        })
    }
}

impl Default for SegmentingStrategy {
    fn default() -> Self {
        Self::constant(MAX_SEGMENT_SIZE)
    }
}

/// Segment sizes resolved once per segmenting run.
enum SegmentSizes {
    Constant(usize),
    Split { uniform: usize, tail: usize },
}

impl SegmentSizes {
    fn resolve(strategy: &SegmentingStrategy, length: usize) -> Result<Self> {
        let maximum = match *strategy {
            SegmentingStrategy::ConstantSegmentSize {
                maximum_segment_size,
            } => maximum_segment_size,
            SegmentingStrategy::CompletionTrigger {
                maximum_segment_size,
                ..
            } => maximum_segment_size,
        };
        if maximum == 0 || maximum > MAX_SEGMENT_SIZE + 2 {
            return Err(MscError::InvalidArgument(format!(
                "maximum segment size {maximum:} must be within 1..={}",
                MAX_SEGMENT_SIZE + 2
            )));
        }

        match *strategy {
            SegmentingStrategy::ConstantSegmentSize { .. } => Ok(Self::Constant(maximum)),
            SegmentingStrategy::CompletionTrigger {
                target_final_segment_size,
                ..
            } => {
                if target_final_segment_size > maximum {
                    return Err(MscError::InvalidArgument(format!(
                        "target final segment size {target_final_segment_size:} must be no greater than the maximum segment size {maximum:}"
                    )));
                }
                let (uniform, tail) =
                    calculate_segment_sizes(length, maximum, target_final_segment_size);
                debug!("resolved completion trigger segment sizes: uniform {uniform:}, tail {tail:}");
                Ok(Self::Split { uniform, tail })
            }
        }
    }

    fn next_segment_size(&self, length: usize, position: usize) -> usize {
        match *self {
            Self::Constant(size) => size,
            Self::Split { uniform, tail } => {
                if length - position > tail {
                    uniform
                } else {
                    tail
                }
            }
        }
    }
}

/// Find the largest uniform size X and final size Y such that the bytes
/// ahead of the final segment divide exactly into X-sized pieces. The +2
/// accounts for the segment header within the uniform portion.
fn calculate_segment_sizes(length: usize, maximum: usize, target: usize) -> (usize, usize) {
    let length = length as i64;
    let mut y = target as i64;
    while y > 0 {
        let mut x = maximum as i64;
        while x > 0 {
            if (length - y + 2).rem_euclid(x) == 0 {
                return (x as usize, y as usize);
            }
            x -= 1;
        }
        y -= 1;
    }
    unreachable!("an X of 1 always divides the remainder")
}

/// Split `data` into segments according to the strategy, prepending each
/// segment with its 2-byte header: a 3-bit repetition count (always zero,
/// a single broadcast) and the 13-bit SegmentSize.
///
/// Empty input yields an empty list.
///
/// # Errors
///
/// [MscError::InvalidArgument] when the strategy's sizes are out of range.
pub fn segment(data: &[u8], strategy: &SegmentingStrategy) -> Result<Vec<Vec<u8>>> {
    let mut segments = Vec::new();
    if data.is_empty() {
        return Ok(segments);
    }

    let sizes = SegmentSizes::resolve(strategy, data.len())?;

    let mut position = 0;
    while position < data.len() {
        let segment_size = sizes.next_segment_size(data.len(), position);
        let end = (position + segment_size).min(data.len());
        let segment_data = &data[position..end];

        // (0-2): repetition count remaining, (3-15): SegmentSize
        let header = segment_data.len() as u16 & 0x1FFF;
        let mut segment = Vec::with_capacity(2 + segment_data.len());
        segment.extend_from_slice(&header.to_be_bytes());
        segment.extend_from_slice(segment_data);
        segments.push(segment);

        position += segment_size;
    }

    debug!("segmented {} bytes into {} segments", data.len(), segments.len());
    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;

    use rstest::rstest;

    #[rstest]
    // a single segment plus its 2-byte header
    #[case(1000, vec![1002])]
    // a full segment and a smaller tail
    #[case(16000, vec![8191, 7813])]
    fn constant_segment_size(#[case] length: usize, #[case] expected: Vec<usize>) {
        let data = vec![0x20_u8; length];
        let segments = segment(&data, &SegmentingStrategy::default()).unwrap();
        let sizes: Vec<usize> = segments.iter().map(Vec::len).collect();
        assert_eq!(sizes, expected)
    }

    #[rstest]
    #[case(1000, 64, MAX_SEGMENT_SIZE)]
    #[case(16000, 64, MAX_SEGMENT_SIZE)]
    #[case(16000, 64, 1024)]
    // data shorter than the target final size
    #[case(46, 80, 1024)]
    fn completion_trigger_preserves_length(
        #[case] length: usize,
        #[case] target: usize,
        #[case] maximum: usize,
    ) {
        let data = vec![0x20_u8; length];
        let strategy =
            SegmentingStrategy::completion_trigger_with_maximum(target, maximum).unwrap();
        let segments = segment(&data, &strategy).unwrap();

        let total: usize = segments.iter().map(|s| s.len() - 2).sum();
        assert_eq!(total, length);

        // every non-final payload shares one size and the tail fits the target
        let payloads: Vec<usize> = segments.iter().map(|s| s.len() - 2).collect();
        if let Some((last, rest)) = payloads.split_last() {
            assert!(rest.windows(2).all(|pair| pair[0] == pair[1]));
            assert!(*last <= target);
        }
    }

    #[rstest]
    fn completion_trigger_rejects_target_above_maximum() {
        assert!(matches!(
            SegmentingStrategy::completion_trigger_with_maximum(128, 64),
            Err(MscError::InvalidArgument(_))
        ))
    }

    #[rstest]
    fn empty_input_yields_no_segments() {
        assert!(segment(&[], &SegmentingStrategy::default()).unwrap().is_empty())
    }

    #[rstest]
    fn segment_header_carries_payload_size() {
        let data = vec![0xAB_u8; 300];
        let segments = segment(&data, &SegmentingStrategy::constant(256)).unwrap();
        assert_eq!(segments.len(), 2);

        let declared = u16::from_be_bytes([segments[0][0], segments[0][1]]) & 0x1FFF;
        assert_eq!(declared as usize, segments[0].len() - 2);
        let declared = u16::from_be_bytes([segments[1][0], segments[1][1]]) & 0x1FFF;
        assert_eq!(declared as usize, 300 - 256);
    }

    #[rstest]
    fn zero_maximum_is_rejected() {
        assert!(matches!(
            segment(&[0_u8; 4], &SegmentingStrategy::constant(0)),
            Err(MscError::InvalidArgument(_))
        ))
    }
}
