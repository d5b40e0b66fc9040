//! Reed-Solomon Segmenter
//!
//! Cuts a file into fixed-size blocks and erasure-codes each block into
//! `num_segments` (N) shares, any `min_segments` (K) of which rebuild the block.
//!
//! Shares are addressed by their 1-based segment number, which is also the
//! position of the receiving node in the cluster's node list. Array position
//! is never used to identify a share.
//!
//! The final block of a file may be short. It is zero-padded up to a multiple
//! of K before encoding and the pad length travels with the data so the
//! decoder can trim it again.

use crate::error::{CumulusError, Result};
use crate::{DEFAULT_BLOCK_SIZE, MIN_SEGMENTS, NUM_SEGMENTS};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Erasure codec for one (K, N) configuration
pub struct Segmenter {
    min_segments: usize,
    num_segments: usize,
    codec: ReedSolomon,
}

impl Segmenter {
    /// Create a segmenter that needs `min_segments` of `num_segments` shares to decode
    pub fn new(min_segments: usize, num_segments: usize) -> Result<Self> {
        if min_segments == 0 {
            return Err(CumulusError::Configuration(
                "min_segments must be > 0".to_string(),
            ));
        }
        if num_segments <= min_segments {
            return Err(CumulusError::Configuration(format!(
                "num_segments ({}) must exceed min_segments ({})",
                num_segments, min_segments
            )));
        }
        if num_segments > u8::MAX as usize {
            return Err(CumulusError::Configuration(format!(
                "num_segments ({}) must fit in a segment number",
                num_segments
            )));
        }
        let codec = ReedSolomon::new(min_segments, num_segments - min_segments)?;
        Ok(Self {
            min_segments,
            num_segments,
            codec,
        })
    }

    /// K: shares required to decode
    pub fn min_segments(&self) -> usize {
        self.min_segments
    }

    /// N: shares produced per block
    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Number of zero bytes needed to bring `len` up to a multiple of K
    pub fn padding_size(&self, len: usize) -> usize {
        (self.min_segments - len % self.min_segments) % self.min_segments
    }

    /// Size of one share of a full block
    pub fn encoded_block_size(&self, block_size: usize) -> usize {
        (block_size + self.padding_size(block_size)) / self.min_segments
    }

    /// Encode one block into N shares, index 0 holding segment number 1
    pub fn encode_block(&self, block: &[u8]) -> Result<Vec<Bytes>> {
        if block.is_empty() {
            return Ok(vec![Bytes::new(); self.num_segments]);
        }

        let padded_len = block.len() + self.padding_size(block.len());
        let share_size = padded_len / self.min_segments;

        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(block);
        padded.resize(padded_len, 0);

        let mut shares: Vec<Vec<u8>> = padded.chunks(share_size).map(|c| c.to_vec()).collect();
        for _ in self.min_segments..self.num_segments {
            shares.push(vec![0u8; share_size]);
        }

        self.codec.encode(&mut shares)?;

        Ok(shares.into_iter().map(Bytes::from).collect())
    }

    /// Encode a run of blocks into N ordered share lists
    ///
    /// `result[segment_num - 1][i]` is that node's share of block `i`.
    pub fn encode(&self, blocks: &[Bytes]) -> Result<Vec<Vec<Bytes>>> {
        let encoded: Vec<Vec<Bytes>> = blocks
            .par_iter()
            .map(|block| self.encode_block(block))
            .collect::<Result<_>>()?;

        let mut segments: Vec<Vec<Bytes>> = (0..self.num_segments)
            .map(|_| Vec::with_capacity(blocks.len()))
            .collect();
        for block_shares in encoded {
            for (segment, share) in segments.iter_mut().zip(block_shares) {
                segment.push(share);
            }
        }
        Ok(segments)
    }

    /// Rebuild one block from at least K `(segment_num, share)` pairs
    pub fn decode_block(&self, shares: &[(u8, Bytes)], padding_size: usize) -> Result<Bytes> {
        if shares.len() < self.min_segments {
            return Err(CumulusError::InsufficientShares {
                available: shares.len(),
                required: self.min_segments,
            });
        }

        let share_size = shares[0].1.len();
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.num_segments];
        for (segment_num, share) in shares {
            let index = self.share_index(*segment_num)?;
            if slots[index].is_some() {
                return Err(CumulusError::DuplicateSegmentNum(*segment_num));
            }
            if share.len() != share_size {
                return Err(CumulusError::ShareSizeMismatch {
                    expected: share_size,
                    actual: share.len(),
                });
            }
            slots[index] = Some(share.to_vec());
        }

        if share_size == 0 {
            return Ok(Bytes::new());
        }

        self.codec.reconstruct_data(&mut slots)?;

        let mut block = Vec::with_capacity(share_size * self.min_segments);
        for slot in slots.iter().take(self.min_segments) {
            match slot {
                Some(data) => block.extend_from_slice(data),
                None => {
                    return Err(CumulusError::Internal(
                        "reconstruction left a data share empty".to_string(),
                    ))
                }
            }
        }

        if padding_size > block.len() {
            return Err(CumulusError::ErasureCoding(format!(
                "padding {} exceeds decoded block of {} bytes",
                padding_size,
                block.len()
            )));
        }
        block.truncate(block.len() - padding_size);
        Ok(Bytes::from(block))
    }

    /// Rebuild a run of blocks from at least K segments' share lists
    ///
    /// `padding_size` applies to the last block only.
    pub fn decode(&self, segments: &[(u8, Vec<Bytes>)], padding_size: usize) -> Result<Vec<Bytes>> {
        if segments.len() < self.min_segments {
            return Err(CumulusError::InsufficientShares {
                available: segments.len(),
                required: self.min_segments,
            });
        }

        let block_count = segments[0].1.len();
        if let Some((_, shares)) = segments.iter().find(|(_, s)| s.len() != block_count) {
            return Err(CumulusError::ShareSizeMismatch {
                expected: block_count,
                actual: shares.len(),
            });
        }

        (0..block_count)
            .map(|i| {
                let shares: Vec<(u8, Bytes)> = segments
                    .iter()
                    .map(|(segment_num, list)| (*segment_num, list[i].clone()))
                    .collect();
                let padding = if i + 1 == block_count { padding_size } else { 0 };
                self.decode_block(&shares, padding)
            })
            .collect()
    }

    fn share_index(&self, segment_num: u8) -> Result<usize> {
        let index = segment_num as usize;
        if index == 0 || index > self.num_segments {
            return Err(CumulusError::InvalidSegmentNum {
                segment_num,
                max: self.num_segments,
            });
        }
        Ok(index - 1)
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(MIN_SEGMENTS, NUM_SEGMENTS).expect("default segmenter config is valid")
    }
}

/// Cut a buffer into blocks of `block_size`; the last block may be short
pub fn split_blocks(data: &[u8], block_size: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    data.chunks(block_size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Cut a buffer into blocks of the default size
pub fn split_default_blocks(data: &[u8]) -> Vec<Bytes> {
    split_blocks(data, DEFAULT_BLOCK_SIZE)
}
