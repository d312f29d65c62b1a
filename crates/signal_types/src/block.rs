//! The immutable unit of multichannel data moving through the system.

use serde::{Deserialize, Serialize};

/// Errors raised when constructing a [`SampleBlock`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlockError {
    /// The channel sequences do not all share the same length.
    #[error("channel sequences have unequal lengths")]
    RaggedChannels,
    /// The block carries no channels at all.
    #[error("block has no channels")]
    NoChannels,
    /// Sample rate must be finite and positive.
    #[error("invalid sample rate: {0}")]
    BadSampleRate(f32),
}

/// A fixed-shape chunk of multichannel timestamped samples.
///
/// Every channel sequence shares the same length and sample rate. The block
/// is stamped with the monotonic acquisition-clock time of its first sample
/// and is never mutated after construction; it travels through the pipeline
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBlock {
    /// Monotonic timestamp of the first sample, in nanoseconds.
    pub start_ts_ns: u64,
    /// Samples per second, shared by all channels.
    pub sample_rate: f32,
    /// Channel-major sample data; all inner vectors have equal length.
    pub channels: Vec<Vec<f32>>,
}

impl SampleBlock {
    /// Builds a block, validating the equal-length invariant.
    pub fn new(
        start_ts_ns: u64,
        sample_rate: f32,
        channels: Vec<Vec<f32>>,
    ) -> Result<Self, BlockError> {
        if channels.is_empty() {
            return Err(BlockError::NoChannels);
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(BlockError::BadSampleRate(sample_rate));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(BlockError::RaggedChannels);
        }
        Ok(Self {
            start_ts_ns,
            sample_rate,
            channels,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.channels[0].len()
    }

    /// Samples for one channel, if the index is in range.
    pub fn channel(&self, idx: usize) -> Option<&[f32]> {
        self.channels.get(idx).map(|c| c.as_slice())
    }

    /// Nanoseconds covered by one sample at this block's rate.
    pub fn ns_per_sample(&self) -> u64 {
        (1_000_000_000.0 / self.sample_rate as f64) as u64
    }

    /// Timestamp one past the last sample, in nanoseconds.
    pub fn end_ts_ns(&self) -> u64 {
        self.start_ts_ns + self.samples_per_channel() as u64 * self.ns_per_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_construction() {
        let block = SampleBlock::new(1_000, 250.0, vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(block.channel_count(), 2);
        assert_eq!(block.samples_per_channel(), 2);
        assert_eq!(block.channel(1), Some(&[3.0, 4.0][..]));
        assert_eq!(block.channel(2), None);
    }

    #[test]
    fn test_ragged_channels_rejected() {
        let err = SampleBlock::new(0, 250.0, vec![vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(err, BlockError::RaggedChannels);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(SampleBlock::new(0, 0.0, vec![vec![1.0]]).is_err());
        assert!(SampleBlock::new(0, f32::NAN, vec![vec![1.0]]).is_err());
        assert!(SampleBlock::new(0, 250.0, vec![]).is_err());
    }

    #[test]
    fn test_end_timestamp() {
        let block = SampleBlock::new(0, 250.0, vec![vec![0.0; 250]]).unwrap();
        assert_eq!(block.end_ts_ns(), 1_000_000_000);
    }
}
