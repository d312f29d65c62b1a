//! Band-power estimation node.
//!
//! Maintains a sliding window of width W with hop H per channel and emits
//! one value-block per completed hop: for every input channel, the
//! integrated spectral power of each configured frequency band, computed
//! over a Hann-windowed FFT of the current window.

use std::sync::Arc;

use apodize::hanning_iter;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::Deserialize;
use tracing::debug;

use pipeline::{typed_params, Emit, NodeError, NodeParams, NodeRegistry, ProcessingNode};
use signal_types::{Counter, SampleBlock};

pub const IN_PORT: &str = "in";
pub const OUT_PORT: &str = "out";

/// What to do with a partially filled window when the stream drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Emit one final short window if at least a hop's worth of samples
    /// arrived since the last emission.
    #[default]
    Partial,
    /// Never emit on partial data.
    Never,
}

#[derive(Debug, Clone, Deserialize)]
struct BandPowerParams {
    window: usize,
    hop: usize,
    /// Half-open `[low_hz, high_hz)` bands, one output value per band.
    bands: Vec<(f32, f32)>,
    #[serde(default)]
    flush: FlushPolicy,
}

pub struct BandPowerNode {
    window: usize,
    hop: usize,
    bands: Vec<(f32, f32)>,
    flush: FlushPolicy,
    planner: FftPlanner<f32>,
    buffers: Vec<Vec<f32>>,
    sample_rate: f32,
    buf_start_ts_ns: u64,
    total_samples: u64,
    emissions: u64,
    flushes: u64,
}

impl BandPowerNode {
    pub fn new() -> Self {
        Self {
            window: 512,
            hop: 256,
            // Classic EEG bands: delta, theta, alpha, beta.
            bands: vec![(1.0, 4.0), (4.0, 8.0), (8.0, 13.0), (13.0, 30.0)],
            flush: FlushPolicy::Partial,
            planner: FftPlanner::new(),
            buffers: Vec::new(),
            sample_rate: 0.0,
            buf_start_ts_ns: 0,
            total_samples: 0,
            emissions: 0,
            flushes: 0,
        }
    }

    /// Registers this node type with a registry.
    pub fn register(registry: &mut NodeRegistry) {
        registry.register("band_power", |params| {
            let mut node = Box::new(BandPowerNode::new());
            node.configure(params)?;
            Ok(node as Box<dyn ProcessingNode>)
        });
    }

    fn ns_per_sample(&self) -> u64 {
        (1_000_000_000.0 / self.sample_rate as f64) as u64
    }

    /// Band powers over the first `len` buffered samples of every channel.
    fn emit_window(&mut self, len: usize) -> Result<Arc<SampleBlock>, NodeError> {
        let fft = self.planner.plan_fft_forward(len);
        let hann: Vec<f32> = hanning_iter(len).map(|v| v as f32).collect();
        let s2: f32 = hann.iter().map(|w| w * w).sum();
        let scale = 2.0 / (self.sample_rate * s2);
        let bin_hz = self.sample_rate / len as f32;

        let mut out_channels = Vec::with_capacity(self.buffers.len());
        for buf in &self.buffers {
            let mut spectrum: Vec<Complex<f32>> = buf[..len]
                .iter()
                .zip(&hann)
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            fft.process(&mut spectrum);
            let powers: Vec<f32> = self
                .bands
                .iter()
                .map(|&(lo, hi)| {
                    spectrum
                        .iter()
                        .enumerate()
                        .take(len / 2)
                        .skip(1)
                        .filter(|(i, _)| {
                            let f = *i as f32 * bin_hz;
                            f >= lo && f < hi
                        })
                        .map(|(_, c)| c.norm_sqr() * scale)
                        .sum()
                })
                .collect();
            out_channels.push(powers);
        }

        let out_rate = self.sample_rate / self.hop as f32;
        SampleBlock::new(self.buf_start_ts_ns, out_rate, out_channels)
            .map(Arc::new)
            .map_err(|e| NodeError::BadBlock(e.to_string()))
    }

    /// Stream position one past the last emitted window, in samples.
    fn last_emission_end(&self) -> u64 {
        if self.emissions > 0 {
            self.window as u64 + (self.emissions - 1) * self.hop as u64
        } else {
            0
        }
    }
}

impl Default for BandPowerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingNode for BandPowerNode {
    fn node_type(&self) -> &'static str {
        "band_power"
    }

    fn configure(&mut self, params: &NodeParams) -> Result<(), NodeError> {
        let p: BandPowerParams = typed_params(params)?;
        if p.window < 2 {
            return Err(NodeError::BadParam("window must be at least 2".into()));
        }
        if p.hop == 0 || p.hop > p.window {
            return Err(NodeError::BadParam(
                "hop must be between 1 and window".into(),
            ));
        }
        if p.bands.is_empty() {
            return Err(NodeError::BadParam("at least one band required".into()));
        }
        if p.bands.iter().any(|&(lo, hi)| lo < 0.0 || lo >= hi) {
            return Err(NodeError::BadParam(
                "bands must satisfy 0 <= low < high".into(),
            ));
        }
        self.window = p.window;
        self.hop = p.hop;
        self.bands = p.bands;
        self.flush = p.flush;
        Ok(())
    }

    fn on_block(&mut self, _port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError> {
        if self.buffers.is_empty() {
            self.buffers = vec![Vec::new(); block.channel_count()];
            self.sample_rate = block.sample_rate;
            self.buf_start_ts_ns = block.start_ts_ns;
        } else if block.channel_count() != self.buffers.len() {
            return Err(NodeError::BadBlock(format!(
                "channel count changed from {} to {}",
                self.buffers.len(),
                block.channel_count()
            )));
        } else if block.sample_rate != self.sample_rate {
            return Err(NodeError::BadBlock(format!(
                "sample rate changed from {} to {}",
                self.sample_rate, block.sample_rate
            )));
        }

        for (buf, samples) in self.buffers.iter_mut().zip(&block.channels) {
            buf.extend_from_slice(samples);
        }
        self.total_samples += block.samples_per_channel() as u64;

        let mut emits = Vec::new();
        while self.buffers[0].len() >= self.window {
            let out = self.emit_window(self.window)?;
            emits.push((OUT_PORT.to_string(), out));
            let hop = self.hop;
            for buf in &mut self.buffers {
                buf.drain(..hop);
            }
            self.buf_start_ts_ns += self.hop as u64 * self.ns_per_sample();
            self.emissions += 1;
        }
        Ok(emits)
    }

    fn on_stop(&mut self) -> Result<Vec<Emit>, NodeError> {
        if self.flush == FlushPolicy::Never || self.buffers.is_empty() {
            return Ok(Vec::new());
        }
        let len = self.buffers[0].len();
        let fresh = self.total_samples.saturating_sub(self.last_emission_end());
        if len >= 2 && fresh >= self.hop as u64 {
            debug!("flushing short window of {} samples", len);
            let out = self.emit_window(len)?;
            self.flushes += 1;
            return Ok(vec![(OUT_PORT.to_string(), out)]);
        }
        Ok(Vec::new())
    }

    fn counters(&self) -> Vec<Counter> {
        vec![
            Counter::new("windows_emitted", self.emissions),
            Counter::new("windows_flushed", self.flushes),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn configured(window: usize, hop: usize) -> BandPowerNode {
        let mut node = BandPowerNode::new();
        let mut params = NodeParams::new();
        params.insert("window".into(), json!(window));
        params.insert("hop".into(), json!(hop));
        params.insert("bands".into(), json!([[8.0, 13.0]]));
        node.configure(&params).unwrap();
        node
    }

    fn feed(node: &mut BandPowerNode, total: usize, chunk: usize) -> usize {
        let rate = 128.0;
        let ns_per_sample = (1_000_000_000.0 / rate) as u64;
        let mut emitted = 0;
        let mut sent = 0;
        while sent < total {
            let n = chunk.min(total - sent);
            let block = SampleBlock::new(
                sent as u64 * ns_per_sample,
                rate,
                vec![vec![0.5; n]],
            )
            .unwrap();
            emitted += node.on_block(IN_PORT, Arc::new(block)).unwrap().len();
            sent += n;
        }
        emitted
    }

    #[test]
    fn test_window_count_matches_hop_formula() {
        for (total, window, hop, expected) in [
            (10usize, 8usize, 4usize, 1usize),
            (12, 8, 4, 2),
            (16, 8, 4, 3),
            (7, 8, 4, 0),
            (8, 8, 8, 1),
            (64, 16, 2, 25),
        ] {
            let mut node = configured(window, hop);
            let emitted = feed(&mut node, total, 7);
            assert_eq!(emitted, expected, "N={total} W={window} H={hop}");
        }
    }

    proptest! {
        #[test]
        fn prop_emission_count_law(
            total in 0usize..400,
            window in 2usize..64,
            hop_offset in 0usize..64,
        ) {
            let hop = 1 + hop_offset % window;
            let mut node = configured(window, hop);
            let emitted = feed(&mut node, total, 5);
            let expected = if total >= window {
                (total - window) / hop + 1
            } else {
                0
            };
            prop_assert_eq!(emitted, expected);
        }
    }

    #[test]
    fn test_flush_emits_short_window_after_hop_of_fresh_samples() {
        // Never emitted, more than a hop buffered: one trailing emission.
        let mut node = configured(8, 4);
        assert_eq!(feed(&mut node, 7, 7), 0);
        let trailing = node.on_stop().unwrap();
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].1.samples_per_channel(), 1);

        // Less than a hop buffered: nothing.
        let mut node = configured(8, 4);
        assert_eq!(feed(&mut node, 3, 3), 0);
        assert!(node.on_stop().unwrap().is_empty());

        // Fully drained stream: nothing to flush.
        let mut node = configured(8, 4);
        assert_eq!(feed(&mut node, 12, 12), 2);
        assert!(node.on_stop().unwrap().is_empty());
    }

    #[test]
    fn test_flush_policy_never() {
        let mut node = BandPowerNode::new();
        let mut params = NodeParams::new();
        params.insert("window".into(), json!(8));
        params.insert("hop".into(), json!(4));
        params.insert("bands".into(), json!([[8.0, 13.0]]));
        params.insert("flush".into(), json!("never"));
        node.configure(&params).unwrap();
        feed(&mut node, 7, 7);
        assert!(node.on_stop().unwrap().is_empty());
    }

    #[test]
    fn test_sine_power_lands_in_matching_band() {
        let rate = 128.0;
        let mut node = BandPowerNode::new();
        let mut params = NodeParams::new();
        params.insert("window".into(), json!(64));
        params.insert("hop".into(), json!(64));
        params.insert("bands".into(), json!([[12.0, 20.0], [40.0, 60.0]]));
        node.configure(&params).unwrap();

        // A 16 Hz sine: all power in the first band.
        let samples: Vec<f32> = (0..64)
            .map(|i| (2.0 * std::f32::consts::PI * 16.0 * i as f32 / rate).sin())
            .collect();
        let block = SampleBlock::new(0, rate, vec![samples]).unwrap();
        let emits = node.on_block(IN_PORT, Arc::new(block)).unwrap();
        assert_eq!(emits.len(), 1);
        let powers = emits[0].1.channel(0).unwrap();
        assert!(powers[0] > 100.0 * powers[1].max(f32::MIN_POSITIVE));
    }

    #[test]
    fn test_output_timestamps_advance_by_hop() {
        let mut node = configured(8, 4);
        let rate = 128.0;
        let ns_per_sample = (1_000_000_000.0 / rate) as u64;
        let block = SampleBlock::new(5_000, rate, vec![vec![0.1; 16]]).unwrap();
        let emits = node.on_block(IN_PORT, Arc::new(block)).unwrap();
        assert_eq!(emits.len(), 3);
        assert_eq!(emits[0].1.start_ts_ns, 5_000);
        assert_eq!(emits[1].1.start_ts_ns, 5_000 + 4 * ns_per_sample);
        assert_eq!(emits[2].1.start_ts_ns, 5_000 + 8 * ns_per_sample);
    }

    #[test]
    fn test_configure_rejects_bad_params() {
        let mut node = BandPowerNode::new();
        let mut params = NodeParams::new();
        params.insert("window".into(), json!(8));
        params.insert("hop".into(), json!(9));
        params.insert("bands".into(), json!([[8.0, 13.0]]));
        assert!(node.configure(&params).is_err());

        params.insert("hop".into(), json!(4));
        params.insert("bands".into(), json!([[13.0, 8.0]]));
        assert!(node.configure(&params).is_err());
    }

    #[test]
    fn test_channel_count_change_is_rejected() {
        let mut node = configured(8, 4);
        let one = SampleBlock::new(0, 128.0, vec![vec![0.0; 4]]).unwrap();
        node.on_block(IN_PORT, Arc::new(one)).unwrap();
        let two = SampleBlock::new(0, 128.0, vec![vec![0.0; 4], vec![0.0; 4]]).unwrap();
        assert!(node.on_block(IN_PORT, Arc::new(two)).is_err());
    }
}
