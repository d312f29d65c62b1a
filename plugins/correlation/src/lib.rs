//! Pairwise correlation node.
//!
//! Consumes two input streams (or one multichannel stream in self mode) and
//! emits one symmetric Pearson matrix per timestamp-aligned window. Windows
//! are aligned by acquisition-clock bucket, not arrival order: the faster
//! stream is buffered until the slower stream's matching bucket completes,
//! and buffered buckets more than one window old are discarded so a rate
//! mismatch can never grow an unbounded backlog.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use pipeline::{typed_params, Emit, NodeError, NodeParams, NodeRegistry, ProcessingNode};
use signal_types::{Counter, SampleBlock};

pub const PORT_A: &str = "a";
pub const PORT_B: &str = "b";
pub const PORT_IN: &str = "in";
pub const OUT_PORT: &str = "out";

/// Input arrangement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Two streams on ports `a` and `b`; the matrix spans both channel sets.
    #[default]
    Dual,
    /// One multichannel stream on port `in`; channels correlate pairwise.
    #[serde(rename = "self")]
    SelfChannels,
}

#[derive(Debug, Clone, Deserialize)]
struct CorrelationParams {
    window: usize,
    #[serde(default)]
    mode: Mode,
}

type Buckets = BTreeMap<u64, Vec<Vec<f32>>>;

pub struct CorrelationNode {
    window: usize,
    mode: Mode,
    sample_rate: f32,
    win_ns: u64,
    buckets: [Buckets; 2],
    emitted: u64,
    discarded_windows: u64,
}

impl CorrelationNode {
    pub fn new() -> Self {
        Self {
            window: 256,
            mode: Mode::Dual,
            sample_rate: 0.0,
            win_ns: 0,
            buckets: [BTreeMap::new(), BTreeMap::new()],
            emitted: 0,
            discarded_windows: 0,
        }
    }

    /// Registers this node type with a registry.
    pub fn register(registry: &mut NodeRegistry) {
        registry.register("correlation", |params| {
            let mut node = Box::new(CorrelationNode::new());
            node.configure(params)?;
            Ok(node as Box<dyn ProcessingNode>)
        });
    }

    fn port_index(&self, port: &str) -> Result<usize, NodeError> {
        match (self.mode, port) {
            (Mode::Dual, PORT_A) => Ok(0),
            (Mode::Dual, PORT_B) => Ok(1),
            (Mode::SelfChannels, PORT_IN) => Ok(0),
            _ => Err(NodeError::BadBlock(format!(
                "unexpected input port '{port}' for {:?} mode",
                self.mode
            ))),
        }
    }

    fn distribute(&mut self, index: usize, block: &SampleBlock) {
        let ns_per_sample = block.ns_per_sample();
        let width = block.channel_count();
        for i in 0..block.samples_per_channel() {
            let ts = block.start_ts_ns + i as u64 * ns_per_sample;
            let bucket = self.buckets[index]
                .entry(ts / self.win_ns)
                .or_insert_with(|| vec![Vec::with_capacity(self.window); width]);
            for (ch, samples) in bucket.iter_mut().zip(&block.channels) {
                ch.push(samples[i]);
            }
        }
    }

    fn bucket_complete(bucket: &[Vec<f32>], window: usize) -> bool {
        bucket.iter().all(|ch| ch.len() >= window)
    }

    /// Emits every bucket that is complete on all active ports, oldest first.
    fn drain_complete(&mut self) -> Result<Vec<Emit>, NodeError> {
        let mut emits = Vec::new();
        loop {
            let candidate = match self.mode {
                Mode::SelfChannels => self
                    .buckets[0]
                    .iter()
                    .find(|(_, b)| Self::bucket_complete(b, self.window))
                    .map(|(&k, _)| k),
                Mode::Dual => self.buckets[0]
                    .iter()
                    .filter(|(_, b)| Self::bucket_complete(b, self.window))
                    .find(|(k, _)| {
                        self.buckets[1]
                            .get(k)
                            .map(|b| Self::bucket_complete(b, self.window))
                            .unwrap_or(false)
                    })
                    .map(|(&k, _)| k),
            };
            let key = match candidate {
                Some(key) => key,
                None => break,
            };

            let mut rows: Vec<Vec<f32>> = Vec::new();
            let first = self.buckets[0].remove(&key).unwrap_or_default();
            rows.extend(first);
            if self.mode == Mode::Dual {
                let second = self.buckets[1].remove(&key).unwrap_or_default();
                rows.extend(second);
            }
            for row in &mut rows {
                row.truncate(self.window);
            }

            let matrix = correlation_matrix(&rows);
            let out = SampleBlock::new(
                key * self.win_ns,
                self.sample_rate / self.window as f32,
                matrix,
            )
            .map_err(|e| NodeError::BadBlock(e.to_string()))?;
            emits.push((OUT_PORT.to_string(), Arc::new(out)));
            self.emitted += 1;
        }
        Ok(emits)
    }

    /// Drops buckets more than one window older than the newest data seen.
    fn discard_stale(&mut self) {
        let newest = self
            .buckets
            .iter()
            .filter_map(|b| b.keys().next_back().copied())
            .max();
        let min_keep = match newest {
            Some(newest) => newest.saturating_sub(1),
            None => return,
        };
        for buckets in &mut self.buckets {
            let stale: Vec<u64> = buckets.range(..min_keep).map(|(&k, _)| k).collect();
            for key in stale {
                buckets.remove(&key);
                self.discarded_windows += 1;
                debug!("discarded unmatched window bucket {}", key);
            }
        }
    }
}

impl Default for CorrelationNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingNode for CorrelationNode {
    fn node_type(&self) -> &'static str {
        "correlation"
    }

    fn configure(&mut self, params: &NodeParams) -> Result<(), NodeError> {
        let p: CorrelationParams = typed_params(params)?;
        if p.window < 2 {
            return Err(NodeError::BadParam("window must be at least 2".into()));
        }
        self.window = p.window;
        self.mode = p.mode;
        Ok(())
    }

    fn on_block(&mut self, port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError> {
        let index = self.port_index(port)?;
        if self.sample_rate == 0.0 {
            self.sample_rate = block.sample_rate;
            self.win_ns = self.window as u64 * block.ns_per_sample();
        } else if block.sample_rate != self.sample_rate {
            return Err(NodeError::BadBlock(format!(
                "sample rate changed from {} to {}",
                self.sample_rate, block.sample_rate
            )));
        }

        self.distribute(index, &block);
        self.discard_stale();
        self.drain_complete()
    }

    fn counters(&self) -> Vec<Counter> {
        vec![
            Counter::new("windows_emitted", self.emitted),
            Counter::new("windows_discarded", self.discarded_windows),
        ]
    }
}

/// Symmetric Pearson matrix with a forced unit diagonal. A zero-variance
/// row correlates to nothing: its off-diagonal entries are zero.
fn correlation_matrix(rows: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let n = rows.len();
    let mut matrix = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in (i + 1)..n {
            let r = pearson(&rows[i], &rows[j]);
            matrix[i][j] = r;
            matrix[j][i] = r;
        }
    }
    matrix
}

fn pearson(x: &[f32], y: &[f32]) -> f32 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let mx = x[..n].iter().sum::<f32>() / n as f32;
    let my = y[..n].iter().sum::<f32>() / n as f32;
    let mut cov = 0.0f32;
    let mut vx = 0.0f32;
    let mut vy = 0.0f32;
    for (&a, &b) in x[..n].iter().zip(&y[..n]) {
        let da = a - mx;
        let db = b - my;
        cov += da * db;
        vx += da * da;
        vy += db * db;
    }
    if vx <= f32::EPSILON || vy <= f32::EPSILON {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}
