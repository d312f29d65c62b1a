//! Minimal two-node graph: scale a stream, print what falls out of the tap.
//!
//! Run with: cargo run --example basic_graph -p pipeline

use std::sync::Arc;

use pipeline::{Emit, NodeError, OverflowPolicy, PipelineGraph, ProcessingNode};
use signal_types::SampleBlock;

struct Scale(f32);

impl ProcessingNode for Scale {
    fn node_type(&self) -> &'static str {
        "scale"
    }

    fn on_block(&mut self, _port: &str, block: Arc<SampleBlock>) -> Result<Vec<Emit>, NodeError> {
        let channels = block
            .channels
            .iter()
            .map(|c| c.iter().map(|s| s * self.0).collect())
            .collect();
        let out = SampleBlock::new(block.start_ts_ns, block.sample_rate, channels)
            .map_err(|e| NodeError::BadBlock(e.to_string()))?;
        Ok(vec![("out".to_string(), Arc::new(out))])
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut graph = PipelineGraph::new();
    graph
        .add_node("scale", Box::new(Scale(10.0)), &["in".into()], &["out".into()])
        .expect("add node");

    let mut runtime = graph.start().expect("start pipeline");
    let injector = runtime.injector("scale.in").expect("injector");
    let tap = runtime.tap("scale.out").expect("tap");

    for i in 0..3u64 {
        let block = SampleBlock::new(i * 4_000_000, 250.0, vec![vec![i as f32; 4]]).expect("block");
        injector.push(Arc::new(block)).expect("push");
    }
    drop(injector);

    while let Some(block) = tap.pop() {
        println!(
            "t={}ns first_sample={}",
            block.start_ts_ns,
            block.channel(0).unwrap()[0]
        );
    }

    runtime.stop();
}
