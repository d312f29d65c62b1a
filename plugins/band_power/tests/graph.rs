//! The band-power node running inside a pipeline graph.

use std::sync::Arc;

use band_power_plugin::BandPowerNode;
use pipeline::{NodeParams, NodeRegistry, PipelineGraph};
use serde_json::json;
use signal_types::SampleBlock;

fn params(window: usize, hop: usize) -> NodeParams {
    let mut params = NodeParams::new();
    params.insert("window".into(), json!(window));
    params.insert("hop".into(), json!(hop));
    params.insert("bands".into(), json!([[1.0, 4.0], [8.0, 13.0]]));
    params
}

#[test]
fn test_band_power_in_graph_via_registry() {
    let mut registry = NodeRegistry::new();
    BandPowerNode::register(&mut registry);
    let node = registry.create("band_power", &params(32, 16)).unwrap();

    let mut graph = PipelineGraph::new();
    graph
        .add_node("bp", node, &["in".into()], &["out".into()])
        .unwrap();
    let mut runtime = graph.start().unwrap();
    let injector = runtime.injector("bp.in").unwrap();
    let tap = runtime.tap("bp.out").unwrap();

    let rate = 128.0;
    let ns_per_sample = (1_000_000_000.0 / rate) as u64;
    // 96 samples in 8-sample blocks: floor((96 - 32) / 16) + 1 = 5 windows,
    // nothing left over for a trailing flush.
    for i in 0..12u64 {
        let block = SampleBlock::new(
            i * 8 * ns_per_sample,
            rate,
            vec![vec![0.25; 8], vec![-0.25; 8]],
        )
        .unwrap();
        injector.push(Arc::new(block)).unwrap();
    }
    drop(injector);

    let mut outputs = Vec::new();
    while let Some(block) = tap.pop() {
        assert_eq!(block.channel_count(), 2);
        assert_eq!(block.samples_per_channel(), 2); // one value per band
        outputs.push(block.start_ts_ns);
    }
    assert_eq!(outputs.len(), 5);
    // Consecutive windows advance by exactly one hop.
    for pair in outputs.windows(2) {
        assert_eq!(pair[1] - pair[0], 16 * ns_per_sample);
    }

    runtime.stop();
    let counters = runtime.counters();
    let (_, bp_counters) = &counters[0];
    assert_eq!(bp_counters[0].value, 5);
    assert_eq!(bp_counters[1].value, 0);
}

#[test]
fn test_registry_rejects_bad_band_params() {
    let mut registry = NodeRegistry::new();
    BandPowerNode::register(&mut registry);
    let mut bad = params(32, 16);
    bad.insert("bands".into(), json!([]));
    assert!(registry.create("band_power", &bad).is_err());
}
