#![allow(dead_code)]

use layer_graph::{
    Filler, LayerKind, LayerSpec, Net, RecurrentSpec,
    specs::InnerProductSpec,
};
use serde_json::json;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An `Input` layer named after its first top.
pub fn input(tops: &[&str], shapes: &[&[usize]]) -> LayerSpec {
    LayerSpec::new(
        format!("{}_input", tops[0]),
        LayerKind::Input {
            shape: shapes.iter().map(|s| s.to_vec()).collect(),
        },
    )
    .tops(tops.iter().copied())
}

pub fn rnn(name: &str, num_output: usize, expose_hidden: bool) -> LayerSpec {
    let config = json!({
        "num_output": num_output,
        "weight_filler": { "type": "uniform", "min": -0.5, "max": 0.5 },
        "bias_filler": { "type": "uniform", "min": -0.2, "max": 0.2 },
    });

    LayerSpec::new(
        name,
        LayerKind::Recurrent(RecurrentSpec::new("rnn", config).expose_hidden(expose_hidden)),
    )
}

pub fn inner_product(name: &str, bottom: &str, num_output: usize) -> LayerSpec {
    LayerSpec::new(
        name,
        LayerKind::InnerProduct(
            InnerProductSpec::new(num_output).weight_filler(Filler::uniform(-0.5, 0.5)),
        ),
    )
    .bottom(bottom)
    .top(name)
}

/// Deterministic, non trivial values.
pub fn ramp(count: usize, scale: f32) -> Vec<f32> {
    (0..count)
        .map(|i| scale * ((i as f32 * 0.7).sin() + 0.1 * i as f32 % 1.0))
        .collect()
}

pub fn write(net: &Net, blob: &str, values: &[f32]) {
    net.blob(blob)
        .unwrap()
        .borrow()
        .copy_data_from_slice(values)
        .unwrap();
}

pub fn read(net: &Net, blob: &str) -> Vec<f32> {
    net.blob(blob).unwrap().borrow().data().to_vec()
}

pub fn assert_close(got: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(got.len(), expected.len());
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!(
            (g - e).abs() <= tolerance,
            "element {i}: got {g}, expected {e}"
        );
    }
}
