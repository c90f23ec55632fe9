mod common;

use common::{init_logger, input, inner_product, ramp, read, rnn, write};
use layer_graph::{
    BlobRef, ErrKind, Filler, LayerKind, LayerSpec, Net, NetSpec,
    specs::{BiasSpec, EltwiseOp, ReductionOp},
};

const EPS: f32 = 1e-2;

/// Compares the gradients of the last backward pass against central differences of the loss.
fn check_gradients(net: &mut Net, blobs: &[BlobRef]) {
    net.forward().unwrap();
    net.clear_param_diffs();
    net.backward().unwrap();

    let analytic: Vec<Vec<f32>> = blobs.iter().map(|b| b.borrow().diff().to_vec()).collect();

    for (blob, analytic) in blobs.iter().zip(analytic) {
        let name = blob.borrow().name().to_string();

        for (i, &expected) in analytic.iter().enumerate() {
            let original = blob.borrow().data()[i];

            blob.borrow().data_mut()[i] = original + EPS;
            let plus = net.forward().unwrap();
            blob.borrow().data_mut()[i] = original - EPS;
            let minus = net.forward().unwrap();
            blob.borrow().data_mut()[i] = original;

            let numeric = (plus - minus) / (2.0 * EPS);
            let tolerance = 2e-3 + 1e-2 * expected.abs();
            assert!(
                (numeric - expected).abs() <= tolerance,
                "{name}[{i}]: numeric {numeric}, analytic {expected}"
            );
        }
    }
}

fn feedforward() -> NetSpec {
    NetSpec::new("feedforward")
        .seed(23)
        .layer(input(
            &["x", "s", "w", "target"],
            &[&[2, 6], &[2, 3], &[2], &[2]],
        ))
        .layer(inner_product("ip", "x", 4))
        .layer(
            LayerSpec::new(
                "bias",
                LayerKind::Bias(BiasSpec {
                    filler: Filler::uniform(-0.3, 0.3),
                    ..BiasSpec::default()
                }),
            )
            .bottom("ip")
            .top("biased"),
        )
        .layer(LayerSpec::new("act", LayerKind::TanH).bottom("biased").top("a"))
        .layer(
            LayerSpec::new(
                "split",
                LayerKind::Slice {
                    axis: 1,
                    slice_point: vec![2],
                },
            )
            .bottom("a")
            .tops(["a1", "a2"]),
        )
        .layer(LayerSpec::new("gate", LayerKind::Sigmoid).bottom("a2").top("g"))
        .layer(
            LayerSpec::new(
                "prod",
                LayerKind::Eltwise {
                    operation: EltwiseOp::Prod,
                    coeff: Vec::new(),
                },
            )
            .bottoms(["a1", "g"])
            .top("p"),
        )
        .layer(
            LayerSpec::new(
                "sum",
                LayerKind::Eltwise {
                    operation: EltwiseOp::Sum,
                    coeff: vec![1.0, -0.5],
                },
            )
            .bottoms(["p", "a2"])
            .top("q"),
        )
        .layer(
            LayerSpec::new("cat", LayerKind::Concat { axis: 1 })
                .bottoms(["q", "s"])
                .top("c"),
        )
        .layer(
            LayerSpec::new("scaled", LayerKind::Scale { axis: 0 })
                .bottoms(["c", "w"])
                .top("sc"),
        )
        .layer(
            LayerSpec::new(
                "flat",
                LayerKind::Reshape {
                    shape: vec![0, -1, 1],
                },
            )
            .bottom("sc")
            .top("flat"),
        )
        .layer(
            LayerSpec::new(
                "red",
                LayerKind::Reduction {
                    operation: ReductionOp::SumSq,
                    axis: 1,
                    coeff: 0.5,
                },
            )
            .bottom("flat")
            .top("r"),
        )
        .layer(
            LayerSpec::new(
                "pick",
                LayerKind::ArgMax {
                    out_max_val: false,
                    top_k: 1,
                    axis: Some(1),
                },
            )
            .bottom("c")
            .top("picked"),
        )
        .layer(
            LayerSpec::new("loss", LayerKind::EuclideanLoss)
                .bottoms(["r", "target"])
                .top("loss"),
        )
}

fn fill_feedforward(net: &Net) {
    write(net, "x", &ramp(12, 1.0));
    write(net, "s", &ramp(6, -0.5));
    write(net, "w", &[0.8, -1.2]);
    write(net, "target", &[0.3, 0.1]);
}

#[test]
fn feedforward_gradients_match_finite_differences() {
    init_logger();
    let mut net = Net::new(feedforward()).unwrap();
    fill_feedforward(&net);

    let mut blobs: Vec<BlobRef> = ["x", "s", "w"]
        .into_iter()
        .map(|name| net.blob(name).unwrap())
        .collect();
    blobs.extend(net.learnable_params());

    check_gradients(&mut net, &blobs);
}

#[test]
fn argmax_branch_is_excluded_from_backward() {
    init_logger();
    let net = Net::new(feedforward()).unwrap();
    let pick = net.layer_names().iter().position(|&n| n == "pick").unwrap();

    assert!(!net.layer_needs_backward(pick));
    assert_eq!(net.bottom_need_backward(pick), &[false]);

    let outputs: Vec<String> = net
        .output_blobs()
        .iter()
        .map(|b| b.borrow().name().to_string())
        .collect();
    assert_eq!(outputs, vec!["picked", "loss"]);
}

#[test]
fn recurrent_gradients_match_finite_differences() {
    init_logger();
    let (timesteps, streams, features, hidden) = (3, 2, 2, 3);

    let spec = NetSpec::new("recurrent")
        .seed(29)
        .layer(input(
            &["x", "cont", "x_static", "h0", "target"],
            &[
                &[timesteps, streams, features],
                &[timesteps, streams],
                &[streams, 3],
                &[1, streams, hidden],
                &[timesteps, streams, hidden],
            ],
        ))
        .layer(
            rnn("rnn", hidden, true)
                .bottoms(["x", "cont", "x_static", "h0"])
                .tops(["o", "h_last"]),
        )
        .layer(
            LayerSpec::new("loss", LayerKind::EuclideanLoss)
                .bottoms(["o", "target"])
                .top("loss"),
        );

    let mut net = Net::new(spec).unwrap();
    write(&net, "x", &ramp(timesteps * streams * features, 1.0));
    write(&net, "cont", &[1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    write(&net, "x_static", &ramp(streams * 3, 0.7));
    write(&net, "h0", &ramp(streams * hidden, 0.4));
    write(&net, "target", &ramp(timesteps * streams * hidden, 0.5));

    assert_eq!(net.learnable_params().len(), 6);

    let mut blobs: Vec<BlobRef> = ["x", "x_static"]
        .into_iter()
        .map(|name| net.blob(name).unwrap())
        .collect();
    blobs.extend(net.learnable_params());

    check_gradients(&mut net, &blobs);
}

#[test]
fn forward_twice_is_bit_identical() {
    init_logger();
    let spec = feedforward().layer(
        LayerSpec::new(
            "noise",
            LayerKind::DummyData {
                shape: vec![vec![2, 3]],
                filler: vec![Filler::constant(0.25)],
            },
        )
        .top("noise"),
    );

    let mut net = Net::new(spec).unwrap();
    fill_feedforward(&net);

    let first = net.forward().unwrap();
    let outputs: Vec<Vec<f32>> = ["c", "picked", "noise"]
        .into_iter()
        .map(|name| read(&net, name))
        .collect();

    let second = net.forward().unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    for (name, expected) in ["c", "picked", "noise"].into_iter().zip(outputs) {
        assert_eq!(read(&net, name), expected, "{name}");
    }
}

#[test]
fn memory_data_serves_batches_in_order() {
    init_logger();
    let spec = NetSpec::new("memory")
        .layer(
            LayerSpec::new(
                "mem",
                LayerKind::MemoryData {
                    batch_size: 2,
                    channels: 1,
                    height: 1,
                    width: 3,
                },
            )
            .tops(["data", "label"]),
        )
        .layer(inner_product("ip", "data", 2));

    let mut net = Net::new(spec).unwrap();
    assert!(net.forward().is_err());

    let data = ramp(12, 1.0);
    let labels = [0.0, 1.0, 2.0, 3.0];
    net.layer_by_name_mut("mem")
        .and_then(|l| l.as_memory_data_mut())
        .unwrap()
        .reset(&data, &labels, 4)
        .unwrap();

    net.forward().unwrap();
    assert_eq!(read(&net, "data"), data[..6].to_vec());
    assert_eq!(read(&net, "label"), vec![0.0, 1.0]);

    net.forward().unwrap();
    assert_eq!(read(&net, "label"), vec![2.0, 3.0]);

    net.forward().unwrap();
    assert_eq!(read(&net, "data"), data[..6].to_vec());
}

#[test]
fn errors_fall_in_their_category() {
    init_logger();

    let arity = NetSpec::new("n")
        .layer(input(&["x"], &[&[2, 2]]))
        .layer(LayerSpec::new("loss", LayerKind::EuclideanLoss).bottom("x").top("loss"));
    assert_eq!(Net::new(arity).err().unwrap().kind(), ErrKind::Configuration);

    let shapes = NetSpec::new("n")
        .layer(input(&["a", "b"], &[&[2, 2], &[2, 3]]))
        .layer(
            LayerSpec::new("loss", LayerKind::EuclideanLoss)
                .bottoms(["a", "b"])
                .top("loss"),
        );
    assert_eq!(Net::new(shapes).err().unwrap().kind(), ErrKind::Shape);

    let malformed = r#"{ "layers": [{ "name": "x", "type": "input" }] }"#;
    assert_eq!(
        NetSpec::from_json(malformed).unwrap_err().kind(),
        ErrKind::Configuration
    );
}
