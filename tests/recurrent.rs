mod common;

use common::{assert_close, init_logger, input, ramp, read, rnn, write};
use layer_graph::{
    ArchitectureRegistry, CancelEvent, ErrKind, Filler, LayerKind, LayerSpec, Net, NetErr,
    NetSpec, ParamSpec, Phase, Result, Unroll, UnrolledArchitecture,
    layers::Propagate,
    specs::BiasSpec,
};
use serde_json::Value;

/// One scalar bias added to every input, without hidden state.
struct ScalarBias;

impl UnrolledArchitecture for ScalarBias {
    fn recurrent_input_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn recurrent_input_shapes(&self, _streams: usize) -> Vec<Vec<usize>> {
        Vec::new()
    }

    fn recurrent_output_names(&self, _timesteps: usize) -> Vec<String> {
        Vec::new()
    }

    fn output_names(&self) -> Vec<String> {
        vec!["o".to_string()]
    }

    fn fill_unrolled_net(&self, net: &mut NetSpec, _unroll: &Unroll) -> Result<()> {
        let bias = BiasSpec {
            axis: 0,
            num_axes: 0,
            filler: Filler::constant(0.0),
        };

        net.layers.push(
            LayerSpec::new("bias", LayerKind::Bias(bias))
                .bottom("x")
                .top("o")
                .param(ParamSpec::named("b")),
        );
        Ok(())
    }
}

fn scalar_bias(_config: &Value) -> Result<Box<dyn UnrolledArchitecture>> {
    Ok(Box::new(ScalarBias))
}

fn sequence_net(timesteps: usize, streams: usize, features: usize, hidden: usize) -> NetSpec {
    NetSpec::new("sequence")
        .seed(17)
        .layer(input(
            &["x", "cont"],
            &[&[timesteps, streams, features], &[timesteps, streams]],
        ))
        .layer(rnn("rnn", hidden, false).bottoms(["x", "cont"]).top("o"))
}

#[test]
fn scalar_bias_scenario() {
    init_logger();

    let mut registry = ArchitectureRegistry::builtin();
    registry.register("scalar_bias", scalar_bias);

    let spec = NetSpec::new("scenario")
        .layer(input(&["x", "cont"], &[&[4, 2, 3], &[4, 2]]))
        .layer(
            LayerSpec::new(
                "rec",
                LayerKind::Recurrent(layer_graph::RecurrentSpec::new(
                    "scalar_bias",
                    Value::Null,
                )),
            )
            .bottoms(["x", "cont"])
            .top("o"),
        );

    let mut net = Net::builder(spec).registry(registry).build().unwrap();
    assert_eq!(net.learnable_params().len(), 1);
    assert_eq!(net.learnable_params()[0].borrow().num_axes(), 0);

    net.blob("cont").unwrap().borrow().set_data(1.0);
    net.forward().unwrap();

    let o = net.blob("o").unwrap();
    assert_eq!(o.borrow().shape(), &[4, 2, 3]);
    assert!(o.borrow().data().iter().all(|&v| v == 0.0));
}

#[test]
fn distinct_params_do_not_depend_on_timesteps() {
    init_logger();

    for timesteps in [2, 3, 6] {
        let net = Net::new(sequence_net(timesteps, 2, 3, 4)).unwrap();
        assert_eq!(net.learnable_params().len(), 5);
    }

    let with_static = NetSpec::new("static")
        .layer(input(
            &["x", "cont", "x_static"],
            &[&[3, 2, 3], &[3, 2], &[2, 5]],
        ))
        .layer(
            rnn("rnn", 4, false)
                .bottoms(["x", "cont", "x_static"])
                .top("o"),
        );
    let net = Net::new(with_static).unwrap();
    assert_eq!(net.learnable_params().len(), 6);
}

#[test]
fn hidden_state_continues_across_calls() {
    init_logger();
    let (streams, features, hidden) = (2, 3, 4);

    let mut long = Net::new(sequence_net(8, streams, features, hidden)).unwrap();
    let mut short = Net::new(sequence_net(4, streams, features, hidden)).unwrap();
    short.import_params(&long.export_params()).unwrap();

    let x = ramp(8 * streams * features, 0.8);
    write(&long, "x", &x);
    long.blob("cont").unwrap().borrow().set_data(1.0);
    long.forward().unwrap();
    let expected = read(&long, "o");

    short.blob("cont").unwrap().borrow().set_data(1.0);
    let half = x.len() / 2;
    let mut got = Vec::new();
    for chunk in [&x[..half], &x[half..]] {
        write(&short, "x", chunk);
        short.forward().unwrap();
        got.extend(read(&short, "o"));
    }

    assert_close(&got, &expected, 1e-5);
}

#[test]
fn zero_continuation_ignores_prior_hidden_state() {
    init_logger();
    let (timesteps, streams, features, hidden) = (4, 2, 3, 3);

    let spec = NetSpec::new("exposed")
        .seed(5)
        .layer(input(
            &["x", "cont", "h0"],
            &[
                &[timesteps, streams, features],
                &[timesteps, streams],
                &[1, streams, hidden],
            ],
        ))
        .layer(
            rnn("rnn", hidden, true)
                .bottoms(["x", "cont", "h0"])
                .tops(["o", "h_last"]),
        );
    let mut net = Net::new(spec).unwrap();

    write(&net, "x", &ramp(timesteps * streams * features, 1.0));
    // stream 0 restarts at t = 0, stream 1 restarts at t = 2
    write(&net, "cont", &[0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);

    write(&net, "h0", &[0.0; 6]);
    net.forward().unwrap();
    let before = read(&net, "o");

    write(&net, "h0", &[0.9, -0.7, 0.5, -0.3, 0.8, -0.6]);
    net.forward().unwrap();
    let after = read(&net, "o");

    let at = |o: &[f32], t: usize, n: usize| -> Vec<f32> {
        let start = (t * streams + n) * hidden;
        o[start..start + hidden].to_vec()
    };

    for t in 0..timesteps {
        assert_eq!(at(&before, t, 0), at(&after, t, 0), "stream 0 at t = {t}");
    }
    assert_ne!(at(&before, 0, 1), at(&after, 0, 1));
    for t in 2..timesteps {
        assert_eq!(at(&before, t, 1), at(&after, t, 1), "stream 1 at t = {t}");
    }

    let h_last = net.blob("h_last").unwrap();
    assert_eq!(h_last.borrow().shape(), &[1, streams, hidden]);
}

#[test]
fn backward_into_continuation_flags_is_rejected() {
    init_logger();
    let spec = sequence_net(3, 2, 2, 2)
        .layer(input(&["target"], &[&[3, 2, 2]]))
        .layer(
            LayerSpec::new("loss", LayerKind::EuclideanLoss)
                .bottoms(["o", "target"])
                .top("loss"),
        );
    let mut net = Net::new(spec).unwrap();
    net.blob("cont").unwrap().borrow().set_data(1.0);
    net.forward().unwrap();

    // the network itself never asks for it
    assert_eq!(net.bottom_need_backward(1), &[true, false]);
    net.backward().unwrap();

    let top = net.top_blobs(1).to_vec();
    let bottom = net.bottom_blobs(1).to_vec();
    let layer = net.layer_mut(1).unwrap();
    let params = vec![true; layer.params().len()];

    let err = layer.backward(&top, &[true, true], &bottom).unwrap_err();
    assert_eq!(err.kind(), ErrKind::StructuralInvariant);

    let recurrent = layer.as_recurrent_mut().unwrap();
    let err = layer_graph::LayerOps::backward(
        recurrent,
        &top,
        Propagate::new(&[false, true], &params),
        &bottom,
    )
    .unwrap_err();
    assert!(matches!(err, NetErr::Invariant { .. }));
}

#[test]
fn static_input_must_match_streams() {
    init_logger();
    let spec = NetSpec::new("static")
        .layer(input(
            &["x", "cont", "x_static"],
            &[&[3, 2, 4], &[3, 2], &[5, 6]],
        ))
        .layer(
            rnn("rnn", 4, false)
                .bottoms(["x", "cont", "x_static"])
                .top("o"),
        );

    let err = Net::new(spec).err().unwrap();
    assert_eq!(err.kind(), ErrKind::Shape);
}

#[test]
fn changing_timesteps_fails_the_next_pass() {
    init_logger();
    let mut net = Net::new(sequence_net(3, 2, 2, 2)).unwrap();

    net.blob("x").unwrap().borrow_mut().reshape(&[4, 2, 2]);
    net.blob("cont").unwrap().borrow_mut().reshape(&[4, 2]);
    let err = net.forward().unwrap_err();
    assert_eq!(err.kind(), ErrKind::StructuralInvariant);
}

#[test]
fn streams_may_vary_between_calls() {
    init_logger();
    let mut net = Net::new(sequence_net(3, 2, 2, 4)).unwrap();
    net.forward().unwrap();

    net.blob("x").unwrap().borrow_mut().reshape(&[3, 5, 2]);
    net.blob("cont").unwrap().borrow_mut().reshape(&[3, 5]);
    net.forward().unwrap();
    assert_eq!(net.blob("o").unwrap().borrow().shape(), &[3, 5, 4]);
}

#[test]
fn forward_is_repeatable_once_state_is_reset() {
    init_logger();
    let mut net = Net::new(sequence_net(3, 2, 3, 4)).unwrap();
    write(&net, "x", &ramp(18, 1.0));
    net.blob("cont").unwrap().borrow().set_data(1.0);

    net.forward().unwrap();
    let first = read(&net, "o");

    let reset = |net: &mut Net| {
        net.layer_by_name_mut("rnn")
            .and_then(|l| l.as_recurrent_mut())
            .unwrap()
            .reset();
    };

    reset(&mut net);
    net.forward().unwrap();
    assert_eq!(read(&net, "o"), first);
}

#[test]
fn inner_network_shares_the_cancellation_signal() {
    init_logger();
    let cancel = CancelEvent::new();
    let mut net = Net::builder(sequence_net(2, 1, 2, 2))
        .cancel(cancel.clone())
        .build()
        .unwrap();

    let inner = net.layer(1).and_then(|l| l.as_recurrent()).unwrap().net().unwrap();
    assert!(!inner.cancel_event().is_cancelled());

    cancel.cancel();
    let inner = net.layer(1).and_then(|l| l.as_recurrent()).unwrap().net().unwrap();
    assert!(inner.cancel_event().is_cancelled());

    let err = net.forward_range(1, 2).unwrap_err();
    assert!(matches!(err, NetErr::Cancelled { ref layer } if layer == "rnn"));
}

#[test]
fn described_in_json() {
    init_logger();
    let json = r#"{
        "name": "from_json",
        "seed": 3,
        "layers": [
            {
                "name": "data", "type": "input", "top": ["x", "cont", "target"],
                "shape": [[3, 2, 4], [3, 2], [3, 2, 5]]
            },
            {
                "name": "rnn", "type": "recurrent", "bottom": ["x", "cont"], "top": ["o"],
                "architecture": "rnn",
                "config": { "num_output": 5, "weight_filler": { "type": "xavier" } }
            },
            { "name": "loss", "type": "euclidean_loss", "bottom": ["o", "target"], "top": ["loss"] }
        ]
    }"#;

    let mut net = Net::new(NetSpec::from_json(json).unwrap()).unwrap();
    write(&net, "x", &ramp(24, 1.0));
    net.blob("cont").unwrap().borrow().set_data(1.0);
    net.blob("target").unwrap().borrow().set_data(0.5);

    let loss = net.forward().unwrap();
    assert!(loss > 0.0);
    net.backward().unwrap();

    let grads: f32 = net
        .learnable_params()
        .iter()
        .map(|p| p.borrow().diff().iter().map(|d| d.abs()).sum::<f32>())
        .sum();
    assert!(grads > 0.0);
}

#[test]
fn masked_inputs_keep_gradients_from_other_consumers() {
    init_logger();
    let (timesteps, streams, features) = (3, 2, 2);

    let spec = NetSpec::new("masked")
        .seed(13)
        .layer(input(
            &["x", "cont", "x_static", "t_o", "t_x", "t_static"],
            &[
                &[timesteps, streams, features],
                &[timesteps, streams],
                &[streams, 3],
                &[timesteps, streams, 2],
                &[timesteps, 2],
                &[streams, 2],
            ],
        ))
        .layer(
            rnn("rnn", 2, false)
                .bottoms(["x", "cont", "x_static"])
                .top("o")
                .propagate_down([false, false, false]),
        )
        .layer(common::inner_product("ip_x", "x", 2))
        .layer(common::inner_product("ip_static", "x_static", 2))
        .layer(
            LayerSpec::new("loss_o", LayerKind::EuclideanLoss)
                .bottoms(["o", "t_o"])
                .top("loss_o"),
        )
        .layer(
            LayerSpec::new("loss_x", LayerKind::EuclideanLoss)
                .bottoms(["ip_x", "t_x"])
                .top("loss_x"),
        )
        .layer(
            LayerSpec::new("loss_static", LayerKind::EuclideanLoss)
                .bottoms(["ip_static", "t_static"])
                .top("loss_static"),
        );

    let mut net = Net::new(spec).unwrap();
    write(&net, "x", &ramp(timesteps * streams * features, 1.0));
    net.blob("cont").unwrap().borrow().set_data(1.0);
    write(&net, "x_static", &ramp(streams * 3, 0.6));
    write(&net, "t_o", &ramp(timesteps * streams * 2, 0.3));
    write(&net, "t_x", &ramp(timesteps * 2, -0.4));
    write(&net, "t_static", &ramp(streams * 2, 0.2));

    let rnn_id = net.layer_names().iter().position(|&n| n == "rnn").unwrap();
    assert!(net.layer_needs_backward(rnn_id));
    assert_eq!(net.bottom_need_backward(rnn_id), &[false, false, false]);

    net.forward().unwrap();
    net.backward().unwrap();

    // only the inner products reach the inputs: dx = (y - t) / num · W
    let expected = |ip: &str, target: &str, rows: usize, cols: usize| -> Vec<f32> {
        let y = read(&net, ip);
        let t = read(&net, target);
        let w = net.layer_by_name(ip).unwrap().params()[0].borrow().data().to_vec();
        let outputs = y.len() / rows;

        let mut dx = vec![0.0; rows * cols];
        for m in 0..rows {
            for j in 0..outputs {
                let dy = (y[m * outputs + j] - t[m * outputs + j]) / rows as f32;
                for k in 0..cols {
                    dx[m * cols + k] += dy * w[j * cols + k];
                }
            }
        }
        dx
    };

    let x_diff = net.blob("x").unwrap().borrow().diff().to_vec();
    assert!(x_diff.iter().any(|&d| d != 0.0));
    assert_close(&x_diff, &expected("ip_x", "t_x", timesteps, streams * features), 1e-5);

    let static_diff = net.blob("x_static").unwrap().borrow().diff().to_vec();
    assert_close(&static_diff, &expected("ip_static", "t_static", streams, 3), 1e-5);
}

#[test]
fn inference_forward_rebinds_shared_weights() {
    init_logger();
    let (timesteps, streams, hidden) = (3, 2, 3);

    let spec = NetSpec::new("inference")
        .phase(Phase::Test)
        .seed(31)
        .layer(input(
            &["x", "cont", "h0"],
            &[&[timesteps, streams, 2], &[timesteps, streams], &[1, streams, hidden]],
        ))
        .layer(
            rnn("rnn", hidden, true)
                .bottoms(["x", "cont", "h0"])
                .tops(["o", "h_last"]),
        );

    let mut net = Net::new(spec).unwrap();
    write(&net, "x", &ramp(timesteps * streams * 2, 1.0));
    net.blob("cont").unwrap().borrow().set_data(1.0);
    write(&net, "h0", &ramp(streams * hidden, 0.5));

    net.forward().unwrap();
    let expected = read(&net, "o");

    let (shared, owner) = {
        let inner = net
            .layer_by_name("rnn")
            .and_then(|l| l.as_recurrent())
            .and_then(|l| l.net())
            .unwrap();
        let (i, owner) = inner
            .param_owners()
            .iter()
            .enumerate()
            .find_map(|(i, owner)| owner.map(|owner| (i, owner)))
            .unwrap();
        (inner.params()[i].clone(), inner.params()[owner].clone())
    };

    let shape = shared.borrow().shape().to_vec();
    shared.borrow_mut().reshape(&[shape.iter().product::<usize>() + 1]);
    shared.borrow_mut().reshape(&shape);
    assert!(!shared.borrow().shares_data_with(&owner.borrow()));

    net.forward().unwrap();
    assert!(shared.borrow().shares_data_with(&owner.borrow()));
    assert!(shared.borrow().shares_diff_with(&owner.borrow()));
    assert_eq!(read(&net, "o"), expected);
}

fn exposed_net(loss_on_hidden: bool) -> NetSpec {
    let (timesteps, streams, hidden) = (3, 2, 3);

    let mut spec = NetSpec::new("truncated")
        .seed(37)
        .layer(input(
            &["x", "cont", "h0", "t_o", "t_h"],
            &[
                &[timesteps, streams, 2],
                &[timesteps, streams],
                &[1, streams, hidden],
                &[timesteps, streams, hidden],
                &[1, streams, hidden],
            ],
        ))
        .layer(
            rnn("rnn", hidden, true)
                .bottoms(["x", "cont", "h0"])
                .tops(["o", "h_last"]),
        )
        .layer(
            LayerSpec::new("loss_o", LayerKind::EuclideanLoss)
                .bottoms(["o", "t_o"])
                .top("loss_o"),
        );

    if loss_on_hidden {
        spec = spec.layer(
            LayerSpec::new("loss_h", LayerKind::EuclideanLoss)
                .bottoms(["h_last", "t_h"])
                .top("loss_h"),
        );
    }
    spec
}

#[test]
fn gradients_stop_at_the_final_hidden_state() {
    init_logger();
    let mut with_loss = Net::new(exposed_net(true)).unwrap();
    let mut without_loss = Net::new(exposed_net(false)).unwrap();
    without_loss.import_params(&with_loss.export_params()).unwrap();

    let inner_h_last = |net: &Net| {
        net.layer_by_name("rnn")
            .and_then(|l| l.as_recurrent())
            .and_then(|l| l.net())
            .unwrap()
            .blob("h_3")
            .unwrap()
    };
    assert!(inner_h_last(&with_loss).borrow().diff().iter().all(|&d| d == 0.0));

    for net in [&with_loss, &without_loss] {
        write(net, "x", &ramp(12, 1.0));
        net.blob("cont").unwrap().borrow().set_data(1.0);
        write(net, "h0", &ramp(6, 0.4));
        write(net, "t_o", &ramp(18, 0.3));
        net.blob("t_h").unwrap().borrow().set_data(2.0);
    }

    let loss_with = with_loss.forward().unwrap();
    let loss_without = without_loss.forward().unwrap();
    assert!(loss_with > loss_without);

    for net in [&mut with_loss, &mut without_loss] {
        net.clear_param_diffs();
        net.backward().unwrap();
    }

    assert_close(
        &inner_h_last(&with_loss).borrow().diff(),
        &inner_h_last(&without_loss).borrow().diff(),
        1e-6,
    );
    for (a, b) in with_loss
        .learnable_params()
        .iter()
        .zip(without_loss.learnable_params())
    {
        assert_close(&a.borrow().diff(), &b.borrow().diff(), 1e-6);
    }
}
