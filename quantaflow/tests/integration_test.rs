use quantaflow::prelude::*;
use quantaflow::{f16, ops, quant, AttrMap, ParamMap};

/// Drive a Dense layer forward and backward for one element representation.
fn dense_round_trip<T: Arithmetic>() {
    let ctx = Context::new();
    let weight = Tensor::<T>::ones(&[2, 2]);
    let bias = Tensor::<T>::zeros(&[2]);
    let mut dense = Dense::new("dense", weight, Some(bias)).unwrap();

    let x = Tensor::<T>::ones(&[1, 2]);
    let y = dense.forward(&ctx, &[&x]).unwrap();
    assert_eq!(y.shape().dims(), &[1, 2]);
    // ones * ones over two inputs: every output is 1 + 1
    let two = T::one().add(T::one());
    assert!(y.iter().all(|&v| v == two));

    let g = Tensor::<T>::ones(&[1, 2]);
    let grads = dense
        .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x])
        .unwrap();
    assert_eq!(grads.len(), 1);
    assert_eq!(grads[0].shape(), x.shape());
    assert!(dense.weight().grad().is_some());
    assert!(dense.bias().unwrap().grad().is_some());
}

#[test]
fn test_dense_works_for_every_element_representation() {
    dense_round_trip::<f32>();
    dense_round_trip::<f64>();
    dense_round_trip::<f16>();
    dense_round_trip::<Float8>();
    dense_round_trip::<i8>();
    dense_round_trip::<u8>();
}

#[test]
fn test_pipeline_forward_and_backward() {
    let ctx = Context::new();

    let mut dense = Dense::<f32>::random("front", 4, 4, true, 3)
        .unwrap()
        .with_activation(ActivationKind::Tanh);
    let mut ffn = FeedForward::<f32>::random("mid", 4, 8, 4, 4).unwrap();
    let codes: Vec<u8> = (0..8).map(|i| (i * 2) as u8).collect();
    let mut head = QuantizedLinear::<f32>::new(
        "head",
        4,
        2,
        4,
        quant::pack_4bit(&codes).unwrap(),
        vec![0.05],
        None,
        true,
    )
    .unwrap();

    let x = Tensor::from_vec(vec![0.1f32, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8], &[2, 4]).unwrap();
    let h1 = dense.forward(&ctx, &[&x]).unwrap();
    let h2 = ffn.forward(&ctx, &[&h1]).unwrap();
    let y = head.forward(&ctx, &[&h2]).unwrap();
    assert_eq!(y.shape().dims(), &[2, 2]);

    // backward threads each stage's input gradient into the previous stage
    let g = Tensor::<f32>::ones(&[2, 2]);
    let dh2 = head
        .backward(&ctx, BackwardMode::FullBackprop, &g, &[&h2])
        .unwrap()
        .remove(0);
    let dh1 = ffn
        .backward(&ctx, BackwardMode::FullBackprop, &dh2, &[&h1])
        .unwrap()
        .remove(0);
    let dx = dense
        .backward(&ctx, BackwardMode::FullBackprop, &dh1, &[&x])
        .unwrap()
        .remove(0);
    assert_eq!(dx.shape(), x.shape());

    // trainable stages got parameter gradients; the quantized head is frozen
    assert!(dense.parameters().iter().all(|p| p.grad().is_some()));
    assert!(ffn.parameters().iter().all(|p| p.grad().is_some()));
    assert!(head.parameters().is_empty());
}

#[test]
fn test_recurrent_unroll_accumulates_bias() {
    let ctx = Context::new();
    let mut cell = SimpleRnnCell::<f64>::random("cell", 3, 2, 17).unwrap();

    let steps = [
        Tensor::from_vec(vec![0.1, 0.2, 0.3], &[1, 3]).unwrap(),
        Tensor::from_vec(vec![-0.1, 0.0, 0.4], &[1, 3]).unwrap(),
        Tensor::from_vec(vec![0.5, -0.2, 0.1], &[1, 3]).unwrap(),
    ];

    // forward pass over the sequence
    let mut h = Tensor::<f64>::zeros(&[1, 2]);
    let mut states = vec![h.clone()];
    for x in &steps {
        h = cell.forward(&ctx, &[x, states.last().unwrap()]).unwrap();
        states.push(h.clone());
    }

    // truncated backward on the last step only: the hidden-state gradient is
    // substituted with zeros
    cell.forward(&ctx, &[&steps[2], &states[2]]).unwrap();
    let g = Tensor::<f64>::ones(&[1, 2]);
    let grads = cell
        .backward(&ctx, BackwardMode::OneStepApproximation, &g, &[&steps[2], &states[2]])
        .unwrap();
    assert!(grads[1].iter().all(|&v| v == 0.0));

    // full BPTT accumulates the bias gradient across steps
    for p in cell.parameters_mut() {
        p.clear_grad();
    }
    let mut grad = Tensor::<f64>::ones(&[1, 2]);
    for t in (0..steps.len()).rev() {
        cell.forward(&ctx, &[&steps[t], &states[t]]).unwrap();
        grad = cell
            .backward(&ctx, BackwardMode::FullBackprop, &grad, &[&steps[t], &states[t]])
            .unwrap()
            .remove(1);
    }
    assert!(cell.bias().grad().is_some());
    assert!(cell.bias().grad().unwrap().iter().any(|&v| v != 0.0));
}

#[test]
fn test_registry_rebuilds_a_serialized_pipeline() {
    let registry = NodeRegistry::<f32>::with_builtin_nodes();
    let original = Dense::<f32>::random("layer0", 3, 3, true, 8)
        .unwrap()
        .with_activation(ActivationKind::Sigmoid);

    // serialize: op tag + parameter map + attribute map
    let op = original.op_type();
    let mut params = ParamMap::new();
    for p in original.parameters() {
        let key = p.name().rsplit('.').next().unwrap().to_string();
        params.insert(key, p.value().clone());
    }
    let attrs: AttrMap = original.attributes();

    let mut rebuilt = registry.build(op, "layer0", params, &attrs).unwrap();

    let ctx = Context::new();
    let x = Tensor::from_vec(vec![0.3f32, -0.6, 0.9], &[1, 3]).unwrap();
    let mut reference = original;
    let expected = reference.forward(&ctx, &[&x]).unwrap();
    let actual = rebuilt.forward(&ctx, &[&x]).unwrap();
    assert_eq!(expected.as_slice().unwrap(), actual.as_slice().unwrap());
}

#[test]
fn test_cancellation_propagates_from_engine_boundaries() {
    let ctx = Context::new();
    let mut dense = Dense::<f32>::random("dense", 2, 2, true, 1).unwrap();
    let x = Tensor::<f32>::ones(&[1, 2]);
    dense.forward(&ctx, &[&x]).unwrap();

    ctx.cancel();
    let err = dense.forward(&ctx, &[&x]).unwrap_err();
    assert!(matches!(err, TensorError::Cancelled { .. }));
}

#[test]
fn test_engine_ops_compose_with_quantization() {
    let ctx = Context::new();
    // quantize a tensor's worth of values, pack, and recover them via the
    // fused path within one quantization step
    let values = [0.5f32, -0.9, 0.1, 1.2];
    let config = QuantizationConfig::from_range(-1.5, 1.5, true).unwrap();
    // map into 4-bit codes by rescaling the byte codes down
    let codes: Vec<u8> = values.iter().map(|&v| quant::quantize(v, &config) >> 4).collect();
    let packed = quant::pack_4bit(&codes).unwrap();
    assert_eq!(packed.len(), 2);
    let unpacked = quant::unpack_4bit(&packed);
    assert_eq!(unpacked, codes);

    // and the engine consumes the dequantized buffer as a tensor
    let weights: Vec<f32> = quant::dequantize_4bit_weights(&packed, &config);
    let tensor = Tensor::from_vec(weights, &[2, 2]).unwrap();
    let out = ops::matmul(&ctx, &Tensor::ones(&[1, 2]), &tensor).unwrap();
    assert_eq!(out.shape().dims(), &[1, 2]);
}
