//! Dense composite: linear transform plus optional bias and activation.

use crate::node::{check_arity, require_cache, single_grad, AttrValue, BackwardMode, Node};
use crate::nodes::elementwise::{Activation, ActivationKind};
use crate::nodes::linear::{scaled_uniform, Bias, Linear};
use crate::param::Parameter;
use quantaflow_core::{Arithmetic, Context, Result, Tensor, TensorError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct DenseCache<T> {
    input: Tensor<T>,
    after_linear: Tensor<T>,
    after_bias: Tensor<T>,
}

/// `y = act(x · W + b)`, composed from the primitive nodes.
///
/// Backward runs the sublayers in exact reverse order of the forward
/// composition, threading each sublayer's input gradient as the next
/// sublayer's output gradient.
#[derive(Debug, Clone)]
pub struct Dense<T> {
    name: String,
    linear: Linear<T>,
    bias: Option<Bias<T>>,
    activation: Option<Activation<T>>,
    cache: Option<DenseCache<T>>,
}

impl<T: Arithmetic> Dense<T> {
    pub fn new(
        name: impl Into<String>,
        weight: Tensor<T>,
        bias: Option<Tensor<T>>,
    ) -> Result<Self> {
        let name = name.into();
        let linear = Linear::new(name.clone(), weight)?;
        let bias = match bias {
            Some(b) => {
                let bias = Bias::new(name.clone(), b)?;
                if bias.features() != linear.out_features() {
                    return Err(TensorError::shape_mismatch(
                        "Dense",
                        format!("bias of length {}", linear.out_features()),
                        format!("length {}", bias.features()),
                    ));
                }
                Some(bias)
            }
            None => None,
        };
        Ok(Self {
            name,
            linear,
            bias,
            activation: None,
            cache: None,
        })
    }

    /// Seeded random construction.
    pub fn random(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        seed: u64,
    ) -> Result<Self> {
        let weight = scaled_uniform(&[in_features, out_features], in_features, seed)?;
        let bias = if use_bias {
            Some(Tensor::zeros(&[out_features]))
        } else {
            None
        };
        Self::new(name, weight, bias)
    }

    pub fn with_activation(mut self, kind: ActivationKind) -> Self {
        self.activation = Some(Activation::new(format!("{}.act", self.name), kind));
        self
    }

    pub fn in_features(&self) -> usize {
        self.linear.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.linear.out_features()
    }

    pub fn weight(&self) -> &Parameter<T> {
        self.linear.weight()
    }

    pub fn bias(&self) -> Option<&Parameter<T>> {
        self.bias.as_ref().map(|b| b.bias())
    }

    pub fn activation(&self) -> Option<ActivationKind> {
        self.activation.as_ref().map(|a| a.kind())
    }
}

impl<T: Arithmetic> Node<T> for Dense<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Dense"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "in_features".to_string(),
            AttrValue::Int(self.in_features() as i64),
        );
        attrs.insert(
            "out_features".to_string(),
            AttrValue::Int(self.out_features() as i64),
        );
        attrs.insert(
            "use_bias".to_string(),
            AttrValue::Bool(self.bias.is_some()),
        );
        if let Some(kind) = self.activation() {
            attrs.insert(
                "activation".to_string(),
                AttrValue::Str(kind.as_str().to_string()),
            );
        }
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        let after_linear = self.linear.forward(ctx, inputs)?;
        let after_bias = match &mut self.bias {
            Some(bias) => bias.forward(ctx, &[&after_linear])?,
            None => after_linear.clone(),
        };
        let out = match &mut self.activation {
            Some(act) => act.forward(ctx, &[&after_bias])?,
            None => after_bias.clone(),
        };
        self.cache = Some(DenseCache {
            input: inputs[0].clone(),
            after_linear,
            after_bias,
        });
        Ok(out)
    }

    fn backward(
        &mut self,
        ctx: &Context,
        mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>> {
        check_arity(&self.name, 1, inputs.len())?;
        let (input, after_linear, after_bias) = {
            let cached = require_cache(&self.name, &self.cache)?;
            crate::node::check_fresh(&self.name, &cached.input, inputs[0])?;
            (
                cached.input.clone(),
                cached.after_linear.clone(),
                cached.after_bias.clone(),
            )
        };

        let mut grad = output_grad.clone();
        if let Some(act) = &mut self.activation {
            grad = single_grad(&self.name, act.backward(ctx, mode, &grad, &[&after_bias])?)?;
        }
        if let Some(bias) = &mut self.bias {
            grad = single_grad(&self.name, bias.backward(ctx, mode, &grad, &[&after_linear])?)?;
        }
        let grad = single_grad(&self.name, self.linear.backward(ctx, mode, &grad, &[&input])?)?;
        Ok(vec![grad])
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = self.linear.parameters();
        if let Some(bias) = &self.bias {
            params.extend(bias.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        let mut params = self.linear.parameters_mut();
        if let Some(bias) = &mut self.bias {
            params.extend(bias.parameters_mut());
        }
        params
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        self.linear.output_shape(input_shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantaflow_core::ops;

    fn tensor(data: &[f32], dims: &[usize]) -> Tensor<f32> {
        Tensor::from_vec(data.to_vec(), dims).unwrap()
    }

    #[test]
    fn test_dense_matches_manual_linear_plus_bias() {
        let ctx = Context::new();
        let weight = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let bias = tensor(&[0.25, -0.25], &[2]);
        let mut dense = Dense::new("dense0", weight.clone(), Some(bias.clone())).unwrap();

        let x = tensor(&[1.0, 0.5, -1.0, 2.0, -0.5, 0.0], &[2, 3]);
        let out = dense.forward(&ctx, &[&x]).unwrap();

        let manual = ops::add(&ctx, &ops::matmul(&ctx, &x, &weight).unwrap(), &bias).unwrap();
        assert_eq!(out.as_slice().unwrap(), manual.as_slice().unwrap());
    }

    #[test]
    fn test_dense_bias_gradient_is_batch_summed_output_gradient() {
        let ctx = Context::new();
        let mut dense = Dense::new(
            "dense0",
            tensor(&[1.0, 0.0, 0.0, 1.0], &[2, 2]),
            Some(tensor(&[0.0, 0.0], &[2])),
        )
        .unwrap();
        let x = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        dense.forward(&ctx, &[&x]).unwrap();

        let g = tensor(&[1.0, 2.0, 10.0, 20.0], &[2, 2]);
        let grads = dense
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x])
            .unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(
            dense.bias().unwrap().grad().unwrap().as_slice().unwrap(),
            &[11.0, 22.0]
        );
        // identity weight: input gradient equals the output gradient
        assert_eq!(grads[0].as_slice().unwrap(), g.as_slice().unwrap());
    }

    #[test]
    fn test_dense_backward_threads_through_activation() {
        let ctx = Context::new();
        let mut dense = Dense::new(
            "dense0",
            tensor(&[2.0], &[1, 1]),
            Some(tensor(&[0.5], &[1])),
        )
        .unwrap()
        .with_activation(ActivationKind::Tanh);

        let x = tensor(&[0.25], &[1, 1]);
        let out = dense.forward(&ctx, &[&x]).unwrap();
        let z = 2.0f32 * 0.25 + 0.5;
        assert!((out.get(&[0, 0]).unwrap() - z.tanh()).abs() < 1e-6);

        let g = tensor(&[1.0], &[1, 1]);
        let grads = dense
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x])
            .unwrap();
        // dx = tanh'(z) * w
        let expected = (1.0 - z.tanh() * z.tanh()) * 2.0;
        assert!((grads[0].get(&[0, 0]).unwrap() - expected).abs() < 1e-6);
        // dW = x * tanh'(z)
        let w_grad = dense.weight().grad().unwrap().get(&[0, 0]).unwrap();
        assert!((w_grad - 0.25 * (1.0 - z.tanh() * z.tanh())).abs() < 1e-6);
    }

    #[test]
    fn test_dense_parameter_list() {
        let dense = Dense::<f32>::random("dense0", 3, 2, true, 11).unwrap();
        let params = dense.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name(), "dense0.weight");
        assert_eq!(params[1].name(), "dense0.bias");

        let no_bias = Dense::<f32>::random("dense1", 3, 2, false, 11).unwrap();
        assert_eq!(no_bias.parameters().len(), 1);
    }
}
