//! Simple recurrent cell with selectable backward truncation.

use crate::node::{check_arity, require_cache, AttrValue, BackwardMode, Node};
use crate::nodes::linear::scaled_uniform;
use crate::param::Parameter;
use quantaflow_core::{ops, Arithmetic, Context, Result, Tensor, TensorError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RnnCache<T> {
    input: Tensor<T>,
    hidden: Tensor<T>,
    preact: Tensor<T>,
}

/// One step of a vanilla recurrent network:
/// `h_t = tanh(x · W_ih + h_prev · W_hh + b)`.
///
/// Inputs are `[x, h_prev]` and the output is `h_t`. The hidden state is
/// both an output and a future input, so backward consults the mode:
/// `FullBackprop` chains `dz · W_hhᵀ` into the hidden-state slot for an
/// external unroller, `OneStepApproximation` substitutes zeros there. The
/// bias gradient accumulates across backward calls so an unroll can sum
/// per-step contributions; the weight gradients overwrite.
#[derive(Debug, Clone)]
pub struct SimpleRnnCell<T> {
    name: String,
    weight_ih: Parameter<T>,
    weight_hh: Parameter<T>,
    bias: Parameter<T>,
    cache: Option<RnnCache<T>>,
}

impl<T: Arithmetic> SimpleRnnCell<T> {
    pub fn new(
        name: impl Into<String>,
        weight_ih: Tensor<T>,
        weight_hh: Tensor<T>,
        bias: Tensor<T>,
    ) -> Result<Self> {
        let name = name.into();
        if weight_ih.rank() != 2 || weight_hh.rank() != 2 || bias.rank() != 1 {
            return Err(TensorError::invalid_argument(
                "SimpleRnnCell",
                format!(
                    "expected rank-2 weights and a rank-1 bias, got ranks {}, {} and {}",
                    weight_ih.rank(),
                    weight_hh.rank(),
                    bias.rank()
                ),
            ));
        }
        let hidden = weight_ih.shape()[1];
        if weight_hh.shape()[0] != hidden || weight_hh.shape()[1] != hidden {
            return Err(TensorError::shape_mismatch(
                "SimpleRnnCell",
                format!("hidden-to-hidden weight of shape [{hidden}, {hidden}]"),
                weight_hh.shape().to_string(),
            ));
        }
        if bias.shape()[0] != hidden {
            return Err(TensorError::shape_mismatch(
                "SimpleRnnCell",
                format!("bias of length {hidden}"),
                bias.shape().to_string(),
            ));
        }
        Ok(Self {
            weight_ih: Parameter::new(format!("{name}.weight_ih"), weight_ih)?,
            weight_hh: Parameter::new(format!("{name}.weight_hh"), weight_hh)?,
            bias: Parameter::new(format!("{name}.bias"), bias)?,
            name,
            cache: None,
        })
    }

    /// Seeded random construction.
    pub fn random(
        name: impl Into<String>,
        input_size: usize,
        hidden_size: usize,
        seed: u64,
    ) -> Result<Self> {
        Self::new(
            name,
            scaled_uniform(&[input_size, hidden_size], input_size, seed)?,
            scaled_uniform(&[hidden_size, hidden_size], hidden_size, seed.wrapping_add(1))?,
            Tensor::zeros(&[hidden_size]),
        )
    }

    pub fn input_size(&self) -> usize {
        self.weight_ih.value().shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.weight_ih.value().shape()[1]
    }

    pub fn weight_ih(&self) -> &Parameter<T> {
        &self.weight_ih
    }

    pub fn weight_hh(&self) -> &Parameter<T> {
        &self.weight_hh
    }

    pub fn bias(&self) -> &Parameter<T> {
        &self.bias
    }

    fn check_inputs(&self, operation: &str, x: &Tensor<T>, h_prev: &Tensor<T>) -> Result<()> {
        if x.rank() != 2 || x.shape()[1] != self.input_size() {
            return Err(TensorError::shape_mismatch(
                operation,
                format!("[batch, {}] input", self.input_size()),
                x.shape().to_string(),
            ));
        }
        if h_prev.rank() != 2
            || h_prev.shape()[0] != x.shape()[0]
            || h_prev.shape()[1] != self.hidden_size()
        {
            return Err(TensorError::shape_mismatch(
                operation,
                format!("[{}, {}] hidden state", x.shape()[0], self.hidden_size()),
                h_prev.shape().to_string(),
            ));
        }
        Ok(())
    }
}

impl<T: Arithmetic> Node<T> for SimpleRnnCell<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "SimpleRnnCell"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "input_size".to_string(),
            AttrValue::Int(self.input_size() as i64),
        );
        attrs.insert(
            "hidden_size".to_string(),
            AttrValue::Int(self.hidden_size() as i64),
        );
        attrs
    }

    fn input_arity(&self) -> usize {
        2
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 2, inputs.len())?;
        let (x, h_prev) = (inputs[0], inputs[1]);
        self.check_inputs("SimpleRnnCell::forward", x, h_prev)?;

        let ih = ops::matmul(ctx, x, self.weight_ih.value())?;
        let hh = ops::matmul(ctx, h_prev, self.weight_hh.value())?;
        let preact = ops::add(ctx, &ops::add(ctx, &ih, &hh)?, self.bias.value())?;
        let out = ops::map(ctx, &preact, |v| v.tanh())?;
        self.cache = Some(RnnCache {
            input: x.clone(),
            hidden: h_prev.clone(),
            preact,
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
        check_arity(&self.name, 2, inputs.len())?;
        let (input, hidden, preact) = {
            let cached = require_cache(&self.name, &self.cache)?;
            crate::node::check_fresh(&self.name, &cached.input, inputs[0])?;
            crate::node::check_fresh(&self.name, &cached.hidden, inputs[1])?;
            (
                cached.input.clone(),
                cached.hidden.clone(),
                cached.preact.clone(),
            )
        };
        if output_grad.shape() != preact.shape() {
            return Err(TensorError::shape_mismatch(
                "SimpleRnnCell::backward",
                preact.shape().to_string(),
                output_grad.shape().to_string(),
            ));
        }

        let local = ops::map(ctx, &preact, |v| v.tanh_grad())?;
        let dz = ops::mul(ctx, output_grad, &local)?;

        let x_t = ops::transpose(ctx, &input)?;
        self.weight_ih.set_grad(ops::matmul(ctx, &x_t, &dz)?)?;
        let h_t = ops::transpose(ctx, &hidden)?;
        self.weight_hh.set_grad(ops::matmul(ctx, &h_t, &dz)?)?;
        // the bias sums across repeated backward calls (sequence unrolling)
        let bias_grad = ops::sum_axis(ctx, &dz, 0, false)?;
        self.bias.accumulate_grad(ctx, bias_grad)?;

        let w_ih_t = ops::transpose(ctx, self.weight_ih.value())?;
        let input_grad = ops::matmul(ctx, &dz, &w_ih_t)?;
        let hidden_grad = match mode {
            BackwardMode::FullBackprop => {
                let w_hh_t = ops::transpose(ctx, self.weight_hh.value())?;
                ops::matmul(ctx, &dz, &w_hh_t)?
            }
            BackwardMode::OneStepApproximation => Tensor::zeros(hidden.shape().dims()),
        };
        Ok(vec![input_grad, hidden_grad])
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        vec![&self.weight_ih, &self.weight_hh, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        vec![&mut self.weight_ih, &mut self.weight_hh, &mut self.bias]
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 2, input_shapes.len())?;
        let x = &input_shapes[0];
        if x.len() != 2 || x[1] != self.input_size() {
            return Err(TensorError::shape_mismatch(
                "SimpleRnnCell::output_shape",
                format!("[batch, {}]", self.input_size()),
                format!("{x:?}"),
            ));
        }
        Ok(vec![x[0], self.hidden_size()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: &[f64], dims: &[usize]) -> Tensor<f64> {
        Tensor::from_vec(data.to_vec(), dims).unwrap()
    }

    fn cell() -> SimpleRnnCell<f64> {
        SimpleRnnCell::new(
            "rnn0",
            tensor(&[0.1, 0.2, 0.3, 0.4], &[2, 2]),
            tensor(&[0.5, 0.0, 0.0, 0.5], &[2, 2]),
            tensor(&[0.01, -0.01], &[2]),
        )
        .unwrap()
    }

    fn preactivations() -> (f64, f64) {
        // x = [1, 2], h_prev = [0.1, -0.2]
        let z0 = 1.0 * 0.1 + 2.0 * 0.3 + 0.1 * 0.5 + 0.01;
        let z1 = 1.0 * 0.2 + 2.0 * 0.4 + (-0.2) * 0.5 + (-0.01);
        (z0, z1)
    }

    #[test]
    fn test_forward_cell_equation() {
        let ctx = Context::new();
        let mut cell = cell();
        let x = tensor(&[1.0, 2.0], &[1, 2]);
        let h_prev = tensor(&[0.1, -0.2], &[1, 2]);
        let h = cell.forward(&ctx, &[&x, &h_prev]).unwrap();

        let (z0, z1) = preactivations();
        assert!((h.get(&[0, 0]).unwrap() - z0.tanh()).abs() < 1e-12);
        assert!((h.get(&[0, 1]).unwrap() - z1.tanh()).abs() < 1e-12);
    }

    #[test]
    fn test_full_backprop_chains_hidden_gradient() {
        let ctx = Context::new();
        let mut cell = cell();
        let x = tensor(&[1.0, 2.0], &[1, 2]);
        let h_prev = tensor(&[0.1, -0.2], &[1, 2]);
        cell.forward(&ctx, &[&x, &h_prev]).unwrap();

        let g = tensor(&[1.0, 1.0], &[1, 2]);
        let grads = cell
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x, &h_prev])
            .unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(grads[1].shape(), h_prev.shape());

        let (z0, z1) = preactivations();
        let dz0 = 1.0 - z0.tanh() * z0.tanh();
        let dz1 = 1.0 - z1.tanh() * z1.tanh();
        // dx = dz · W_ih^T
        assert!((grads[0].get(&[0, 0]).unwrap() - (dz0 * 0.1 + dz1 * 0.2)).abs() < 1e-12);
        assert!((grads[0].get(&[0, 1]).unwrap() - (dz0 * 0.3 + dz1 * 0.4)).abs() < 1e-12);
        // dh_prev = dz · W_hh^T, diagonal 0.5
        assert!((grads[1].get(&[0, 0]).unwrap() - dz0 * 0.5).abs() < 1e-12);
        assert!((grads[1].get(&[0, 1]).unwrap() - dz1 * 0.5).abs() < 1e-12);

        // dW_ih = x^T · dz
        let w_grad = cell.weight_ih().grad().unwrap();
        assert!((w_grad.get(&[0, 0]).unwrap() - dz0).abs() < 1e-12);
        assert!((w_grad.get(&[1, 1]).unwrap() - 2.0 * dz1).abs() < 1e-12);
        // dW_hh = h_prev^T · dz
        let w_grad = cell.weight_hh().grad().unwrap();
        assert!((w_grad.get(&[0, 1]).unwrap() - 0.1 * dz1).abs() < 1e-12);
        assert!((w_grad.get(&[1, 0]).unwrap() - (-0.2) * dz0).abs() < 1e-12);
    }

    #[test]
    fn test_one_step_approximation_zeroes_hidden_gradient() {
        let ctx = Context::new();
        let mut cell = cell();
        let x = tensor(&[1.0, 2.0], &[1, 2]);
        let h_prev = tensor(&[0.1, -0.2], &[1, 2]);
        cell.forward(&ctx, &[&x, &h_prev]).unwrap();

        let g = tensor(&[1.0, 1.0], &[1, 2]);
        let grads = cell
            .backward(&ctx, BackwardMode::OneStepApproximation, &g, &[&x, &h_prev])
            .unwrap();
        assert_eq!(grads[1].shape(), h_prev.shape());
        assert!(grads[1].iter().all(|&v| v == 0.0));
        // the input gradient is unaffected by truncation
        assert!(grads[0].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_bias_gradient_accumulates_weights_overwrite() {
        let ctx = Context::new();
        let mut cell = cell();
        let x = tensor(&[1.0, 2.0], &[1, 2]);
        let h_prev = tensor(&[0.1, -0.2], &[1, 2]);
        let g = tensor(&[1.0, 1.0], &[1, 2]);

        cell.forward(&ctx, &[&x, &h_prev]).unwrap();
        cell.backward(&ctx, BackwardMode::FullBackprop, &g, &[&x, &h_prev])
            .unwrap();
        let bias_once: Vec<f64> = cell.bias().grad().unwrap().iter().copied().collect();
        let w_once: Vec<f64> = cell.weight_ih().grad().unwrap().iter().copied().collect();

        cell.forward(&ctx, &[&x, &h_prev]).unwrap();
        cell.backward(&ctx, BackwardMode::FullBackprop, &g, &[&x, &h_prev])
            .unwrap();
        let bias_twice: Vec<f64> = cell.bias().grad().unwrap().iter().copied().collect();
        let w_twice: Vec<f64> = cell.weight_ih().grad().unwrap().iter().copied().collect();

        for (once, twice) in bias_once.iter().zip(&bias_twice) {
            assert!((twice - 2.0 * once).abs() < 1e-12);
        }
        assert_eq!(w_once, w_twice);
    }

    #[test]
    fn test_constructor_validates_shapes() {
        assert!(SimpleRnnCell::new(
            "r",
            tensor(&[0.1, 0.2], &[1, 2]),
            tensor(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[2, 3]),
            tensor(&[0.0, 0.0], &[2]),
        )
        .is_err());
        assert!(SimpleRnnCell::new(
            "r",
            tensor(&[0.1, 0.2], &[1, 2]),
            tensor(&[0.1, 0.2, 0.3, 0.4], &[2, 2]),
            tensor(&[0.0], &[1]),
        )
        .is_err());
    }
}
