//! Linear transform and bias nodes, plus the shared weight initializer.

use crate::node::{check_arity, check_fresh, require_cache, AttrValue, BackwardMode, Node};
use crate::param::Parameter;
use quantaflow_core::{ops, Arithmetic, Context, Result, Shape, Tensor, TensorError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

/// Seeded uniform init in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
pub(crate) fn scaled_uniform<T: Arithmetic>(
    dims: &[usize],
    fan_in: usize,
    seed: u64,
) -> Result<Tensor<T>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = 1.0 / (fan_in.max(1) as f64).sqrt();
    let data = (0..dims.iter().product::<usize>())
        .map(|_| T::from_f64(rng.gen_range(-1.0..1.0) * scale))
        .collect();
    Tensor::from_vec(data, dims)
}

/// `y = x · W` with `W: [in, out]`. Backward writes the weight gradient
/// `xᵀ · g` and returns the input gradient `g · Wᵀ`.
#[derive(Debug, Clone)]
pub struct Linear<T> {
    name: String,
    weight: Parameter<T>,
    cache: Option<Tensor<T>>,
}

impl<T: Arithmetic> Linear<T> {
    pub fn new(name: impl Into<String>, weight: Tensor<T>) -> Result<Self> {
        let name = name.into();
        if weight.rank() != 2 {
            return Err(TensorError::invalid_argument(
                "Linear",
                format!("weight must be rank 2, got rank {}", weight.rank()),
            ));
        }
        let weight = Parameter::new(format!("{name}.weight"), weight)?;
        Ok(Self {
            name,
            weight,
            cache: None,
        })
    }

    /// Seeded random construction.
    pub fn random(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        seed: u64,
    ) -> Result<Self> {
        let weight = scaled_uniform(&[in_features, out_features], in_features, seed)?;
        Self::new(name, weight)
    }

    pub fn in_features(&self) -> usize {
        self.weight.value().shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value().shape()[1]
    }

    pub fn weight(&self) -> &Parameter<T> {
        &self.weight
    }

    fn check_input(&self, operation: &str, input: &Tensor<T>) -> Result<()> {
        if input.rank() != 2 {
            return Err(TensorError::invalid_argument(
                operation,
                format!("expected a rank-2 input, got rank {}", input.rank()),
            ));
        }
        if input.shape()[1] != self.in_features() {
            return Err(TensorError::shape_mismatch(
                operation,
                format!("trailing input dimension {}", self.in_features()),
                input.shape().to_string(),
            ));
        }
        Ok(())
    }
}

impl<T: Arithmetic> Node<T> for Linear<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Linear"
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
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        self.check_input("Linear::forward", inputs[0])?;
        let out = ops::matmul(ctx, inputs[0], self.weight.value())?;
        self.cache = Some(inputs[0].clone());
        Ok(out)
    }

    fn backward(
        &mut self,
        ctx: &Context,
        _mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>> {
        check_arity(&self.name, 1, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?;
        check_fresh(&self.name, cached, inputs[0])?;

        let x_t = ops::transpose(ctx, cached)?;
        let weight_grad = ops::matmul(ctx, &x_t, output_grad)?;
        let w_t = ops::transpose(ctx, self.weight.value())?;
        let input_grad = ops::matmul(ctx, output_grad, &w_t)?;
        self.weight.set_grad(weight_grad)?;
        Ok(vec![input_grad])
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        vec![&mut self.weight]
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let dims = &input_shapes[0];
        if dims.len() != 2 || dims[1] != self.in_features() {
            return Err(TensorError::shape_mismatch(
                "Linear::output_shape",
                format!("[batch, {}]", self.in_features()),
                format!("{dims:?}"),
            ));
        }
        Ok(vec![dims[0], self.out_features()])
    }
}

/// `y = x + b` with a rank-1 bias broadcast over the batch axis. Backward
/// writes the batch-summed bias gradient and passes the output gradient
/// through unchanged.
#[derive(Debug, Clone)]
pub struct Bias<T> {
    name: String,
    bias: Parameter<T>,
    cache: Option<Shape>,
}

impl<T: Arithmetic> Bias<T> {
    pub fn new(name: impl Into<String>, bias: Tensor<T>) -> Result<Self> {
        let name = name.into();
        if bias.rank() != 1 {
            return Err(TensorError::invalid_argument(
                "Bias",
                format!("bias must be rank 1, got rank {}", bias.rank()),
            ));
        }
        let bias = Parameter::new(format!("{name}.bias"), bias)?;
        Ok(Self {
            name,
            bias,
            cache: None,
        })
    }

    pub fn features(&self) -> usize {
        self.bias.value().shape()[0]
    }

    pub fn bias(&self) -> &Parameter<T> {
        &self.bias
    }

    fn check_input(&self, operation: &str, input: &Tensor<T>) -> Result<()> {
        if input.rank() != 2 || input.shape()[1] != self.features() {
            return Err(TensorError::shape_mismatch(
                operation,
                format!("[batch, {}]", self.features()),
                input.shape().to_string(),
            ));
        }
        Ok(())
    }
}

impl<T: Arithmetic> Node<T> for Bias<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Bias"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "features".to_string(),
            AttrValue::Int(self.features() as i64),
        );
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        self.check_input("Bias::forward", inputs[0])?;
        let out = ops::add(ctx, inputs[0], self.bias.value())?;
        self.cache = Some(inputs[0].shape().clone());
        Ok(out)
    }

    fn backward(
        &mut self,
        ctx: &Context,
        _mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>> {
        check_arity(&self.name, 1, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?;
        if cached != inputs[0].shape() || cached != output_grad.shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", output_grad.shape()),
            ));
        }
        let bias_grad = ops::sum_axis(ctx, output_grad, 0, false)?;
        self.bias.set_grad(bias_grad)?;
        Ok(vec![output_grad.clone()])
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        vec![&self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        vec![&mut self.bias]
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let dims = &input_shapes[0];
        if dims.len() != 2 || dims[1] != self.features() {
            return Err(TensorError::shape_mismatch(
                "Bias::output_shape",
                format!("[batch, {}]", self.features()),
                format!("{dims:?}"),
            ));
        }
        Ok(dims.clone())
    }
}
