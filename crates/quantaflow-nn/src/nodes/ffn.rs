//! Gated feed-forward block.

use crate::node::{check_arity, require_cache, single_grad, AttrValue, BackwardMode, Node};
use crate::nodes::dense::Dense;
use crate::nodes::elementwise::ActivationKind;
use crate::nodes::linear::scaled_uniform;
use crate::param::Parameter;
use quantaflow_core::{ops, Arithmetic, Context, Result, Tensor, TensorError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct FfnCache<T> {
    input: Tensor<T>,
    gate_out: Tensor<T>,
    up_out: Tensor<T>,
    hidden: Tensor<T>,
}

/// `y = down(sigmoid(gate(x)) ⊙ up(x))`: three linear+bias sublayers joined
/// by a sigmoid gate.
///
/// The gate and up projections both consume the block input, so backward
/// adds their two returned input gradients: a value consumed by two
/// downstream paths receives the sum, never a concatenation.
#[derive(Debug, Clone)]
pub struct FeedForward<T> {
    name: String,
    gate: Dense<T>,
    up: Dense<T>,
    down: Dense<T>,
    cache: Option<FfnCache<T>>,
}

impl<T: Arithmetic> FeedForward<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        gate_weight: Tensor<T>,
        gate_bias: Tensor<T>,
        up_weight: Tensor<T>,
        up_bias: Tensor<T>,
        down_weight: Tensor<T>,
        down_bias: Tensor<T>,
    ) -> Result<Self> {
        let name = name.into();
        let gate = Dense::new(format!("{name}.gate"), gate_weight, Some(gate_bias))?
            .with_activation(ActivationKind::Sigmoid);
        let up = Dense::new(format!("{name}.up"), up_weight, Some(up_bias))?;
        let down = Dense::new(format!("{name}.down"), down_weight, Some(down_bias))?;
        if up.in_features() != gate.in_features() || up.out_features() != gate.out_features() {
            return Err(TensorError::shape_mismatch(
                "FeedForward",
                format!(
                    "up projection of shape [{}, {}]",
                    gate.in_features(),
                    gate.out_features()
                ),
                format!("[{}, {}]", up.in_features(), up.out_features()),
            ));
        }
        if down.in_features() != gate.out_features() {
            return Err(TensorError::shape_mismatch(
                "FeedForward",
                format!("down projection with leading dimension {}", gate.out_features()),
                format!("leading dimension {}", down.in_features()),
            ));
        }
        Ok(Self {
            name,
            gate,
            up,
            down,
            cache: None,
        })
    }

    /// Seeded random construction.
    pub fn random(
        name: impl Into<String>,
        in_features: usize,
        hidden_features: usize,
        out_features: usize,
        seed: u64,
    ) -> Result<Self> {
        let name = name.into();
        Self::new(
            name,
            scaled_uniform(&[in_features, hidden_features], in_features, seed)?,
            Tensor::zeros(&[hidden_features]),
            scaled_uniform(&[in_features, hidden_features], in_features, seed.wrapping_add(1))?,
            Tensor::zeros(&[hidden_features]),
            scaled_uniform(&[hidden_features, out_features], hidden_features, seed.wrapping_add(2))?,
            Tensor::zeros(&[out_features]),
        )
    }

    pub fn in_features(&self) -> usize {
        self.gate.in_features()
    }

    pub fn hidden_features(&self) -> usize {
        self.gate.out_features()
    }

    pub fn out_features(&self) -> usize {
        self.down.out_features()
    }
}

impl<T: Arithmetic> Node<T> for FeedForward<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "FeedForward"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "in_features".to_string(),
            AttrValue::Int(self.in_features() as i64),
        );
        attrs.insert(
            "hidden_features".to_string(),
            AttrValue::Int(self.hidden_features() as i64),
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
        let gate_out = self.gate.forward(ctx, inputs)?;
        let up_out = self.up.forward(ctx, inputs)?;
        let hidden = ops::mul(ctx, &gate_out, &up_out)?;
        let out = self.down.forward(ctx, &[&hidden])?;
        self.cache = Some(FfnCache {
            input: inputs[0].clone(),
            gate_out,
            up_out,
            hidden,
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
        let (input, gate_out, up_out, hidden) = {
            let cached = require_cache(&self.name, &self.cache)?;
            crate::node::check_fresh(&self.name, &cached.input, inputs[0])?;
            (
                cached.input.clone(),
                cached.gate_out.clone(),
                cached.up_out.clone(),
                cached.hidden.clone(),
            )
        };

        // reverse composition order: down, then the gate product, then both
        // parallel projections
        let hidden_grad = single_grad(
            &self.name,
            self.down.backward(ctx, mode, output_grad, &[&hidden])?,
        )?;
        let gate_out_grad = ops::mul(ctx, &hidden_grad, &up_out)?;
        let up_out_grad = ops::mul(ctx, &hidden_grad, &gate_out)?;
        let gate_input_grad = single_grad(
            &self.name,
            self.gate.backward(ctx, mode, &gate_out_grad, &[&input])?,
        )?;
        let up_input_grad = single_grad(
            &self.name,
            self.up.backward(ctx, mode, &up_out_grad, &[&input])?,
        )?;
        // the input fans out into both projections: gradients sum
        Ok(vec![ops::add(ctx, &gate_input_grad, &up_input_grad)?])
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = self.gate.parameters();
        params.extend(self.up.parameters());
        params.extend(self.down.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        let mut params = self.gate.parameters_mut();
        params.extend(self.up.parameters_mut());
        params.extend(self.down.parameters_mut());
        params
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let dims = &input_shapes[0];
        if dims.len() != 2 || dims[1] != self.in_features() {
            return Err(TensorError::shape_mismatch(
                "FeedForward::output_shape",
                format!("[batch, {}]", self.in_features()),
                format!("{dims:?}"),
            ));
        }
        Ok(vec![dims[0], self.out_features()])
    }
}
