//! Learnable parameters owned by nodes.

use quantaflow_core::{ops, Arithmetic, Context, Result, Tensor, TensorError};

/// A named value tensor paired with its gradient.
///
/// The gradient is absent until the owning node's first backward call and is
/// overwritten on every subsequent one, unless the node explicitly
/// accumulates (see [`Parameter::accumulate_grad`]). The value is mutated
/// only from outside, by an optimizer.
#[derive(Debug, Clone)]
pub struct Parameter<T> {
    name: String,
    value: Tensor<T>,
    grad: Option<Tensor<T>>,
}

impl<T: Arithmetic> Parameter<T> {
    pub fn new(name: impl Into<String>, value: Tensor<T>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TensorError::invalid_argument(
                "Parameter",
                "parameter name must not be empty",
            ));
        }
        Ok(Self {
            name,
            value,
            grad: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor<T> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor<T> {
        &mut self.value
    }

    pub fn grad(&self) -> Option<&Tensor<T>> {
        self.grad.as_ref()
    }

    /// Overwrite the gradient. The shape must match the value tensor.
    pub fn set_grad(&mut self, grad: Tensor<T>) -> Result<()> {
        if grad.shape() != self.value.shape() {
            return Err(TensorError::shape_mismatch(
                "Parameter::set_grad",
                self.value.shape().to_string(),
                grad.shape().to_string(),
            ));
        }
        self.grad = Some(grad);
        Ok(())
    }

    /// Sum a new contribution into the gradient, as the recurrent cell's
    /// bias does across repeated backward calls in an unroll.
    pub fn accumulate_grad(&mut self, ctx: &Context, grad: Tensor<T>) -> Result<()> {
        match self.grad.take() {
            Some(existing) => {
                let summed = ops::add(ctx, &existing, &grad)?;
                self.set_grad(summed)
            }
            None => self.set_grad(grad),
        }
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }
}
