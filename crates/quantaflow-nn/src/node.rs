//! The node contract: forward value computation paired with backward
//! gradient computation.

use crate::param::Parameter;
use quantaflow_core::{Arithmetic, Context, Result, Tensor, TensorError};
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How far a backward call propagates gradient through stateful inputs.
///
/// Only the recurrent cell consults this: `FullBackprop` chains the
/// hidden-state gradient onward so an external unroller can run full
/// backpropagation through time; `OneStepApproximation` substitutes a zero
/// gradient there, truncating the chain at one step. Every other node
/// behaves identically under both modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum BackwardMode {
    FullBackprop,
    OneStepApproximation,
}

/// Serializable attribute of a node description.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    Bytes(Vec<u8>),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            AttrValue::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_list(&self) -> Option<&[f64]> {
        match self {
            AttrValue::FloatList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// A unit in the computation graph.
///
/// Lifecycle per instance: uninitialized → forward-computed (intermediate
/// tensors cached) → backward-computed (gradients populated) →
/// forward-computed again, indefinitely. The cached state is unsynchronized;
/// one instance must be driven from one thread at a time, which the
/// `&mut self` receivers enforce. Distinct instances are independent.
pub trait Node<T: Arithmetic> {
    fn name(&self) -> &str;

    /// Operation tag used by the registry to rebuild the node.
    fn op_type(&self) -> &'static str;

    /// Self-describing attribute map for serialization. Together with the
    /// parameter list this is everything a loader needs.
    fn attributes(&self) -> HashMap<String, AttrValue> {
        HashMap::new()
    }

    /// Number of input tensors forward and backward accept.
    fn input_arity(&self) -> usize;

    /// Compute the output, caching whatever backward will need.
    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>>;

    /// Compute one gradient per declared input, in input order, each with
    /// its input's shape. For nodes with parameters, also writes each
    /// parameter's gradient. Calling this without a preceding matching
    /// forward on the same instance is an explicit error.
    fn backward(
        &mut self,
        ctx: &Context,
        mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>>;

    fn parameters(&self) -> Vec<&Parameter<T>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        Vec::new()
    }

    /// Shape of the output for the given input shapes, without computing.
    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>>;
}

pub(crate) fn check_arity(node: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(TensorError::invalid_argument(
            node,
            format!("expected {expected} input(s), got {got}"),
        ));
    }
    Ok(())
}

/// Fetch a forward cache, failing when backward runs before forward.
pub(crate) fn require_cache<'a, C>(node: &str, cache: &'a Option<C>) -> Result<&'a C> {
    cache
        .as_ref()
        .ok_or_else(|| TensorError::backward_before_forward(node))
}

/// Verify that the inputs handed to backward still match the cached forward.
pub(crate) fn check_fresh<T: Arithmetic>(
    node: &str,
    cached: &Tensor<T>,
    input: &Tensor<T>,
) -> Result<()> {
    if cached.shape() != input.shape() {
        return Err(TensorError::stale_cache(
            node,
            format!(
                "forward saw shape {}, backward got {}",
                cached.shape(),
                input.shape()
            ),
        ));
    }
    Ok(())
}

/// Unwrap the single input-gradient of an arity-1 sublayer.
pub(crate) fn single_grad<T: Arithmetic>(
    node: &str,
    mut grads: Vec<Tensor<T>>,
) -> Result<Tensor<T>> {
    match grads.len() {
        1 => Ok(grads.remove(0)),
        n => Err(TensorError::invalid_argument(
            node,
            format!("expected one input gradient from sublayer, got {n}"),
        )),
    }
}
