//! Reshape and sequence concatenation/split nodes.

use crate::node::{check_arity, require_cache, AttrValue, BackwardMode, Node};
use quantaflow_core::{ops, Arithmetic, Context, Result, Shape, Tensor, TensorError};
use std::collections::HashMap;

/// Element-count-preserving reshape.
#[derive(Debug, Clone)]
pub struct Reshape<T> {
    name: String,
    target: Vec<usize>,
    cache: Option<Shape>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Arithmetic> Reshape<T> {
    pub fn new(name: impl Into<String>, target: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            target,
            cache: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Arithmetic> Node<T> for Reshape<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Reshape"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "target".to_string(),
            AttrValue::IntList(self.target.iter().map(|&d| d as i64).collect()),
        );
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        let out = ops::reshape(ctx, inputs[0], &self.target)?;
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
        if cached != inputs[0].shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        if output_grad.shape().dims() != self.target.as_slice() {
            return Err(TensorError::shape_mismatch(
                "Reshape::backward",
                format!("{:?}", self.target),
                output_grad.shape().to_string(),
            ));
        }
        Ok(vec![ops::reshape(ctx, output_grad, cached.dims())?])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let have: usize = input_shapes[0].iter().product();
        let want: usize = self.target.iter().product();
        if have != want {
            return Err(TensorError::shape_mismatch(
                "Reshape::output_shape",
                format!("{want} elements for {:?}", self.target),
                format!("{have} elements"),
            ));
        }
        Ok(self.target.clone())
    }
}

/// Concatenate `arity` same-shape inputs along an axis.
///
/// Inputs must share the full shape (sequence-step pattern) so the gradient
/// is recovered with an equal-part split.
#[derive(Debug, Clone)]
pub struct Concat<T> {
    name: String,
    axis: usize,
    arity: usize,
    cache: Option<Shape>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Arithmetic> Concat<T> {
    pub fn new(name: impl Into<String>, axis: usize, arity: usize) -> Result<Self> {
        if arity < 2 {
            return Err(TensorError::invalid_argument(
                "Concat",
                format!("need at least two inputs, got {arity}"),
            ));
        }
        Ok(Self {
            name: name.into(),
            axis,
            arity,
            cache: None,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T: Arithmetic> Node<T> for Concat<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Concat"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert("axis".to_string(), AttrValue::Int(self.axis as i64));
        attrs.insert("inputs".to_string(), AttrValue::Int(self.arity as i64));
        attrs
    }

    fn input_arity(&self) -> usize {
        self.arity
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, self.arity, inputs.len())?;
        for input in &inputs[1..] {
            if input.shape() != inputs[0].shape() {
                return Err(TensorError::shape_mismatch(
                    "Concat::forward",
                    inputs[0].shape().to_string(),
                    input.shape().to_string(),
                ));
            }
        }
        let out = ops::concat(ctx, inputs, self.axis)?;
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
        check_arity(&self.name, self.arity, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?;
        if cached != inputs[0].shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        ops::split(ctx, output_grad, self.axis, self.arity)
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, self.arity, input_shapes.len())?;
        let first = &input_shapes[0];
        if self.axis >= first.len() {
            return Err(TensorError::invalid_axis(
                "Concat::output_shape",
                self.axis,
                first.len(),
            ));
        }
        let mut out = first.clone();
        out[self.axis] *= self.arity;
        Ok(out)
    }
}

/// Select one equal part of an axis split.
///
/// The engine splits into `parts` equal pieces; this node returns piece
/// `index` and scatters its gradient back into zeros everywhere else, so the
/// gradient shape law holds with a single output tensor.
#[derive(Debug, Clone)]
pub struct Split<T> {
    name: String,
    axis: usize,
    parts: usize,
    index: usize,
    cache: Option<Shape>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Arithmetic> Split<T> {
    pub fn new(name: impl Into<String>, axis: usize, parts: usize, index: usize) -> Result<Self> {
        if parts == 0 {
            return Err(TensorError::invalid_argument(
                "Split",
                "part count must be at least 1",
            ));
        }
        if index >= parts {
            return Err(TensorError::invalid_argument(
                "Split",
                format!("part index {index} out of range for {parts} parts"),
            ));
        }
        Ok(Self {
            name: name.into(),
            axis,
            parts,
            index,
            cache: None,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T: Arithmetic> Node<T> for Split<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Split"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert("axis".to_string(), AttrValue::Int(self.axis as i64));
        attrs.insert("parts".to_string(), AttrValue::Int(self.parts as i64));
        attrs.insert("index".to_string(), AttrValue::Int(self.index as i64));
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        let mut parts = ops::split(ctx, inputs[0], self.axis, self.parts)?;
        self.cache = Some(inputs[0].shape().clone());
        Ok(parts.swap_remove(self.index))
    }

    fn backward(
        &mut self,
        ctx: &Context,
        _mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>> {
        check_arity(&self.name, 1, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?.clone();
        if &cached != inputs[0].shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        let mut part_dims = cached.dims().to_vec();
        part_dims[self.axis] /= self.parts;
        if output_grad.shape().dims() != part_dims.as_slice() {
            return Err(TensorError::shape_mismatch(
                "Split::backward",
                format!("{part_dims:?}"),
                output_grad.shape().to_string(),
            ));
        }
        let zeros = Tensor::zeros(&part_dims);
        let pieces: Vec<&Tensor<T>> = (0..self.parts)
            .map(|i| if i == self.index { output_grad } else { &zeros })
            .collect();
        Ok(vec![ops::concat(ctx, &pieces, self.axis)?])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let dims = &input_shapes[0];
        if self.axis >= dims.len() {
            return Err(TensorError::invalid_axis(
                "Split::output_shape",
                self.axis,
                dims.len(),
            ));
        }
        if dims[self.axis] % self.parts != 0 {
            return Err(TensorError::invalid_argument(
                "Split::output_shape",
                format!(
                    "cannot split axis of length {} into {} equal parts",
                    dims[self.axis], self.parts
                ),
            ));
        }
        let mut out = dims.clone();
        out[self.axis] /= self.parts;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: &[f32], dims: &[usize]) -> Tensor<f32> {
        Tensor::from_vec(data.to_vec(), dims).unwrap()
    }

    #[test]
    fn test_reshape_round_trips_gradient() {
        let ctx = Context::new();
        let mut node = Reshape::<f32>::new("reshape0", vec![3, 2]);
        let x = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let out = node.forward(&ctx, &[&x]).unwrap();
        assert_eq!(out.shape().dims(), &[3, 2]);

        let g = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let grads = node
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x])
            .unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(grads[0].as_slice().unwrap(), g.as_slice().unwrap());
    }

    #[test]
    fn test_concat_splits_gradient_back() {
        let ctx = Context::new();
        let mut node = Concat::<f32>::new("concat0", 1, 2).unwrap();
        let a = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = tensor(&[5.0, 6.0, 7.0, 8.0], &[2, 2]);
        let out = node.forward(&ctx, &[&a, &b]).unwrap();
        assert_eq!(out.shape().dims(), &[2, 4]);

        let g = tensor(&[1.0, 2.0, 10.0, 20.0, 3.0, 4.0, 30.0, 40.0], &[2, 4]);
        let grads = node
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&a, &b])
            .unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(grads[1].as_slice().unwrap(), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_concat_rejects_mismatched_parts() {
        let ctx = Context::new();
        let mut node = Concat::<f32>::new("concat0", 0, 2).unwrap();
        let a = tensor(&[1.0, 2.0], &[2]);
        let b = tensor(&[1.0, 2.0, 3.0], &[3]);
        assert!(node.forward(&ctx, &[&a, &b]).is_err());
    }

    #[test]
    fn test_split_scatters_gradient() {
        let ctx = Context::new();
        let mut node = Split::<f32>::new("split0", 1, 2, 1).unwrap();
        let x = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 4]);
        let out = node.forward(&ctx, &[&x]).unwrap();
        assert_eq!(out.shape().dims(), &[2, 2]);
        assert_eq!(out.as_slice().unwrap(), &[3.0, 4.0, 7.0, 8.0]);

        let g = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let grads = node
            .backward(&ctx, BackwardMode::FullBackprop, &g, &[&x])
            .unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(
            grads[0].as_slice().unwrap(),
            &[0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_split_constructor_validation() {
        assert!(Split::<f32>::new("s", 0, 0, 0).is_err());
        assert!(Split::<f32>::new("s", 0, 2, 2).is_err());
        assert!(Split::<f32>::new("s", 0, 2, 1).is_ok());
    }
}
