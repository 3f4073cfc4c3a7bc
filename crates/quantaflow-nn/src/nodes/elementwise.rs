//! Constant, elementwise binary and unary activation nodes.

use crate::node::{check_arity, require_cache, AttrValue, BackwardMode, Node};
use quantaflow_core::{ops, Arithmetic, Context, Result, Shape, Tensor, TensorError};
use std::collections::HashMap;

/// Named activation functions, dispatched through the arithmetic contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Sigmoid,
    Tanh,
    Relu,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
            ActivationKind::Relu => "relu",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            "tanh" => Ok(ActivationKind::Tanh),
            "relu" => Ok(ActivationKind::Relu),
            other => Err(TensorError::invalid_argument(
                "ActivationKind",
                format!("unknown activation '{other}'"),
            )),
        }
    }

    pub(crate) fn apply<T: Arithmetic>(self, v: T) -> T {
        match self {
            ActivationKind::Sigmoid => v.sigmoid(),
            ActivationKind::Tanh => v.tanh(),
            ActivationKind::Relu => v.relu(),
        }
    }

    /// Analytic derivative, evaluated on the pre-activation value.
    pub(crate) fn gradient<T: Arithmetic>(self, v: T) -> T {
        match self {
            ActivationKind::Sigmoid => v.sigmoid_grad(),
            ActivationKind::Tanh => v.tanh_grad(),
            ActivationKind::Relu => v.relu_grad(),
        }
    }
}

/// A fixed tensor with no inputs and no gradient flow.
#[derive(Debug, Clone)]
pub struct Constant<T> {
    name: String,
    value: Tensor<T>,
}

impl<T: Arithmetic> Constant<T> {
    pub fn new(name: impl Into<String>, value: Tensor<T>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TensorError::invalid_argument(
                "Constant",
                "node name must not be empty",
            ));
        }
        Ok(Self { name, value })
    }

    pub fn value(&self) -> &Tensor<T> {
        &self.value
    }
}

impl<T: Arithmetic> Node<T> for Constant<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Constant"
    }

    fn input_arity(&self) -> usize {
        0
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        ctx.check_cancelled("Constant::forward")?;
        check_arity(&self.name, 0, inputs.len())?;
        Ok(self.value.clone())
    }

    fn backward(
        &mut self,
        ctx: &Context,
        _mode: BackwardMode,
        output_grad: &Tensor<T>,
        inputs: &[&Tensor<T>],
    ) -> Result<Vec<Tensor<T>>> {
        ctx.check_cancelled("Constant::backward")?;
        check_arity(&self.name, 0, inputs.len())?;
        if output_grad.shape() != self.value.shape() {
            return Err(TensorError::shape_mismatch(
                "Constant::backward",
                self.value.shape().to_string(),
                output_grad.shape().to_string(),
            ));
        }
        Ok(Vec::new())
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 0, input_shapes.len())?;
        Ok(self.value.shape().dims().to_vec())
    }
}

/// Elementwise sum of two same-shape inputs.
#[derive(Debug, Clone)]
pub struct Add<T> {
    name: String,
    cache: Option<Shape>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Arithmetic> Add<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Arithmetic> Node<T> for Add<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Add"
    }

    fn input_arity(&self) -> usize {
        2
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 2, inputs.len())?;
        if inputs[0].shape() != inputs[1].shape() {
            return Err(TensorError::shape_mismatch(
                "Add::forward",
                inputs[0].shape().to_string(),
                inputs[1].shape().to_string(),
            ));
        }
        let out = ops::add(ctx, inputs[0], inputs[1])?;
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
        ctx.check_cancelled("Add::backward")?;
        check_arity(&self.name, 2, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?;
        if cached != inputs[0].shape() || cached != output_grad.shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        Ok(vec![output_grad.clone(), output_grad.clone()])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 2, input_shapes.len())?;
        if input_shapes[0] != input_shapes[1] {
            return Err(TensorError::shape_mismatch(
                "Add::output_shape",
                format!("{:?}", input_shapes[0]),
                format!("{:?}", input_shapes[1]),
            ));
        }
        Ok(input_shapes[0].clone())
    }
}

/// Elementwise (Hadamard) product of two same-shape inputs.
#[derive(Debug, Clone)]
pub struct Mul<T> {
    name: String,
    cache: Option<Shape>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Arithmetic> Mul<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Arithmetic> Node<T> for Mul<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Mul"
    }

    fn input_arity(&self) -> usize {
        2
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 2, inputs.len())?;
        let out = ops::mul(ctx, inputs[0], inputs[1])?;
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
        check_arity(&self.name, 2, inputs.len())?;
        let cached = require_cache(&self.name, &self.cache)?;
        if cached != inputs[0].shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        let grad_a = ops::mul(ctx, output_grad, inputs[1])?;
        let grad_b = ops::mul(ctx, output_grad, inputs[0])?;
        Ok(vec![grad_a, grad_b])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 2, input_shapes.len())?;
        Ok(input_shapes[0].clone())
    }
}

/// Unary activation node; caches its pre-activation input for backward.
#[derive(Debug, Clone)]
pub struct Activation<T> {
    name: String,
    kind: ActivationKind,
    cache: Option<Tensor<T>>,
}

impl<T: Arithmetic> Activation<T> {
    pub fn new(name: impl Into<String>, kind: ActivationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            cache: None,
        }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl<T: Arithmetic> Node<T> for Activation<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "Activation"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "kind".to_string(),
            AttrValue::Str(self.kind.as_str().to_string()),
        );
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        let kind = self.kind;
        let out = ops::map(ctx, inputs[0], |v| kind.apply(v))?;
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
        crate::node::check_fresh(&self.name, cached, inputs[0])?;
        let kind = self.kind;
        let local = ops::map(ctx, cached, |v| kind.gradient(v))?;
        Ok(vec![ops::mul(ctx, output_grad, &local)?])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        Ok(input_shapes[0].clone())
    }
}
