//! Linear transform over frozen 4-bit quantized weights.

use crate::node::{check_arity, require_cache, AttrValue, BackwardMode, Node};
use quantaflow_core::quant::{self, QuantizationConfig};
use quantaflow_core::{ops, Arithmetic, Context, Result, Shape, Tensor, TensorError};
use std::collections::HashMap;

/// `y = x · Ŵ` where `Ŵ` is dequantized on demand from packed 4-bit codes.
///
/// The packed weights are read-only as far as gradients go: backward
/// computes only the input gradient, and no gradient exists for the scale or
/// zero-point vectors. The dequantized matrix is cached after the first
/// access and must be invalidated whenever the underlying quantized state is
/// replaced; every mutator here does that synchronously.
#[derive(Debug, Clone)]
pub struct QuantizedLinear<T> {
    name: String,
    in_features: usize,
    out_features: usize,
    bits: u8,
    packed: Vec<u8>,
    /// One scale per output feature, or a single global scale.
    scales: Vec<f32>,
    /// Ignored in symmetric mode.
    zero_points: Option<Vec<i32>>,
    symmetric: bool,
    weight_cache: Option<Tensor<T>>,
    input_cache: Option<Shape>,
}

impl<T: Arithmetic> QuantizedLinear<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        bits: u8,
        packed: Vec<u8>,
        scales: Vec<f32>,
        zero_points: Option<Vec<i32>>,
        symmetric: bool,
    ) -> Result<Self> {
        let name = name.into();
        if bits != 4 {
            return Err(TensorError::unsupported_operation(
                "QuantizedLinear",
                format!("only 4-bit weights are supported, got {bits}-bit"),
            ));
        }
        Self::check_packed(in_features, out_features, &packed)?;
        Self::check_scales(out_features, &scales)?;
        if let Some(zp) = &zero_points {
            Self::check_zero_points(symmetric, &scales, zp)?;
        }
        Ok(Self {
            name,
            in_features,
            out_features,
            bits,
            packed,
            scales,
            zero_points,
            symmetric,
            weight_cache: None,
            input_cache: None,
        })
    }

    fn check_packed(in_features: usize, out_features: usize, packed: &[u8]) -> Result<()> {
        let elements = in_features * out_features;
        if packed.len() * 2 != elements {
            return Err(TensorError::invalid_argument(
                "QuantizedLinear",
                format!(
                    "packed buffer holds {} codes but the weight needs {elements}",
                    packed.len() * 2
                ),
            ));
        }
        Ok(())
    }

    fn check_scales(out_features: usize, scales: &[f32]) -> Result<()> {
        if scales.len() != 1 && scales.len() != out_features {
            return Err(TensorError::invalid_argument(
                "QuantizedLinear",
                format!(
                    "scale vector must be global or per output feature (1 or {out_features}), got {}",
                    scales.len()
                ),
            ));
        }
        for &s in scales {
            if !s.is_finite() || s <= 0.0 {
                return Err(TensorError::invalid_argument(
                    "QuantizedLinear",
                    format!("scale must be strictly positive, got {s}"),
                ));
            }
        }
        Ok(())
    }

    fn check_zero_points(symmetric: bool, scales: &[f32], zero_points: &[i32]) -> Result<()> {
        if zero_points.len() != scales.len() {
            return Err(TensorError::invalid_argument(
                "QuantizedLinear",
                format!(
                    "zero-point vector length {} does not match scale vector length {}",
                    zero_points.len(),
                    scales.len()
                ),
            ));
        }
        // ignored, and not validated, when symmetric
        if !symmetric {
            for &zp in zero_points {
                if !(0..=255).contains(&zp) {
                    return Err(TensorError::invalid_argument(
                        "QuantizedLinear",
                        format!("zero point must be in [0, 255], got {zp}"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    fn column_config(&self, column: usize) -> Result<QuantizationConfig> {
        let pick = |v: &[f32]| if v.len() == 1 { 0 } else { column };
        let scale = self.scales[pick(&self.scales)];
        match (&self.zero_points, self.symmetric) {
            (Some(zp), false) => {
                let idx = if zp.len() == 1 { 0 } else { column };
                QuantizationConfig::asymmetric(scale, zp[idx])
            }
            _ => QuantizationConfig::symmetric(scale),
        }
    }

    /// The dequantized `[in, out]` weight matrix. The first call
    /// materializes it; later calls return the identical cached instance
    /// until the cache is invalidated.
    pub fn dequantized_weights(&mut self, ctx: &Context) -> Result<&Tensor<T>> {
        ctx.check_cancelled("QuantizedLinear::dequantized_weights")?;
        if self.weight_cache.is_none() {
            log::debug!("{}: materializing dequantized weight cache", self.name);
            let codes = quant::unpack_4bit(&self.packed);
            let mut values = Vec::with_capacity(codes.len());
            let configs: Vec<QuantizationConfig> = (0..self.out_features)
                .map(|c| self.column_config(c))
                .collect::<Result<_>>()?;
            for (idx, &code) in codes.iter().enumerate() {
                let column = idx % self.out_features;
                values.push(T::from_f32(quant::dequantize(code, &configs[column])));
            }
            let weights = Tensor::from_vec(values, &[self.in_features, self.out_features])?;
            self.weight_cache = Some(weights);
        }
        self.weight_cache
            .as_ref()
            .ok_or_else(|| TensorError::invalid_argument(&self.name, "weight cache vanished"))
    }

    /// Drop the cached dequantized matrix; the next access recomputes it.
    pub fn invalidate_cache(&mut self) {
        if self.weight_cache.take().is_some() {
            log::trace!("{}: dequantized weight cache invalidated", self.name);
        }
    }

    /// Replace the packed weights, invalidating the cache.
    pub fn set_packed_weights(&mut self, packed: Vec<u8>) -> Result<()> {
        Self::check_packed(self.in_features, self.out_features, &packed)?;
        self.packed = packed;
        self.invalidate_cache();
        Ok(())
    }

    /// Replace the scale vector, invalidating the cache.
    pub fn set_scales(&mut self, scales: Vec<f32>) -> Result<()> {
        Self::check_scales(self.out_features, &scales)?;
        if let Some(zp) = &self.zero_points {
            Self::check_zero_points(self.symmetric, &scales, zp)?;
        }
        self.scales = scales;
        self.invalidate_cache();
        Ok(())
    }

    /// Replace the zero-point vector, invalidating the cache.
    pub fn set_zero_points(&mut self, zero_points: Option<Vec<i32>>) -> Result<()> {
        if let Some(zp) = &zero_points {
            Self::check_zero_points(self.symmetric, &self.scales, zp)?;
        }
        self.zero_points = zero_points;
        self.invalidate_cache();
        Ok(())
    }

    fn check_input(&self, operation: &str, input: &Tensor<T>) -> Result<()> {
        if input.rank() != 2 {
            return Err(TensorError::invalid_argument(
                operation,
                format!("expected a rank-2 input, got rank {}", input.rank()),
            ));
        }
        if input.shape()[1] != self.in_features {
            return Err(TensorError::shape_mismatch(
                operation,
                format!(
                    "input trailing dimension to match the weight's leading dimension {}",
                    self.in_features
                ),
                input.shape().to_string(),
            ));
        }
        Ok(())
    }
}

impl<T: Arithmetic> Node<T> for QuantizedLinear<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &'static str {
        "QuantizedLinear"
    }

    fn attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "in_features".to_string(),
            AttrValue::Int(self.in_features as i64),
        );
        attrs.insert(
            "out_features".to_string(),
            AttrValue::Int(self.out_features as i64),
        );
        attrs.insert("bits".to_string(), AttrValue::Int(self.bits as i64));
        attrs.insert("symmetric".to_string(), AttrValue::Bool(self.symmetric));
        attrs.insert("packed".to_string(), AttrValue::Bytes(self.packed.clone()));
        attrs.insert(
            "scales".to_string(),
            AttrValue::FloatList(self.scales.iter().map(|&s| s as f64).collect()),
        );
        if let Some(zp) = &self.zero_points {
            attrs.insert(
                "zero_points".to_string(),
                AttrValue::IntList(zp.iter().map(|&z| z as i64).collect()),
            );
        }
        attrs
    }

    fn input_arity(&self) -> usize {
        1
    }

    fn forward(&mut self, ctx: &Context, inputs: &[&Tensor<T>]) -> Result<Tensor<T>> {
        check_arity(&self.name, 1, inputs.len())?;
        self.check_input("QuantizedLinear::forward", inputs[0])?;
        let input_shape = inputs[0].shape().clone();
        let out = {
            let weights = self.dequantized_weights(ctx)?;
            ops::matmul(ctx, inputs[0], weights)?
        };
        self.input_cache = Some(input_shape);
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
        let cached = require_cache(&self.name, &self.input_cache)?;
        if cached != inputs[0].shape() {
            return Err(TensorError::stale_cache(
                &self.name,
                format!("forward saw shape {cached}, backward got {}", inputs[0].shape()),
            ));
        }
        // quantized weights are frozen: only the input receives gradient
        let input_grad = {
            let weights = self.dequantized_weights(ctx)?;
            let w_t = ops::transpose(ctx, weights)?;
            ops::matmul(ctx, output_grad, &w_t)?
        };
        Ok(vec![input_grad])
    }

    fn output_shape(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        check_arity(&self.name, 1, input_shapes.len())?;
        let dims = &input_shapes[0];
        if dims.len() != 2 || dims[1] != self.in_features {
            return Err(TensorError::shape_mismatch(
                "QuantizedLinear::output_shape",
                format!("[batch, {}]", self.in_features),
                format!("{dims:?}"),
            ));
        }
        Ok(vec![dims[0], self.out_features])
    }
}
