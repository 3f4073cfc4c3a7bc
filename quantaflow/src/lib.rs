//! # QuantafloW
//!
//! A small automatic-differentiation layer framework: composable computation
//! nodes with explicit forward/backward passes, written once against a
//! swappable scalar [`Arithmetic`] contract (f32, f64, f16, an E4M3 byte
//! float, i8, u8), plus a 4-bit weight quantization subsystem with packed
//! sub-byte storage and a cached dequantized-weight matrix.
//!
//! ## Quick start
//!
//! ```rust
//! use quantaflow::prelude::*;
//!
//! # fn main() -> quantaflow::Result<()> {
//! let ctx = Context::new();
//!
//! // a dense layer over f32, seeded init
//! let mut dense = Dense::<f32>::random("dense0", 4, 2, true, 42)?;
//! let x = Tensor::<f32>::ones(&[3, 4]);
//! let y = dense.forward(&ctx, &[&x])?;
//! assert_eq!(y.shape().dims(), &[3, 2]);
//!
//! // gradients flow back through the same node
//! let grads = dense.backward(&ctx, BackwardMode::FullBackprop, &y, &[&x])?;
//! assert_eq!(grads[0].shape().dims(), &[3, 4]);
//! assert!(dense.weight().grad().is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## 4-bit quantized weights
//!
//! ```rust
//! use quantaflow::prelude::*;
//! use quantaflow::quant;
//!
//! # fn main() -> quantaflow::Result<()> {
//! let config = QuantizationConfig::symmetric(0.1)?;
//! let packed = quant::pack_4bit(&[2, 1, 4, 3])?;
//! let mut node = QuantizedLinear::<f32>::new(
//!     "q0", 2, 2, 4, packed, vec![0.1], None, true,
//! )?;
//!
//! let ctx = Context::new();
//! let x = Tensor::<f32>::ones(&[1, 2]);
//! let y = node.forward(&ctx, &[&x])?;
//! assert_eq!(y.shape().dims(), &[1, 2]);
//! # let _ = config;
//! # Ok(())
//! # }
//! ```

pub use quantaflow_core::{
    arith, context, dtype, error, f16, ops, quant, shape, tensor, Arithmetic, Context, DType,
    Float8, QuantizationConfig, Result, Shape, Tensor, TensorError, SYMMETRIC_ZERO_POINT,
};
pub use quantaflow_nn::{
    node, nodes, param, registry, Activation, ActivationKind, Add, AttrMap, AttrValue,
    BackwardMode, Bias, Concat, Constant, Dense, FeedForward, Linear, Mul, Node, NodeRegistry,
    ParamMap, Parameter, QuantizedLinear, Reshape, SimpleRnnCell, Split,
};

/// Everything needed for typical use.
pub mod prelude {
    pub use quantaflow_core::{
        Arithmetic, Context, DType, Float8, QuantizationConfig, Result, Shape, Tensor, TensorError,
    };
    pub use quantaflow_nn::{
        ActivationKind, AttrValue, BackwardMode, Dense, FeedForward, Node, NodeRegistry,
        Parameter, QuantizedLinear, SimpleRnnCell,
    };
}
