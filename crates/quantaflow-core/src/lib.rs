//! Core numeric foundations for QuantafloW.
//!
//! Three pieces live here: the [`Arithmetic`] capability that every element
//! representation implements once, the minimal [`Tensor`] engine the node
//! layer consumes, and the pure quantization / 4-bit packing functions in
//! [`quant`]. Everything is CPU-side, synchronous and deterministic;
//! cancellation is cooperative through [`Context`].

pub mod arith;
pub mod context;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod quant;
pub mod shape;
pub mod tensor;

pub use arith::{f16, Arithmetic, Float8};
pub use context::Context;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use quant::{QuantizationConfig, SYMMETRIC_ZERO_POINT};
pub use shape::Shape;
pub use tensor::Tensor;
