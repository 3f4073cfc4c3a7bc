//! Concrete node implementations.

pub mod dense;
pub mod elementwise;
pub mod ffn;
pub mod linear;
pub mod qlinear;
pub mod rnn;
pub mod shape_ops;

pub use dense::Dense;
pub use elementwise::{Activation, ActivationKind, Add, Constant, Mul};
pub use ffn::FeedForward;
pub use linear::{Bias, Linear};
pub use qlinear::QuantizedLinear;
pub use rnn::SimpleRnnCell;
pub use shape_ops::{Concat, Reshape, Split};
