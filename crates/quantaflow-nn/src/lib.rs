//! Node/parameter autodiff contract for QuantafloW.
//!
//! Every concrete node implements [`Node`]: a forward value computation that
//! caches what backward needs, and a backward gradient computation returning
//! one gradient per input while writing parameter gradients by the chain
//! rule. Composite nodes ([`Dense`], [`FeedForward`], [`SimpleRnnCell`])
//! compose the primitives and run their backward in exact reverse order of
//! the forward composition. [`NodeRegistry`] rebuilds any node from its
//! operation tag, parameter map and attribute map.

pub mod node;
pub mod nodes;
pub mod param;
pub mod registry;

pub use node::{AttrValue, BackwardMode, Node};
pub use nodes::{
    Activation, ActivationKind, Add, Bias, Concat, Constant, Dense, FeedForward, Linear, Mul,
    QuantizedLinear, Reshape, SimpleRnnCell, Split,
};
pub use param::Parameter;
pub use registry::{AttrMap, NodeRegistry, ParamMap};
