//! Explicit node registry for model loading.
//!
//! Maps an operation tag to a builder that reconstructs the node from its
//! serialized parameters and attributes. The registry is an ordinary value:
//! build it once at process start (usually via
//! [`NodeRegistry::with_builtin_nodes`]), optionally add custom builders,
//! then use it immutably. There is no global registration side effect.

use crate::node::{AttrValue, Node};
use crate::nodes::{
    Activation, ActivationKind, Add, Bias, Concat, Constant, Dense, FeedForward, Linear, Mul,
    QuantizedLinear, Reshape, SimpleRnnCell, Split,
};
use quantaflow_core::{Arithmetic, Result, Tensor, TensorError};
use std::collections::HashMap;

/// Serialized parameter tensors by name.
pub type ParamMap<T> = HashMap<String, Tensor<T>>;
/// Serialized attributes by name.
pub type AttrMap = HashMap<String, AttrValue>;

type BoxedBuilder<T> =
    Box<dyn Fn(&str, &mut ParamMap<T>, &AttrMap) -> Result<Box<dyn Node<T>>> + Send + Sync>;

pub struct NodeRegistry<T: Arithmetic> {
    builders: HashMap<String, BoxedBuilder<T>>,
}

impl<T: Arithmetic> NodeRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// A registry pre-populated with every node this crate defines.
    pub fn with_builtin_nodes() -> Self {
        let mut registry = Self::new();
        registry.register("Constant", |name, params, _attrs| {
            let value = take_param("Constant", params, "value")?;
            Ok(Box::new(Constant::new(name, value)?) as Box<dyn Node<T>>)
        });
        registry.register("Add", |name, _params, _attrs| {
            Ok(Box::new(Add::new(name)) as Box<dyn Node<T>>)
        });
        registry.register("Mul", |name, _params, _attrs| {
            Ok(Box::new(Mul::new(name)) as Box<dyn Node<T>>)
        });
        registry.register("Activation", |name, _params, attrs| {
            let kind = ActivationKind::parse(attr_str("Activation", attrs, "kind")?)?;
            Ok(Box::new(Activation::new(name, kind)) as Box<dyn Node<T>>)
        });
        registry.register("Reshape", |name, _params, attrs| {
            let target = attr_usize_list("Reshape", attrs, "target")?;
            Ok(Box::new(Reshape::new(name, target)) as Box<dyn Node<T>>)
        });
        registry.register("Concat", |name, _params, attrs| {
            let axis = attr_usize("Concat", attrs, "axis")?;
            let inputs = attr_usize("Concat", attrs, "inputs")?;
            Ok(Box::new(Concat::new(name, axis, inputs)?) as Box<dyn Node<T>>)
        });
        registry.register("Split", |name, _params, attrs| {
            let axis = attr_usize("Split", attrs, "axis")?;
            let parts = attr_usize("Split", attrs, "parts")?;
            let index = attr_usize("Split", attrs, "index")?;
            Ok(Box::new(Split::new(name, axis, parts, index)?) as Box<dyn Node<T>>)
        });
        registry.register("Linear", |name, params, _attrs| {
            let weight = take_param("Linear", params, "weight")?;
            Ok(Box::new(Linear::new(name, weight)?) as Box<dyn Node<T>>)
        });
        registry.register("Bias", |name, params, _attrs| {
            let bias = take_param("Bias", params, "bias")?;
            Ok(Box::new(Bias::new(name, bias)?) as Box<dyn Node<T>>)
        });
        registry.register("Dense", |name, params, attrs| {
            let weight = take_param("Dense", params, "weight")?;
            let bias = params.remove("bias");
            let mut dense = Dense::new(name, weight, bias)?;
            if let Some(value) = attrs.get("activation") {
                let kind = value.as_str().ok_or_else(|| {
                    TensorError::invalid_argument("Dense", "attribute 'activation' must be a string")
                })?;
                dense = dense.with_activation(ActivationKind::parse(kind)?);
            }
            Ok(Box::new(dense) as Box<dyn Node<T>>)
        });
        registry.register("QuantizedLinear", |name, _params, attrs| {
            let in_features = attr_usize("QuantizedLinear", attrs, "in_features")?;
            let out_features = attr_usize("QuantizedLinear", attrs, "out_features")?;
            let bits = attr_int("QuantizedLinear", attrs, "bits")? as u8;
            let symmetric = attr_bool("QuantizedLinear", attrs, "symmetric")?;
            let packed = attrs
                .get("packed")
                .and_then(AttrValue::as_bytes)
                .ok_or_else(|| {
                    TensorError::invalid_argument(
                        "QuantizedLinear",
                        "missing byte attribute 'packed'",
                    )
                })?
                .to_vec();
            let scales = attrs
                .get("scales")
                .and_then(AttrValue::as_float_list)
                .ok_or_else(|| {
                    TensorError::invalid_argument(
                        "QuantizedLinear",
                        "missing float-list attribute 'scales'",
                    )
                })?
                .iter()
                .map(|&s| s as f32)
                .collect();
            let zero_points = attrs
                .get("zero_points")
                .and_then(AttrValue::as_int_list)
                .map(|zp| zp.iter().map(|&z| z as i32).collect());
            Ok(Box::new(QuantizedLinear::new(
                name,
                in_features,
                out_features,
                bits,
                packed,
                scales,
                zero_points,
                symmetric,
            )?) as Box<dyn Node<T>>)
        });
        registry.register("FeedForward", |name, params, _attrs| {
            Ok(Box::new(FeedForward::new(
                name,
                take_param("FeedForward", params, "gate_weight")?,
                take_param("FeedForward", params, "gate_bias")?,
                take_param("FeedForward", params, "up_weight")?,
                take_param("FeedForward", params, "up_bias")?,
                take_param("FeedForward", params, "down_weight")?,
                take_param("FeedForward", params, "down_bias")?,
            )?) as Box<dyn Node<T>>)
        });
        registry.register("SimpleRnnCell", |name, params, _attrs| {
            Ok(Box::new(SimpleRnnCell::new(
                name,
                take_param("SimpleRnnCell", params, "weight_ih")?,
                take_param("SimpleRnnCell", params, "weight_hh")?,
                take_param("SimpleRnnCell", params, "bias")?,
            )?) as Box<dyn Node<T>>)
        });
        registry
    }

    /// Add a builder for an operation tag, replacing any previous one.
    pub fn register<F>(&mut self, op_type: impl Into<String>, builder: F)
    where
        F: Fn(&str, &mut ParamMap<T>, &AttrMap) -> Result<Box<dyn Node<T>>>
            + Send
            + Sync
            + 'static,
    {
        let op_type = op_type.into();
        log::debug!("registering node builder for '{op_type}'");
        self.builders.insert(op_type, Box::new(builder));
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.builders.contains_key(op_type)
    }

    pub fn op_types(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Reconstruct a node from its serialized description.
    pub fn build(
        &self,
        op_type: &str,
        name: &str,
        mut params: ParamMap<T>,
        attrs: &AttrMap,
    ) -> Result<Box<dyn Node<T>>> {
        let builder = self.builders.get(op_type).ok_or_else(|| {
            TensorError::invalid_argument(
                "NodeRegistry::build",
                format!("no builder registered for op type '{op_type}'"),
            )
        })?;
        builder(name, &mut params, attrs)
    }
}

impl<T: Arithmetic> Default for NodeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn take_param<T: Arithmetic>(
    op: &str,
    params: &mut ParamMap<T>,
    key: &str,
) -> Result<Tensor<T>> {
    params
        .remove(key)
        .ok_or_else(|| TensorError::invalid_argument(op, format!("missing parameter '{key}'")))
}

fn attr_int(op: &str, attrs: &AttrMap, key: &str) -> Result<i64> {
    attrs
        .get(key)
        .and_then(AttrValue::as_int)
        .ok_or_else(|| TensorError::invalid_argument(op, format!("missing int attribute '{key}'")))
}

fn attr_usize(op: &str, attrs: &AttrMap, key: &str) -> Result<usize> {
    let value = attr_int(op, attrs, key)?;
    usize::try_from(value).map_err(|_| {
        TensorError::invalid_argument(op, format!("attribute '{key}' must be non-negative"))
    })
}

fn attr_usize_list(op: &str, attrs: &AttrMap, key: &str) -> Result<Vec<usize>> {
    let list = attrs
        .get(key)
        .and_then(AttrValue::as_int_list)
        .ok_or_else(|| {
            TensorError::invalid_argument(op, format!("missing int-list attribute '{key}'"))
        })?;
    list.iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| {
                TensorError::invalid_argument(
                    op,
                    format!("attribute '{key}' must hold non-negative values"),
                )
            })
        })
        .collect()
}

fn attr_str<'a>(op: &str, attrs: &'a AttrMap, key: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .and_then(AttrValue::as_str)
        .ok_or_else(|| {
            TensorError::invalid_argument(op, format!("missing string attribute '{key}'"))
        })
}

fn attr_bool(op: &str, attrs: &AttrMap, key: &str) -> Result<bool> {
    attrs
        .get(key)
        .and_then(AttrValue::as_bool)
        .ok_or_else(|| {
            TensorError::invalid_argument(op, format!("missing bool attribute '{key}'"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BackwardMode;
    use quantaflow_core::Context;

    #[test]
    fn test_builtin_registry_knows_every_op() {
        let registry = NodeRegistry::<f32>::with_builtin_nodes();
        for op in [
            "Constant",
            "Add",
            "Mul",
            "Activation",
            "Reshape",
            "Concat",
            "Split",
            "Linear",
            "Bias",
            "Dense",
            "QuantizedLinear",
            "FeedForward",
            "SimpleRnnCell",
        ] {
            assert!(registry.contains(op), "missing builder for {op}");
        }
        assert!(!registry.contains("Conv2D"));
    }

    #[test]
    fn test_unknown_op_type_is_an_error() {
        let registry = NodeRegistry::<f32>::with_builtin_nodes();
        let err = registry
            .build("Nonsense", "n0", ParamMap::new(), &AttrMap::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Nonsense"));
    }

    #[test]
    fn test_dense_round_trips_through_registry() {
        let registry = NodeRegistry::<f32>::with_builtin_nodes();
        let original = Dense::<f32>::random("dense0", 3, 2, true, 5)
            .unwrap()
            .with_activation(ActivationKind::Relu);

        let mut params = ParamMap::new();
        params.insert("weight".to_string(), original.weight().value().clone());
        params.insert("bias".to_string(), original.bias().unwrap().value().clone());
        let attrs = original.attributes();

        let mut rebuilt = registry
            .build(original.op_type(), "dense0", params, &attrs)
            .unwrap();
        assert_eq!(rebuilt.op_type(), "Dense");
        assert_eq!(rebuilt.attributes(), attrs);

        let ctx = Context::new();
        let x = Tensor::from_vec(vec![0.5f32, -1.0, 2.0], &[1, 3]).unwrap();
        let out = rebuilt.forward(&ctx, &[&x]).unwrap();
        assert_eq!(out.shape().dims(), &[1, 2]);
    }

    #[test]
    fn test_quantized_linear_round_trips_through_attributes() {
        let registry = NodeRegistry::<f32>::with_builtin_nodes();
        let original = QuantizedLinear::<f32>::new(
            "q0",
            2,
            2,
            4,
            vec![0x12, 0x34],
            vec![0.1],
            None,
            true,
        )
        .unwrap();
        let attrs = original.attributes();

        let mut rebuilt = registry
            .build("QuantizedLinear", "q0", ParamMap::new(), &attrs)
            .unwrap();
        assert_eq!(rebuilt.attributes(), attrs);

        let ctx = Context::new();
        let x = Tensor::from_vec(vec![1.0f32, 0.0], &[1, 2]).unwrap();
        let out = rebuilt.forward(&ctx, &[&x]).unwrap();
        let expected = 0.1 * (2.0 - 128.0);
        assert!((out.get(&[0, 0]).unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn test_missing_parameter_is_descriptive() {
        let registry = NodeRegistry::<f32>::with_builtin_nodes();
        let err = registry
            .build("Linear", "lin0", ParamMap::new(), &AttrMap::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn test_custom_builder_registration() {
        let mut registry = NodeRegistry::<f32>::new();
        registry.register("Gain2", |name, _params, _attrs| {
            let two = Tensor::filled(2.0f32, &[1]);
            Ok(Box::new(Constant::new(name, two)?) as Box<dyn Node<f32>>)
        });
        let mut node = registry
            .build("Gain2", "g0", ParamMap::new(), &AttrMap::new())
            .unwrap();
        let ctx = Context::new();
        let out = node.forward(&ctx, &[]).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[2.0]);
        let grads = node
            .backward(&ctx, BackwardMode::FullBackprop, &out, &[])
            .unwrap();
        assert!(grads.is_empty());
    }

    #[test]
    fn test_rnn_cell_round_trips_through_registry() {
        let registry = NodeRegistry::<f64>::with_builtin_nodes();
        let original = SimpleRnnCell::<f64>::random("rnn0", 2, 3, 9).unwrap();

        let mut params = ParamMap::new();
        params.insert("weight_ih".to_string(), original.weight_ih().value().clone());
        params.insert("weight_hh".to_string(), original.weight_hh().value().clone());
        params.insert("bias".to_string(), original.bias().value().clone());

        let rebuilt = registry
            .build("SimpleRnnCell", "rnn0", params, &original.attributes())
            .unwrap();
        assert_eq!(rebuilt.input_arity(), 2);
        assert_eq!(
            rebuilt.output_shape(&[vec![4, 2], vec![4, 3]]).unwrap(),
            vec![4, 3]
        );
    }
}
