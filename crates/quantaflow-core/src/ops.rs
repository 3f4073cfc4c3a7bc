//! Bulk tensor operations consumed by the node layer.
//!
//! Every operation takes the execution [`Context`] first and fails only on
//! shape or argument mismatch (or cancellation), never by miscomputing
//! silently. All numeric work goes through the [`Arithmetic`] contract of the
//! element type.

use crate::arith::Arithmetic;
use crate::{Context, Result, Tensor, TensorError};
use ndarray::{Axis, Ix2, Zip};

fn binary_elementwise<T: Arithmetic>(
    operation: &str,
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(T, T) -> T,
) -> Result<Tensor<T>> {
    if a.shape() != b.shape() {
        return Err(TensorError::shape_mismatch(
            operation,
            a.shape().to_string(),
            b.shape().to_string(),
        ));
    }
    let out = Zip::from(a.array())
        .and(b.array())
        .map_collect(|&x, &y| f(x, y));
    Ok(Tensor::from_array(out))
}

/// Elementwise addition. Also accepts a rank-1 right operand matching the
/// left operand's trailing dimension (the bias pattern).
pub fn add<T: Arithmetic>(ctx: &Context, a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    ctx.check_cancelled("add")?;
    if a.shape() == b.shape() {
        return binary_elementwise("add", a, b, T::add);
    }
    if b.rank() == 1 && a.rank() >= 1 && b.shape()[0] == a.shape()[a.rank() - 1] {
        let mut out = a.array().clone();
        for mut lane in out.lanes_mut(Axis(a.rank() - 1)) {
            for (x, y) in lane.iter_mut().zip(b.iter()) {
                *x = (*x).add(*y);
            }
        }
        return Ok(Tensor::from_array(out));
    }
    Err(TensorError::shape_mismatch(
        "add",
        a.shape().to_string(),
        b.shape().to_string(),
    ))
}

/// Elementwise subtraction of same-shape tensors.
pub fn sub<T: Arithmetic>(ctx: &Context, a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    ctx.check_cancelled("sub")?;
    binary_elementwise("sub", a, b, T::sub)
}

/// Elementwise (Hadamard) product of same-shape tensors.
pub fn mul<T: Arithmetic>(ctx: &Context, a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    ctx.check_cancelled("mul")?;
    binary_elementwise("mul", a, b, T::mul)
}

/// 2-D matrix product with inner-dimension check.
pub fn matmul<T: Arithmetic>(ctx: &Context, a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    ctx.check_cancelled("matmul")?;
    if a.rank() != 2 || b.rank() != 2 {
        return Err(TensorError::invalid_argument(
            "matmul",
            format!("expected rank-2 operands, got rank {} and {}", a.rank(), b.rank()),
        ));
    }
    let (m, k) = (a.shape()[0], a.shape()[1]);
    let (k2, n) = (b.shape()[0], b.shape()[1]);
    if k != k2 {
        return Err(TensorError::shape_mismatch(
            "matmul",
            "inner dimensions to agree".to_string(),
            format!("{m}x{k} times {k2}x{n}"),
        ));
    }
    let av = a
        .array()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| TensorError::invalid_argument("matmul", e.to_string()))?;
    let bv = b
        .array()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| TensorError::invalid_argument("matmul", e.to_string()))?;
    let mut out = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            out.push(T::sum((0..k).map(|p| av[[i, p]].mul(bv[[p, j]]))));
        }
    }
    Tensor::from_vec(out, &[m, n])
}

/// 2-D transpose.
pub fn transpose<T: Arithmetic>(ctx: &Context, t: &Tensor<T>) -> Result<Tensor<T>> {
    ctx.check_cancelled("transpose")?;
    if t.rank() != 2 {
        return Err(TensorError::invalid_argument(
            "transpose",
            format!("expected a rank-2 tensor, got rank {}", t.rank()),
        ));
    }
    let v = t.array().view().reversed_axes();
    Ok(Tensor::from_array(v.as_standard_layout().into_owned()))
}

/// Element-count-preserving reshape.
pub fn reshape<T: Arithmetic>(ctx: &Context, t: &Tensor<T>, dims: &[usize]) -> Result<Tensor<T>> {
    ctx.check_cancelled("reshape")?;
    let expected: usize = dims.iter().product();
    if t.len() != expected {
        return Err(TensorError::shape_mismatch(
            "reshape",
            format!("{} elements for shape {:?}", t.len(), dims),
            format!("{expected} elements"),
        ));
    }
    let data: Vec<T> = t.iter().copied().collect();
    Tensor::from_vec(data, dims)
}

/// Concatenate along an axis. All parts must share rank and every non-axis
/// dimension.
pub fn concat<T: Arithmetic>(
    ctx: &Context,
    parts: &[&Tensor<T>],
    axis: usize,
) -> Result<Tensor<T>> {
    ctx.check_cancelled("concat")?;
    let first = parts
        .first()
        .ok_or_else(|| TensorError::invalid_argument("concat", "empty tensor list"))?;
    let rank = first.rank();
    if axis >= rank {
        return Err(TensorError::invalid_axis("concat", axis, rank));
    }
    for (i, part) in parts.iter().enumerate().skip(1) {
        if part.rank() != rank {
            return Err(TensorError::shape_mismatch(
                "concat",
                format!("rank {rank}"),
                format!("rank {} at input {i}", part.rank()),
            ));
        }
        for d in 0..rank {
            if d != axis && part.shape()[d] != first.shape()[d] {
                return Err(TensorError::shape_mismatch(
                    "concat",
                    format!("dimension {d} = {}", first.shape()[d]),
                    format!("{} at input {i}", part.shape()[d]),
                ));
            }
        }
    }
    let views: Vec<_> = parts.iter().map(|p| p.array().view()).collect();
    let arr = ndarray::concatenate(Axis(axis), &views)
        .map_err(|e| TensorError::invalid_argument("concat", e.to_string()))?;
    Ok(Tensor::from_array(arr.as_standard_layout().into_owned()))
}

/// Split along an axis into `parts` equal pieces.
pub fn split<T: Arithmetic>(
    ctx: &Context,
    t: &Tensor<T>,
    axis: usize,
    parts: usize,
) -> Result<Vec<Tensor<T>>> {
    ctx.check_cancelled("split")?;
    if axis >= t.rank() {
        return Err(TensorError::invalid_axis("split", axis, t.rank()));
    }
    if parts == 0 {
        return Err(TensorError::invalid_argument(
            "split",
            "part count must be at least 1",
        ));
    }
    let dim = t.shape()[axis];
    if dim == 0 || dim % parts != 0 {
        return Err(TensorError::invalid_argument(
            "split",
            format!("cannot split axis of length {dim} into {parts} equal parts"),
        ));
    }
    Ok(t.array()
        .axis_chunks_iter(Axis(axis), dim / parts)
        .map(|chunk| Tensor::from_array(chunk.as_standard_layout().into_owned()))
        .collect())
}

/// Sum-reduce along an axis, optionally keeping the reduced dimension.
pub fn sum_axis<T: Arithmetic>(
    ctx: &Context,
    t: &Tensor<T>,
    axis: usize,
    keep_dim: bool,
) -> Result<Tensor<T>> {
    ctx.check_cancelled("sum_axis")?;
    if axis >= t.rank() {
        return Err(TensorError::invalid_axis("sum_axis", axis, t.rank()));
    }
    let reduced = t
        .array()
        .map_axis(Axis(axis), |lane| T::sum(lane.iter().copied()));
    let arr = if keep_dim {
        reduced.insert_axis(Axis(axis))
    } else {
        reduced
    };
    Ok(Tensor::from_array(arr))
}

/// Apply an arbitrary unary function elementwise.
pub fn map<T: Arithmetic>(
    ctx: &Context,
    t: &Tensor<T>,
    f: impl Fn(T) -> T,
) -> Result<Tensor<T>> {
    ctx.check_cancelled("map")?;
    Ok(Tensor::from_array(t.array().mapv(f)))
}
