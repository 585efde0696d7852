//! Numeric kernels
//!
//! Element-wise maps over f32 slices plus the fused layer norm and the
//! row-parallel matrix-vector product. Destination and source lengths are
//! fixed by the graph builder; the kernels assume them equal.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Epsilon inside the layer-norm square root
const LAYER_NORM_EPS: f32 = 1e-5;

pub(crate) fn exp(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.exp();
    }
}

pub(crate) fn sigmoid(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = 1.0 / (1.0 + (-s).exp());
    }
}

pub(crate) fn one_minus(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = 1.0 - s;
    }
}

pub(crate) fn relu(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.max(0.0);
    }
}

pub(crate) fn square(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s * s;
    }
}

pub(crate) fn add(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x + y;
    }
}

pub(crate) fn sub(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x - y;
    }
}

pub(crate) fn mul(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x * y;
    }
}

pub(crate) fn div(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x / y;
    }
}

pub(crate) fn max(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x.max(y);
    }
}

/// Fused `layer_norm(x) * weight + bias` with population variance.
pub(crate) fn layer_norm(dst: &mut [f32], src: &[f32], weight: &[f32], bias: &[f32]) {
    let n = src.len() as f32;
    let mean = src.iter().sum::<f32>() / n;
    let var = src.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv_std = 1.0 / (var + LAYER_NORM_EPS).sqrt();

    for (((d, &s), &w), &b) in dst.iter_mut().zip(src).zip(weight).zip(bias) {
        *d = (s - mean) * inv_std * w + b;
    }
}

/// `dst[r] = dot(row r of weight, x)`, parallel over rows.
pub(crate) fn matvec(weight: &Tensor, x: &[f32], dst: &mut [f32]) {
    dst.par_iter_mut().enumerate().for_each(|(row, out)| {
        *out = weight.row_dot(row, x);
    });
}
