//! Maps between the tangent space at the origin and the Lorentz hyperboloid.
//!
//! Points live in the last tensor dimension as `(time, space...)` and satisfy
//! `time² - ‖space‖² = |k|`, with `time > 0`. The origin is `(√|k|, 0, ..., 0)`.
//! Tangent vectors at the origin carry a dummy zero time coordinate.
//!
//! The curvature `k` is a scalar tensor so gradients reach it; only `|k|` is
//! used. candle has no hyperbolic kernels, so `cosh`, `sinh` and `arccosh` are
//! composed from `exp`, `log` and `sqrt`.
//!
//! Norms are clamped away from zero and the `arccosh` argument is clamped to
//! `≥ 1 + ε`. These clamps are part of the maps' contract: they keep the
//! forward pass finite at the origin and under float underflow.

use candle_core::{Tensor, D};

use crate::error::{PeftError, Result};

/// Lower clamp of the spatial norm in [`expmap0`].
pub const EXPMAP_MIN_NORM: f64 = 1e-8;

/// Lower clamp of the spatial norm in [`logmap0`].
pub const LOGMAP_MIN_NORM: f64 = 1e-7;

/// Margin above 1 for the `arccosh` argument in [`logmap0`].
pub const ACOSH_EPS: f64 = 1e-7;

/// Upper clamp of the spatial norm in [`expmap0`]: `asinh(2^15)`.
#[must_use]
pub fn expmap_max_norm() -> f64 {
    32768f64.asinh()
}

/// Euclidean norm over the last dimension, keeping it, clamped to `[min, max]`.
///
/// The clamp acts on the squared norm so the gradient stays finite at zero.
pub(crate) fn clamped_norm(x: &Tensor, min: f64, max: f64) -> Result<Tensor> {
    let squared = x.sqr()?.sum_keepdim(D::Minus1)?;
    Ok(squared.clamp(min * min, max * max)?.sqrt()?)
}

fn cosh(x: &Tensor) -> Result<Tensor> {
    let sum = (x.exp()? + x.neg()?.exp()?)?;
    Ok((sum * 0.5)?)
}

/// Below this `|x|`, `sinh` switches to its Taylor series.
const SINH_SERIES_MAX: f64 = 0.1;

/// `(eˣ - e⁻ˣ) / 2`, or `x + x³/6 + x⁵/120` for small `|x|` where the
/// difference cancels in f32.
fn sinh(x: &Tensor) -> Result<Tensor> {
    let diff = ((x.exp()? - x.neg()?.exp()?)? * 0.5)?;
    let x2 = x.sqr()?;
    let series = (x * x2.affine(1.0 / 120.0, 1.0 / 6.0)?.mul(&x2)?.affine(1.0, 1.0)?)?;
    let small = x.abs()?.lt(SINH_SERIES_MAX)?;
    Ok(small.where_cond(&series, &diff)?)
}

/// `arccosh(z) = ln(z + √(z² - 1))` for `z ≥ 1`.
fn arccosh(z: &Tensor) -> Result<Tensor> {
    let radicand = z.sqr()?.affine(1.0, -1.0)?.maximum(0.0)?;
    Ok((z + radicand.sqrt()?)?.log()?)
}

/// `√|k|` as a scalar tensor in `like`'s dtype.
fn sqrt_curvature(k: &Tensor, like: &Tensor) -> Result<Tensor> {
    Ok(k.to_dtype(like.dtype())?.abs()?.sqrt()?)
}

fn manifold_dim(x: &Tensor) -> Result<usize> {
    let dim = x.dim(D::Minus1)?;
    if dim < 2 {
        return Err(PeftError::DimensionMismatch {
            message: format!("hyperboloid points need at least 2 coordinates, got {dim}"),
        });
    }
    Ok(dim)
}

/// Exponential map at the origin.
///
/// The first coordinate of `u` is ignored; with spatial part `x`,
/// `θ = clamp(‖x‖) / √|k|` and the result is
/// `(√|k| cosh θ, √|k| sinh θ · x / clamp(‖x‖))`.
///
/// # Errors
///
/// Returns an error if the last dimension has fewer than two coordinates.
pub fn expmap0(u: &Tensor, k: &Tensor) -> Result<Tensor> {
    let dim = manifold_dim(u)?;
    let x = u.narrow(D::Minus1, 1, dim - 1)?;
    let sqrt_k = sqrt_curvature(k, u)?;

    let x_norm = clamped_norm(&x, EXPMAP_MIN_NORM, expmap_max_norm())?;
    let theta = x_norm.broadcast_div(&sqrt_k)?;

    let time = cosh(&theta)?.broadcast_mul(&sqrt_k)?;
    let space = sinh(&theta)?
        .broadcast_mul(&sqrt_k)?
        .broadcast_mul(&x)?
        .broadcast_div(&x_norm)?;
    Ok(Tensor::cat(&[&time, &space], D::Minus1)?)
}

/// Logarithmic map at the origin, the inverse of [`expmap0`].
///
/// With spatial part `y`, `θ = arccosh(max(x₀ / √|k|, 1 + ε))` and the result is
/// `(0, √|k| θ · y / clamp(‖y‖))`.
///
/// # Errors
///
/// Returns an error if the last dimension has fewer than two coordinates.
pub fn logmap0(x: &Tensor, k: &Tensor) -> Result<Tensor> {
    let dim = manifold_dim(x)?;
    let time = x.narrow(D::Minus1, 0, 1)?;
    let y = x.narrow(D::Minus1, 1, dim - 1)?;
    let sqrt_k = sqrt_curvature(k, x)?;

    let y_norm = clamped_norm(&y, LOGMAP_MIN_NORM, f64::INFINITY)?;
    let cosh_theta = time.broadcast_div(&sqrt_k)?.maximum(1.0 + ACOSH_EPS)?;
    let theta = arccosh(&cosh_theta)?;

    let space = theta
        .broadcast_mul(&sqrt_k)?
        .broadcast_mul(&y)?
        .broadcast_div(&y_norm)?;
    Ok(Tensor::cat(&[&time.zeros_like()?, &space], D::Minus1)?)
}

/// Lift spatial coordinates onto the hyperboloid by solving for time:
/// `(√(‖space‖² + |k|), space)`.
///
/// # Errors
///
/// Returns an error if a tensor operation fails.
pub fn project_time(space: &Tensor, k: &Tensor) -> Result<Tensor> {
    let abs_k = k.to_dtype(space.dtype())?.abs()?;
    let time = space
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .broadcast_add(&abs_k)?
        .sqrt()?;
    Ok(Tensor::cat(&[&time, space], D::Minus1)?)
}

/// Prepend a zero time coordinate, turning a Euclidean vector into a tangent
/// vector at the origin.
///
/// # Errors
///
/// Returns an error if padding fails.
pub fn pad_time_axis(x: &Tensor) -> Result<Tensor> {
    Ok(x.pad_with_zeros(D::Minus1, 1, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use proptest::prelude::*;

    fn curvature(k: f64) -> Result<Tensor> {
        Ok(Tensor::new(k, &Device::Cpu)?)
    }

    /// `time² - ‖space‖²` for every row.
    fn lorentz_norm(x: &Tensor) -> Result<Vec<f64>> {
        let dim = x.dim(D::Minus1)?;
        let time = x.narrow(D::Minus1, 0, 1)?.sqr()?.squeeze(D::Minus1)?;
        let space = x.narrow(D::Minus1, 1, dim - 1)?.sqr()?.sum(D::Minus1)?;
        Ok((time - space)?.to_vec1::<f64>()?)
    }

    #[test]
    fn test_expmap0_lands_on_hyperboloid() -> Result<()> {
        let u = Tensor::new(&[[0f64, 0.3, -1.2, 0.5], [0., 2.0, 0.1, 0.0]], &Device::Cpu)?;
        for k in [-1.0, -2.0, 0.5] {
            let x = expmap0(&u, &curvature(k)?)?;
            assert_eq!(x.dims(), &[2, 4]);
            for value in lorentz_norm(&x)? {
                assert_abs_diff_eq!(value, f64::abs(k), epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_expmap0_ignores_time_coordinate() -> Result<()> {
        let k = curvature(-1.0)?;
        let a = expmap0(&Tensor::new(&[[0f64, 1.0, 2.0]], &Device::Cpu)?, &k)?;
        let b = expmap0(&Tensor::new(&[[7f64, 1.0, 2.0]], &Device::Cpu)?, &k)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_roundtrip_recovers_tangent_vector() -> Result<()> {
        let u = Tensor::new(&[[0f64, 0.3, -1.2, 0.5], [0., 2.0, 0.1, 0.0]], &Device::Cpu)?;
        let expected = u.narrow(D::Minus1, 1, 3)?.to_vec2::<f64>()?;
        for k in [-1.0, -2.0, -0.25] {
            let k = curvature(k)?;
            let back = logmap0(&expmap0(&u, &k)?, &k)?;
            assert_eq!(back.narrow(D::Minus1, 0, 1)?.sum_all()?.to_scalar::<f64>()?, 0.0);
            let got = back.narrow(D::Minus1, 1, 3)?.to_vec2::<f64>()?;
            for (row, want) in got.iter().zip(&expected) {
                for (g, w) in row.iter().zip(want) {
                    assert_abs_diff_eq!(*g, *w, epsilon = 1e-8);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_roundtrip_f32() -> Result<()> {
        let u = Tensor::new(&[[0f32, 0.4, -0.8, 1.1]], &Device::Cpu)?;
        let k = Tensor::new(-1f32, &Device::Cpu)?;
        let back = logmap0(&expmap0(&u, &k)?, &k)?;
        let got = back.narrow(D::Minus1, 1, 3)?.to_vec2::<f32>()?;
        for (g, w) in got[0].iter().zip([0.4f32, -0.8, 1.1]) {
            assert_abs_diff_eq!(*g, w, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_sinh_f32_precision() -> Result<()> {
        let values = [1e-5f32, 1e-3, 0.05, 0.0999, -0.01, 0.5, 1.0];
        let out = sinh(&Tensor::new(&values, &Device::Cpu)?)?.to_vec1::<f32>()?;
        for (v, s) in values.iter().zip(out) {
            let expected = f64::from(*v).sinh();
            assert!((f64::from(s) - expected).abs() <= 2e-6 * expected.abs(), "sinh({v}) = {s}");
        }
        Ok(())
    }

    #[test]
    fn test_expmap0_small_norm_f32() -> Result<()> {
        let u = [0f32, 1e-4, -2e-4, 5e-5];
        let x = expmap0(&Tensor::new(&[u], &Device::Cpu)?, &curvature(-1.0)?)?;
        let space = x.narrow(D::Minus1, 1, 3)?.to_vec2::<f32>()?;

        let norm = u[1..].iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
        for (v, s) in u[1..].iter().zip(&space[0]) {
            let expected = f64::from(*v) * norm.sinh() / norm;
            assert!((f64::from(*s) - expected).abs() <= 2e-6 * expected.abs(), "{s} vs {expected}");
        }
        Ok(())
    }

    #[test]
    fn test_origin_stays_finite() -> Result<()> {
        let k = curvature(-1.0)?;
        let zero = Tensor::zeros((1, 5), DType::F64, &Device::Cpu)?;

        let x = expmap0(&zero, &k)?;
        let values = x.to_vec2::<f64>()?;
        assert!(values[0].iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(values[0][0], 1.0, epsilon = 1e-12);

        let back = logmap0(&x, &k)?.to_vec2::<f64>()?;
        assert!(back[0].iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn test_logmap0_clamps_below_origin() -> Result<()> {
        // time below √|k| is off the manifold; the clamp keeps arccosh defined
        let x = Tensor::new(&[[0.5f64, 0.1, 0.0]], &Device::Cpu)?;
        let back = logmap0(&x, &curvature(-1.0)?)?.to_vec2::<f64>()?;
        assert!(back[0].iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_project_time_satisfies_constraint() -> Result<()> {
        let space = Tensor::new(&[[1f64, -2.0], [0.0, 0.0]], &Device::Cpu)?;
        let x = project_time(&space, &curvature(-3.0)?)?;
        assert_eq!(x.dims(), &[2, 3]);
        for value in lorentz_norm(&x)? {
            assert_abs_diff_eq!(value, 3.0, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_pad_time_axis() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2.0]], &Device::Cpu)?;
        assert_eq!(pad_time_axis(&x)?.to_vec2::<f32>()?, vec![vec![0.0, 1.0, 2.0]]);
        Ok(())
    }

    #[test]
    fn test_too_few_coordinates() -> Result<()> {
        let x = Tensor::zeros((2, 1), DType::F64, &Device::Cpu)?;
        assert!(matches!(
            expmap0(&x, &curvature(-1.0)?),
            Err(PeftError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            spatial in proptest::collection::vec(-2.0f64..2.0, 1..8),
            k in -3.0f64..-0.2,
        ) {
            let norm = spatial.iter().map(|v| v * v).sum::<f64>().sqrt();
            prop_assume!(norm > 1e-2);

            let mut coords = vec![0.0];
            coords.extend_from_slice(&spatial);
            let u = Tensor::new(coords.as_slice(), &Device::Cpu).unwrap();
            let k = Tensor::new(k, &Device::Cpu).unwrap();

            let back = logmap0(&expmap0(&u, &k).unwrap(), &k).unwrap().to_vec1::<f64>().unwrap();
            prop_assert_eq!(back[0], 0.0);
            for (g, w) in back[1..].iter().zip(&spatial) {
                prop_assert!((g - w).abs() < 1e-6, "got {g}, want {w}");
            }
        }
    }
}
