//! Ridge regression for layer mixing weights
//!
//! Solves `w = (XᵗX + αI)⁻¹ Xᵗy` on the small `k x k` normal-equation system
//! through a symmetric eigendecomposition, `w = V diag(1/λ) Vᵗ Xᵗy`. Directions
//! whose eigenvalue is numerically zero (e.g. `α = 0` with collinear layers)
//! are dropped, which gives the minimum-norm least-squares solution on a
//! singular system and the exact solve otherwise.

use anyhow::{Context, Result};
use linfa_linalg::eigh::Eigh;
use ndarray::{Array1, Array2};
use tracing::debug;

/// Eigenvalues below this fraction of the largest count as zero
const SINGULAR_RTOL: f64 = 1e-10;

/// Solve ridge regression for `x: [n, k]`, `y: [n]`
pub fn ridge_solve(x: &Array2<f64>, y: &Array1<f64>, alpha: f64) -> Result<Array1<f64>> {
    let (n, k) = x.dim();
    anyhow::ensure!(n > 0 && k > 0, "Empty feature matrix ({n} x {k})");
    anyhow::ensure!(
        y.len() == n,
        "Feature matrix has {n} rows but target has {}",
        y.len()
    );

    let xt = x.t();
    let mut a = xt.dot(x);
    for i in 0..k {
        a[[i, i]] += alpha;
    }
    let b = xt.dot(y);

    let (eigenvalues, eigenvectors) = a.eigh().context("Ridge eigendecomposition failed")?;
    anyhow::ensure!(
        eigenvalues.iter().all(|v| v.is_finite()),
        "Ridge system has non-finite eigenvalues"
    );

    let max_abs = eigenvalues.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let cutoff = max_abs * SINGULAR_RTOL;

    let mut projected = eigenvectors.t().dot(&b);
    let mut dropped = 0usize;
    for (p, &lambda) in projected.iter_mut().zip(eigenvalues.iter()) {
        if lambda.abs() > cutoff {
            *p /= lambda;
        } else {
            *p = 0.0;
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!("Ridge system singular ({dropped} of {k} directions), using minimum-norm solution");
    }
    Ok(eigenvectors.dot(&projected))
}
