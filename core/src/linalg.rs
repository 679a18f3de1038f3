//! Covariance factorizations shared by the estimators.
//!
//! Filter covariances are accumulated from weighted sums and repeated rank updates, so they are
//! routinely a few ulps away from symmetric, and can lose definiteness when a state collapses.
//! Every routine here symmetrizes first and regularizes the diagonal before giving up.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, Dyn};

/// First diagonal load tried when a plain Cholesky factorization fails.
const FIRST_LOAD: f64 = 1e-12;
/// Largest diagonal load applied before falling back.
const LAST_LOAD: f64 = 1e-6;

/// Average a matrix with its transpose.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Factor a symmetric matrix, loading the diagonal by powers of ten from [`FIRST_LOAD`] to
/// [`LAST_LOAD`] until the factorization succeeds.
fn regularized_cholesky(sym: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if let Some(factor) = Cholesky::new(sym.clone()) {
        return Some(factor);
    }
    let mut load = FIRST_LOAD;
    while load <= LAST_LOAD {
        let loaded = sym + DMatrix::<f64>::identity(sym.nrows(), sym.ncols()) * load;
        if let Some(factor) = Cholesky::new(loaded) {
            return Some(factor);
        }
        load *= 10.0;
    }
    None
}

/// Square root of a positive semi-definite spectrum: `U sqrt(max(λ, 0)) Uᵀ`.
fn spectral_root(sym: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(sym.clone());
    let roots = eigen.eigenvalues.map(|lambda| lambda.max(0.0).sqrt());
    &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose()
}

/// A factor `S` with `S Sᵀ ≈ covariance`.
///
/// The lower Cholesky factor is returned whenever the (possibly diagonally loaded) matrix is
/// positive definite. Otherwise the symmetric spectral root is returned with negative
/// eigenvalues clamped to zero, so a collapsed covariance yields a zero factor rather than NaN.
///
/// # Panics
/// If `covariance` is not square.
pub fn matrix_square_root(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        covariance.is_square(),
        "covariance factor requested for a {}x{} matrix",
        covariance.nrows(),
        covariance.ncols()
    );
    let sym = symmetrize(covariance);
    match regularized_cholesky(&sym) {
        Some(factor) => factor.l(),
        None => spectral_root(&sym),
    }
}

/// Solve `S X = B` for a symmetric innovation covariance `S`.
///
/// Uses a regularized Cholesky solve and falls back to an explicit inverse. `None` means `S` is
/// singular, which callers treat as a rejected update.
pub fn robust_spd_solve(s: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if s.nrows() != b.nrows() || !s.is_square() {
        return None;
    }
    let sym = symmetrize(s);
    if sym.is_empty() || sym.diagonal().max() <= 0.0 {
        return None;
    }
    match regularized_cholesky(&sym) {
        Some(factor) => Some(factor.solve(b)),
        None => sym.try_inverse().map(|inverse| inverse * b),
    }
}
