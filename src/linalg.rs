// linalg.rs
//
// Symmetric eigen-decomposition for the sample relationship matrix. Small
// matrices go straight to faer's self-adjoint solver; for large ones a
// randomized range finder narrows the problem to k + oversamples columns,
// orthonormalized with faer's QR, before the same solver runs on the
// projected matrix.

use faer::Mat as FaerMat;
use log::{debug, warn};
use ndarray::{s, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

fn to_faer(a: ArrayView2<'_, f64>) -> FaerMat<f64> {
    FaerMat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_faer(m: faer::MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m.read(i, j))
}

/// All eigenpairs of a symmetric matrix, eigenvalues in descending order and
/// eigenvectors as the matching columns.
pub fn symmetric_eigen(a: ArrayView2<'_, f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    let eig = to_faer(a).selfadjoint_eigendecomposition(faer::Side::Lower);
    let values = eig.s().column_vector();
    let vectors = eig.u();

    // faer returns ascending order
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| values.read(j).total_cmp(&values.read(i)));
    let eigenvalues = order.iter().map(|&i| values.read(i)).collect();
    let eigenvectors = Array2::from_shape_fn((n, n), |(i, j)| vectors.read(i, order[j]));
    (eigenvalues, eigenvectors)
}

/// Orthonormal basis for the column space of `q` (thin Householder QR).
fn orthonormal_basis(q: &Array2<f64>) -> Array2<f64> {
    let qr = to_faer(q.view()).qr();
    from_faer(qr.compute_thin_q().as_ref())
}

#[derive(Clone, Copy, Debug)]
pub struct SubspaceOptions {
    pub oversamples: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
}

/// Top-k eigenpairs of a symmetric positive semi-definite matrix.
pub fn top_eigenpairs(a: ArrayView2<'_, f64>, k: usize, opts: &SubspaceOptions) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let l = (k + opts.oversamples).min(n);
    if l >= n {
        let (values, vectors) = symmetric_eigen(a);
        return (values[..k].to_vec(), vectors.slice(s![.., ..k]).to_owned());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let omega = Array2::from_shape_fn((n, l), |_| rng.sample::<f64, _>(StandardNormal));
    let mut q = orthonormal_basis(&a.dot(&omega));

    let mut previous: Option<Vec<f64>> = None;
    let mut ritz = (Vec::new(), Array2::<f64>::zeros((l, l)));
    let mut converged = false;
    for iteration in 0..opts.max_iterations.max(1) {
        let aq = a.dot(&q);
        let b = q.t().dot(&aq);
        ritz = symmetric_eigen(b.view());

        let top = &ritz.0[..k];
        let lead = top.first().map_or(0.0, |x| x.abs()).max(f64::MIN_POSITIVE);
        if let Some(prev) = &previous {
            let change = top
                .iter()
                .zip(prev.iter())
                .map(|(x, y)| (x - y).abs())
                .fold(0.0, f64::max);
            if change <= opts.tolerance * lead {
                debug!("Subspace iteration converged after {} iterations", iteration);
                converged = true;
                break;
            }
        }
        previous = Some(top.to_vec());
        q = orthonormal_basis(&aq);
    }
    if !converged {
        warn!(
            "Subspace iteration stopped after {} iterations without reaching tolerance {:e}; \
             leading eigenpairs may be inexact.",
            opts.max_iterations.max(1),
            opts.tolerance
        );
    }

    let (values, w) = ritz;
    let vectors = q.dot(&w.slice(s![.., ..k]));
    (values[..k].to_vec(), vectors)
}

/// Flips each column so its largest-magnitude entry is positive.
pub fn normalize_signs(vectors: &mut Array2<f64>) {
    for mut column in vectors.columns_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            column.mapv_inplace(|x| -x);
        }
    }
}
