// pca.rs
//
// HWE-normalized PCA over a (pruned) genotype matrix, and projection of new
// samples onto the resulting components.

use std::collections::HashMap;

use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::linalg::{normalize_signs, top_eigenpairs, SubspaceOptions};
use crate::matrix::{GenotypeMatrix, GenotypeOps};
use crate::types::{Assembly, Variant, MISSING};
use crate::variant_qc::VariantQc;

/// Variance below which a variant is treated as monomorphic.
const MIN_HWE_VARIANCE: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaConfig {
    /// Number of principal components.
    pub k: usize,
    pub oversamples: usize,
    pub max_iterations: usize,
    /// Relative change in the leading Ritz values at which iteration stops.
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            k: 20,
            oversamples: 10,
            max_iterations: 300,
            tolerance: 1e-12,
            seed: 1,
        }
    }
}

/// Output of `hwe_normalized_pca`. `scores` is samples x k and `loadings`
/// is variants x k, both in the row order of `samples` and `variants`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaResult {
    pub assembly: Assembly,
    pub eigenvalues: Vec<f64>,
    pub samples: Vec<String>,
    pub scores: Array2<f64>,
    pub variants: Vec<Variant>,
    pub loadings: Array2<f64>,
    /// Mean alternate allele frequency over called genotypes.
    pub pca_af: Vec<f64>,
}

impl PcaResult {
    pub fn k(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn score(&self, sample: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.samples.iter().position(|s| s == sample)?;
        Some(self.scores.row(idx))
    }

    pub fn loading(&self, variant: &Variant) -> Option<ArrayView1<'_, f64>> {
        let idx = self.variants.iter().position(|v| v == variant)?;
        Some(self.loadings.row(idx))
    }

    /// Checks the shape relations between the fields.
    pub fn validate(&self) -> Result<()> {
        let k = self.k();
        if self.scores.dim() != (self.samples.len(), k) {
            return Err(PipelineError::ShapeMismatch(format!(
                "scores are {:?}, expected ({}, {})",
                self.scores.dim(),
                self.samples.len(),
                k
            )));
        }
        if self.loadings.dim() != (self.variants.len(), k) {
            return Err(PipelineError::ShapeMismatch(format!(
                "loadings are {:?}, expected ({}, {})",
                self.loadings.dim(),
                self.variants.len(),
                k
            )));
        }
        if self.pca_af.len() != self.variants.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} pca_af values for {} variants",
                self.pca_af.len(),
                self.variants.len()
            )));
        }
        Ok(())
    }
}

/// Per-variant denominator `sqrt(m * 2p(1-p))`.
fn hwe_scale(af: f64, n_variants: usize) -> f64 {
    (n_variants as f64 * 2.0 * af * (1.0 - af)).sqrt()
}

fn normalized_call(g: i8, af: f64, scale: f64) -> f64 {
    if g == MISSING {
        0.0
    } else {
        (g as f64 - 2.0 * af) / scale
    }
}

fn normalized_row(calls: ArrayView1<'_, i8>, af: f64, scale: f64) -> Array1<f64> {
    calls.mapv(|g| normalized_call(g, af, scale))
}

/// The m x n HWE-normalized matrix, filled row by row in place.
fn hwe_normalized_matrix(matrix: &GenotypeMatrix, pca_af: &[f64]) -> Array2<f64> {
    let m = matrix.n_variants();
    let mut normalized = Array2::<f64>::zeros((m, matrix.n_samples()));
    normalized
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let (af, scale) = (pca_af[i], hwe_scale(pca_af[i], m));
            row.zip_mut_with(&matrix.row(i), |x, &g| *x = normalized_call(g, af, scale));
        });
    normalized
}

pub fn hwe_normalized_pca(matrix: &GenotypeMatrix, config: &PcaConfig) -> Result<PcaResult> {
    matrix.ensure_non_empty("pca")?;
    let (m, n, k) = (matrix.n_variants(), matrix.n_samples(), config.k);
    if k == 0 {
        return Err(PipelineError::DegenerateInput("k must be at least 1".to_string()));
    }
    if n < k {
        return Err(PipelineError::DegenerateInput(format!(
            "{} samples is fewer than k = {}",
            n, k
        )));
    }
    if m < k {
        return Err(PipelineError::DegenerateInput(format!(
            "{} variants is fewer than k = {}",
            m, k
        )));
    }

    let frequencies: Vec<Option<f64>> = matrix.aggregate_rows(|_, calls| VariantQc::from_calls(calls).af);
    let mut pca_af = Vec::with_capacity(m);
    for (record, af) in matrix.variants().iter().zip(&frequencies) {
        match af {
            Some(p) if 2.0 * p * (1.0 - p) > MIN_HWE_VARIANCE => pca_af.push(*p),
            _ => {
                return Err(PipelineError::DegenerateInput(format!(
                    "variant {} has zero variance under HWE (af = {:?})",
                    record.variant, af
                )))
            }
        }
    }

    info!("PCA: normalizing {} variants x {} samples, k = {}", m, n, k);
    let normalized = hwe_normalized_matrix(matrix, &pca_af);

    let relationship = normalized.t().dot(&normalized);
    let opts = SubspaceOptions {
        oversamples: config.oversamples,
        max_iterations: config.max_iterations,
        tolerance: config.tolerance,
        seed: config.seed,
    };
    let (raw_values, mut vectors) = top_eigenpairs(relationship.view(), k, &opts);
    normalize_signs(&mut vectors);

    let eigenvalues: Vec<f64> = raw_values.iter().map(|&l| l.max(0.0)).collect();
    let lead = eigenvalues.first().copied().unwrap_or(0.0);
    let roots: Vec<f64> = eigenvalues.iter().map(|l| l.sqrt()).collect();

    let mut scores = vectors.clone();
    for (mut column, &root) in scores.axis_iter_mut(Axis(1)).zip(&roots) {
        column.mapv_inplace(|x| x * root);
    }

    let mut loadings = normalized.dot(&vectors);
    for (pc, (mut column, &root)) in loadings.axis_iter_mut(Axis(1)).zip(&roots).enumerate() {
        if eigenvalues[pc] <= MIN_HWE_VARIANCE * lead.max(1.0) {
            warn!(
                "PC{} has eigenvalue {:e}; its loadings are set to zero.",
                pc + 1,
                eigenvalues[pc]
            );
            column.fill(0.0);
        } else {
            column.mapv_inplace(|x| x / root);
        }
    }

    info!(
        "PCA: leading eigenvalues {:?}",
        &eigenvalues[..eigenvalues.len().min(5)]
    );

    Ok(PcaResult {
        assembly: matrix.assembly(),
        eigenvalues,
        samples: matrix.sample_ids(),
        scores,
        variants: matrix.variants().iter().map(|r| r.variant.clone()).collect(),
        loadings,
        pca_af,
    })
}

/// Scores of new samples on the components of `result`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedScores {
    pub samples: Vec<String>,
    pub scores: Array2<f64>,
    /// Reference variants found in the projected matrix.
    pub n_overlapping: usize,
}

/// Projects the samples of `matrix` onto the reference PCs. Reference
/// variants missing from `matrix`, and missing calls, contribute zero.
pub fn project_samples(result: &PcaResult, matrix: &GenotypeMatrix) -> Result<ProjectedScores> {
    result.validate()?;
    if matrix.assembly() != result.assembly {
        return Err(PipelineError::ShapeMismatch(format!(
            "cannot project a {} matrix onto {} components",
            matrix.assembly(),
            result.assembly
        )));
    }

    let rows: HashMap<&Variant, usize> = matrix
        .variants()
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.variant, i))
        .collect();

    let m = result.variants.len();
    let mut scores = Array2::<f64>::zeros((matrix.n_samples(), result.k()));
    let mut n_overlapping = 0usize;
    for (i, variant) in result.variants.iter().enumerate() {
        let Some(&row) = rows.get(variant) else {
            continue;
        };
        n_overlapping += 1;
        let af = result.pca_af[i];
        let normalized = normalized_row(matrix.row(row), af, hwe_scale(af, m));
        let loading = result.loadings.row(i);
        for (j, &x) in normalized.iter().enumerate() {
            if x != 0.0 {
                scores.row_mut(j).scaled_add(x, &loading);
            }
        }
    }

    if n_overlapping < m {
        warn!(
            "Projection: {} of {} reference variants are absent from the input and contribute zero.",
            m - n_overlapping,
            m
        );
    }
    Ok(ProjectedScores {
        samples: matrix.sample_ids(),
        scores,
        n_overlapping,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::linalg::symmetric_eigen;
    use crate::matrix::tests::variant;
    use crate::types::SampleRecord;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Three populations of `per_pop` samples; `freq(pop, variant)` gives the
    /// alternate allele frequency.
    fn simulate<F>(per_pop: usize, n_variants: usize, seed: u64, freq: F) -> GenotypeMatrix
    where
        F: Fn(usize, usize) -> f64,
    {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = 3 * per_pop;
        let mut calls = Array2::<i8>::zeros((n_variants, n));
        for i in 0..n_variants {
            for j in 0..n {
                let p = freq(j / per_pop, i);
                let g = (rng.random::<f64>() < p) as i8 + (rng.random::<f64>() < p) as i8;
                calls[[i, j]] = g;
            }
            // Keep every row polymorphic.
            calls[[i, 0]] = 1;
        }
        let variants = (0..n_variants)
            .map(|i| variant("chr1", 1000 + 10 * i as u64, "A", "G"))
            .collect();
        let samples = (0..n).map(|j| SampleRecord::new(format!("S{}", j))).collect();
        GenotypeMatrix::new(Assembly::GRCh38, variants, samples, calls).unwrap()
    }

    /// Three equally diverged populations.
    pub(crate) fn structured_matrix(per_pop: usize, n_variants: usize, seed: u64) -> GenotypeMatrix {
        let freqs = [0.15, 0.5, 0.85];
        simulate(per_pop, n_variants, seed, |pop, i| freqs[(pop + i) % 3])
    }

    /// Populations along a cline: the middle one sits between the outer two.
    fn cline_matrix(per_pop: usize, n_variants: usize, seed: u64) -> GenotypeMatrix {
        let freqs = [0.1, 0.5, 0.9];
        simulate(per_pop, n_variants, seed, |pop, i| {
            if i % 2 == 0 {
                freqs[pop]
            } else {
                freqs[2 - pop]
            }
        })
    }

    fn exact(k: usize) -> PcaConfig {
        PcaConfig {
            k,
            oversamples: 1000,
            ..PcaConfig::default()
        }
    }

    fn config(k: usize) -> PcaConfig {
        PcaConfig {
            k,
            ..PcaConfig::default()
        }
    }

    #[test]
    fn result_shapes_and_ordering() {
        let matrix = structured_matrix(6, 40, 3);
        let result = hwe_normalized_pca(&matrix, &config(4)).unwrap();
        result.validate().unwrap();
        assert_eq!(result.eigenvalues.len(), 4);
        assert_eq!(result.scores.dim(), (18, 4));
        assert_eq!(result.loadings.dim(), (40, 4));
        assert!(result.eigenvalues.windows(2).all(|w| w[0] >= w[1]));
        assert!(result.eigenvalues.iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn scores_carry_the_eigenvalues() {
        let matrix = structured_matrix(5, 30, 11);
        let result = hwe_normalized_pca(&matrix, &config(3)).unwrap();
        for (pc, &lambda) in result.eigenvalues.iter().enumerate() {
            let column = result.scores.column(pc);
            assert_abs_diff_eq!(column.dot(&column), lambda, epsilon = 1e-9 * lambda.max(1.0));
        }
    }

    #[test]
    fn eigenvalues_match_dense_decomposition() {
        let matrix = structured_matrix(15, 60, 5);
        // 45 samples with k + oversamples = 8 takes the iterative path.
        let cfg = PcaConfig {
            k: 2,
            oversamples: 6,
            max_iterations: 2000,
            tolerance: 1e-15,
            seed: 9,
        };
        let result = hwe_normalized_pca(&matrix, &cfg).unwrap();

        let normalized = hwe_normalized_matrix(&matrix, &result.pca_af);
        let (exact, _) = symmetric_eigen(normalized.t().dot(&normalized).view());
        for pc in 0..2 {
            assert_abs_diff_eq!(result.eigenvalues[pc], exact[pc], epsilon = 1e-6 * exact[0]);
        }
    }

    #[test]
    fn leading_component_separates_populations() {
        let matrix = cline_matrix(10, 120, 21);
        let result = hwe_normalized_pca(&matrix, &exact(2)).unwrap();
        let pc = |j: usize| result.scores[[j, 0]].signum();
        // Sign is arbitrary; populations 0 and 2 are the extremes.
        let first = (0..10).map(pc).sum::<f64>();
        let last = (20..30).map(pc).sum::<f64>();
        assert_eq!(first.abs(), 10.0);
        assert_eq!(last, -first);
    }

    #[test]
    fn pca_af_is_mean_alt_frequency() {
        let matrix = GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G"), variant("chr1", 2, "C", "T")],
            (0..3).map(|j| SampleRecord::new(format!("s{}", j))).collect(),
            ndarray::array![[0, 1, 2], [1, MISSING, 0]],
        )
        .unwrap();
        let result = hwe_normalized_pca(&matrix, &config(1)).unwrap();
        assert_abs_diff_eq!(result.pca_af[0], 0.5);
        assert_abs_diff_eq!(result.pca_af[1], 0.25);
    }

    #[test]
    fn normalized_matrix_entries() {
        let matrix = GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G"), variant("chr1", 2, "C", "T")],
            (0..3).map(|j| SampleRecord::new(format!("s{}", j))).collect(),
            ndarray::array![[0, 1, 2], [1, MISSING, 0]],
        )
        .unwrap();
        let pca_af = [0.5, 0.25];
        let normalized = hwe_normalized_matrix(&matrix, &pca_af);
        assert_eq!(normalized.dim(), (2, 3));

        // m = 2: row scales are sqrt(2 * 2p(1-p)), i.e. 1 and sqrt(0.75).
        let s0 = 1.0f64.sqrt();
        let s1 = 0.75f64.sqrt();
        assert_abs_diff_eq!(normalized[[0, 0]], -1.0 / s0, epsilon = 1e-15);
        assert_abs_diff_eq!(normalized[[0, 1]], 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(normalized[[0, 2]], 1.0 / s0, epsilon = 1e-15);
        assert_abs_diff_eq!(normalized[[1, 0]], 0.5 / s1, epsilon = 1e-15);
        assert_eq!(normalized[[1, 1]], 0.0);
        assert_abs_diff_eq!(normalized[[1, 2]], -0.5 / s1, epsilon = 1e-15);
        for i in 0..2 {
            let row = normalized_row(matrix.row(i), pca_af[i], hwe_scale(pca_af[i], 2));
            assert_eq!(normalized.row(i), row);
        }
    }

    #[test]
    fn degenerate_inputs_are_refused() {
        let matrix = structured_matrix(2, 30, 1);
        assert!(matches!(
            hwe_normalized_pca(&matrix, &config(0)),
            Err(PipelineError::DegenerateInput(_))
        ));
        assert!(matches!(
            hwe_normalized_pca(&matrix, &config(20)),
            Err(PipelineError::DegenerateInput(_))
        ));

        let narrow = structured_matrix(10, 5, 1);
        assert!(matches!(
            hwe_normalized_pca(&narrow, &config(6)),
            Err(PipelineError::DegenerateInput(_))
        ));

        let monomorphic = GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G"), variant("chr1", 2, "C", "T")],
            (0..3).map(|j| SampleRecord::new(format!("s{}", j))).collect(),
            ndarray::array![[0, 1, 2], [0, 0, 0]],
        )
        .unwrap();
        assert!(matches!(
            hwe_normalized_pca(&monomorphic, &config(1)),
            Err(PipelineError::DegenerateInput(_))
        ));
    }

    #[test]
    fn empty_matrix_is_an_empty_result() {
        let matrix = structured_matrix(3, 10, 2).select_rows(&[]);
        assert!(matches!(
            hwe_normalized_pca(&matrix, &config(2)),
            Err(PipelineError::EmptyResult { .. })
        ));
    }

    #[test]
    fn projecting_reference_samples_reproduces_scores() {
        let mut matrix = structured_matrix(6, 50, 17);
        // A few missing calls must not break the identity.
        let mut calls = matrix.calls().to_owned();
        calls[[3, 4]] = MISSING;
        calls[[10, 7]] = MISSING;
        matrix = GenotypeMatrix::new(
            matrix.assembly(),
            matrix.variants().to_vec(),
            matrix.samples().to_vec(),
            calls,
        )
        .unwrap();

        let result = hwe_normalized_pca(&matrix, &exact(3)).unwrap();
        let projected = project_samples(&result, &matrix).unwrap();
        assert_eq!(projected.n_overlapping, 50);
        assert_eq!(projected.samples, result.samples);
        for (x, y) in projected.scores.iter().zip(result.scores.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn projection_ignores_absent_variants() {
        let matrix = structured_matrix(6, 50, 17);
        let result = hwe_normalized_pca(&matrix, &config(2)).unwrap();
        let subset = matrix.select_rows(&(0..25).collect::<Vec<_>>());
        let projected = project_samples(&result, &subset).unwrap();
        assert_eq!(projected.n_overlapping, 25);
        assert_eq!(projected.scores.dim(), (18, 2));
    }
}
