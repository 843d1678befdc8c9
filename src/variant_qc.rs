// variant_qc.rs
//
// Per-variant call statistics: call rate, allele counts, genotype counts and
// a Hardy-Weinberg chi-squared test.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::matrix::{GenotypeMatrix, GenotypeOps};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantQc {
    pub n_called: usize,
    pub n_not_called: usize,
    pub call_rate: f64,
    /// Alternate allele count among called genotypes.
    pub ac: u64,
    /// Total called alleles (2 x n_called).
    pub an: u64,
    /// Alternate allele frequency; `None` when nothing was called.
    pub af: Option<f64>,
    pub n_hom_ref: usize,
    pub n_het: usize,
    pub n_hom_var: usize,
    /// Heterozygote frequency expected under HWE.
    pub het_freq_hwe: Option<f64>,
    pub p_value_hwe: f64,
}

impl VariantQc {
    pub fn from_calls(calls: ArrayView1<'_, i8>) -> Self {
        let (mut n_hom_ref, mut n_het, mut n_hom_var, mut n_missing) = (0usize, 0usize, 0usize, 0usize);
        for &g in calls.iter() {
            match g {
                0 => n_hom_ref += 1,
                1 => n_het += 1,
                2 => n_hom_var += 1,
                _ => n_missing += 1,
            }
        }
        let n_called = n_hom_ref + n_het + n_hom_var;
        let total = n_called + n_missing;
        let ac = (n_het + 2 * n_hom_var) as u64;
        let an = 2 * n_called as u64;
        let af = (an > 0).then(|| ac as f64 / an as f64);

        Self {
            n_called,
            n_not_called: n_missing,
            call_rate: if total > 0 { n_called as f64 / total as f64 } else { 0.0 },
            ac,
            an,
            af,
            n_hom_ref,
            n_het,
            n_hom_var,
            het_freq_hwe: af.map(|p| 2.0 * p * (1.0 - p)),
            p_value_hwe: hwe_chi_squared_p_value(n_hom_ref as f64, n_het as f64, n_hom_var as f64),
        }
    }
}

/// Runs `VariantQc::from_calls` over every row of the matrix.
pub fn variant_qc(matrix: &GenotypeMatrix) -> Vec<VariantQc> {
    matrix.aggregate_rows(|_, calls| VariantQc::from_calls(calls))
}

/// 1-df chi-squared goodness-of-fit p-value for HWE. Degenerate inputs
/// (no calls, monomorphic sites) return 1.0.
pub fn hwe_chi_squared_p_value(hom_ref: f64, het: f64, hom_alt: f64) -> f64 {
    let n = hom_ref + het + hom_alt;
    if n == 0.0 {
        return 1.0;
    }
    let p = (2.0 * hom_ref + het) / (2.0 * n);
    let q = 1.0 - p;

    let expected = [p * p * n, 2.0 * p * q * n, q * q * n];
    let observed = [hom_ref, het, hom_alt];
    if expected.iter().any(|&e| e <= 1e-12) {
        return 1.0;
    }
    let chi_squared: f64 = observed
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| (o - e).powi(2) / e)
        .sum();
    if !chi_squared.is_finite() {
        return 1.0;
    }
    match ChiSquared::new(1.0) {
        Ok(dist) => dist.sf(chi_squared),
        Err(_) => 1.0,
    }
}
