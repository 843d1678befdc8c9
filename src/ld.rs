// ld.rs
//
// LD pruning: a frequency filter followed by greedy, window-bounded removal
// of variants in high pairwise r^2 with an already retained variant.

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matrix::{GenotypeMatrix, GenotypeOps};
use crate::progress;
use crate::types::MISSING;
use crate::variant_qc::{variant_qc, VariantQc};

/// Which candidate is retained first when two variants conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneOrder {
    /// Lower position wins.
    Position,
    /// Higher minor allele frequency wins; ties go to the lower position.
    MinorAlleleFrequency,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LdPruneConfig {
    pub r2_threshold: f64,
    pub window_bp: u64,
    /// Exclusive lower bound on alternate allele frequency.
    pub min_af: f64,
    /// Exclusive upper bound on alternate allele frequency.
    pub max_af: f64,
    pub min_call_rate: f64,
    pub order: PruneOrder,
}

impl Default for LdPruneConfig {
    fn default() -> Self {
        Self {
            r2_threshold: 0.8,
            window_bp: 500_000,
            min_af: 0.001,
            max_af: 0.999,
            min_call_rate: 0.0,
            order: PruneOrder::Position,
        }
    }
}

/// Keeps biallelic variants whose alternate allele frequency lies strictly
/// inside `(min_af, max_af)` and whose call rate reaches `min_call_rate`.
pub fn frequency_filter(matrix: &GenotypeMatrix, config: &LdPruneConfig) -> GenotypeMatrix {
    let filtered = matrix.filter_rows(|record, calls| {
        if !record.variant.is_biallelic() {
            return false;
        }
        let qc = VariantQc::from_calls(calls);
        let af_ok = qc.af.map_or(false, |af| af > config.min_af && af < config.max_af);
        af_ok && qc.call_rate >= config.min_call_rate
    });
    info!(
        "Frequency filter: {} / {} variants are biallelic with AF in ({}, {}).",
        filtered.n_variants(),
        matrix.n_variants(),
        config.min_af,
        config.max_af
    );
    filtered
}

/// Centered, mean-imputed dosages scaled to unit length. A constant row
/// comes back all zero, so it is never in LD with anything.
fn unit_dosages(calls: ArrayView1<'_, i8>) -> Vec<f32> {
    let (sum, n_called) = calls
        .iter()
        .filter(|&&g| g != MISSING)
        .fold((0.0f64, 0usize), |(s, c), &g| (s + g as f64, c + 1));
    if n_called == 0 {
        return vec![0.0; calls.len()];
    }
    let mean = sum / n_called as f64;
    let centered: Vec<f64> = calls
        .iter()
        .map(|&g| if g == MISSING { 0.0 } else { g as f64 - mean })
        .collect();
    let norm = centered.iter().map(|c| c * c).sum::<f64>().sqrt();
    if norm < 1e-12 {
        return vec![0.0; calls.len()];
    }
    centered.iter().map(|c| (c / norm) as f32).collect()
}

/// Correlation of two unit dosage rows, accumulated in f64.
fn correlation<'a>(x: impl IntoIterator<Item = &'a f32>, y: impl IntoIterator<Item = &'a f32>) -> f64 {
    x.into_iter().zip(y).map(|(a, b)| *a as f64 * *b as f64).sum()
}

/// Squared correlation of two dosage vectors, missing calls mean-imputed.
pub fn r_squared(x: ArrayView1<'_, i8>, y: ArrayView1<'_, i8>) -> f64 {
    let r = correlation(&unit_dosages(x), &unit_dosages(y));
    r * r
}

/// Greedy pruning of one contig. `positions` must be sorted ascending and
/// `units` holds the matching unit dosage rows. Returns retained local
/// indices in ascending order.
fn prune_contig(
    positions: &[u64],
    units: &Array2<f32>,
    mafs: &[f64],
    config: &LdPruneConfig,
) -> Vec<usize> {
    let n = positions.len();
    let mut order: Vec<usize> = (0..n).collect();
    if config.order == PruneOrder::MinorAlleleFrequency {
        order.sort_by(|&a, &b| mafs[b].total_cmp(&mafs[a]).then(a.cmp(&b)));
    }

    let mut decided = vec![false; n];
    let mut retained = Vec::new();
    for &i in &order {
        if decided[i] {
            continue;
        }
        decided[i] = true;
        retained.push(i);

        let lo_pos = positions[i].saturating_sub(config.window_bp);
        let hi_pos = positions[i].saturating_add(config.window_bp);
        let lo = positions.partition_point(|&p| p < lo_pos);
        let hi = positions.partition_point(|&p| p <= hi_pos);
        let anchor = units.row(i);
        for j in lo..hi {
            if decided[j] {
                continue;
            }
            let r = correlation(anchor, units.row(j));
            if r * r >= config.r2_threshold {
                decided[j] = true;
            }
        }
    }
    retained.sort_unstable();
    retained
}

/// Indices (into `matrix` rows) of the variants kept by greedy pruning.
/// Contigs are pruned independently and in parallel.
pub fn prune_indices(matrix: &GenotypeMatrix, config: &LdPruneConfig) -> Vec<usize> {
    let mut by_contig: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, record) in matrix.variants().iter().enumerate() {
        by_contig
            .entry(record.variant.locus.contig.as_str())
            .or_default()
            .push(idx);
    }
    let qcs = variant_qc(matrix);

    let pb = progress::bar(by_contig.len() as u64, "contigs pruned");

    let mut kept: Vec<usize> = by_contig
        .par_iter()
        .map(|(contig, rows)| {
            let mut rows = rows.clone();
            rows.sort_by_key(|&i| matrix.variants()[i].variant.locus.position);
            let positions: Vec<u64> = rows
                .iter()
                .map(|&i| matrix.variants()[i].variant.locus.position)
                .collect();
            let mafs: Vec<f64> = rows
                .iter()
                .map(|&i| qcs[i].af.map_or(0.0, |af| af.min(1.0 - af)))
                .collect();
            let n_samples = matrix.n_samples();
            let mut units = Array2::<f32>::zeros((rows.len(), n_samples));
            for (local, &i) in rows.iter().enumerate() {
                let u = unit_dosages(matrix.row(i));
                units.row_mut(local).assign(&ArrayView1::from(&u[..]));
            }

            let retained = prune_contig(&positions, &units, &mafs, config);
            debug!("{}: retained {} / {} variants", contig, retained.len(), rows.len());
            pb.inc(1);
            retained.into_iter().map(|local| rows[local]).collect::<Vec<usize>>()
        })
        .flatten()
        .collect();
    pb.finish_with_message("LD pruning complete.");

    kept.sort_unstable();
    kept
}

/// Frequency filter, then greedy LD pruning.
pub fn ld_prune(matrix: &GenotypeMatrix, config: &LdPruneConfig) -> Result<GenotypeMatrix> {
    matrix.ensure_non_empty("ld-prune")?;
    let common = frequency_filter(matrix, config);
    if common.warn_if_empty("ld-prune frequency filter") {
        return Ok(common);
    }
    let kept = prune_indices(&common, config);
    let pruned = common.select_rows(&kept);
    info!(
        "LD pruning (r2 >= {}, window {} bp, {:?} order): {} / {} variants retained.",
        config.r2_threshold,
        config.window_bp,
        config.order,
        pruned.n_variants(),
        common.n_variants()
    );
    Ok(pruned)
}
