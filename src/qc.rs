// qc.rs
//
// Sample QC: drop samples failing non-exempt QC metrics, then restrict to
// site-QC-passing variants and unrelated, non-outlier samples.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, info};

use crate::error::Result;
use crate::matrix::{GenotypeMatrix, GenotypeOps};
use crate::types::{QcMetric, SampleRecord};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleQcConfig {
    /// Metrics whose failure does not disqualify a sample.
    pub exempt_metrics: BTreeSet<QcMetric>,
}

impl SampleQcConfig {
    pub fn with_exempt(metrics: impl IntoIterator<Item = QcMetric>) -> Self {
        Self {
            exempt_metrics: metrics.into_iter().collect(),
        }
    }

    pub fn disqualifying_failures<'a>(
        &'a self,
        sample: &'a SampleRecord,
    ) -> impl Iterator<Item = &'a QcMetric> + 'a {
        sample
            .qc_metrics_filters
            .difference(&self.exempt_metrics)
    }

    pub fn passes(&self, sample: &SampleRecord) -> bool {
        self.disqualifying_failures(sample).next().is_none()
    }
}

/// Keeps samples with no disqualifying QC failures. Variants are untouched.
pub fn filter_qc_pass(matrix: &GenotypeMatrix, config: &SampleQcConfig) -> GenotypeMatrix {
    let filtered = matrix.filter_cols(|sample| {
        let pass = config.passes(sample);
        if !pass {
            debug!(
                "Sample {} dropped for QC failures: {:?}",
                sample.id,
                config.disqualifying_failures(sample).collect::<Vec<_>>()
            );
        }
        pass
    });
    info!(
        "Sample QC: {} / {} samples pass (exempt metrics: {:?}).",
        filtered.n_samples(),
        matrix.n_samples(),
        config.exempt_metrics
    );
    filtered
}

/// Keeps site-QC-passing variants and samples that are in `unrelated` and not
/// in `outliers`.
pub fn filter_unrelated_non_outliers(
    matrix: &GenotypeMatrix,
    unrelated: &HashSet<String>,
    outliers: &HashSet<String>,
) -> GenotypeMatrix {
    let passing_sites = matrix.filter_rows(|record, _| record.is_pass());
    info!(
        "Variant QC: {} / {} variants have no site filters.",
        passing_sites.n_variants(),
        matrix.n_variants()
    );

    let unrelated_only = passing_sites.filter_cols(|sample| unrelated.contains(&sample.id));
    info!(
        "Relatedness: {} / {} samples are in the unrelated set.",
        unrelated_only.n_samples(),
        passing_sites.n_samples()
    );

    let result = unrelated_only.filter_cols(|sample| !outliers.contains(&sample.id));
    info!(
        "Outliers: removed {} samples; {} remain.",
        unrelated_only.n_samples() - result.n_samples(),
        result.n_samples()
    );
    result
}

/// Reads one sample ID per line (first whitespace-delimited field). A leading
/// `s` header, blank lines and `#` comments are skipped.
pub fn read_sample_list(path: &Path) -> Result<HashSet<String>> {
    let file = File::open(path)?;
    let mut ids = HashSet::new();
    for (line_idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let Some(id) = line.split_whitespace().next() else {
            continue;
        };
        if id.starts_with('#') || (line_idx == 0 && id == "s") {
            continue;
        }
        ids.insert(id.to_string());
    }
    info!("Read {} sample IDs from {}", ids.len(), path.display());
    Ok(ids)
}
