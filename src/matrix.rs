// matrix.rs
//
// Owned variant-by-sample genotype table. Stages never edit one in place:
// every filter returns a new matrix.

use std::collections::HashSet;

use log::warn;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::types::{Assembly, SampleRecord, Variant, VariantRecord, MISSING};

/// Operations the pipeline needs from a genotype store: row and column
/// filters, a key semi-join and per-row aggregation.
pub trait GenotypeOps: Sized {
    fn filter_rows<F>(&self, keep: F) -> Self
    where
        F: Fn(&VariantRecord, ArrayView1<'_, i8>) -> bool + Sync;

    fn filter_cols<F>(&self, keep: F) -> Self
    where
        F: Fn(&SampleRecord) -> bool;

    /// Keeps rows whose variant key is in `keys`.
    fn semi_join_rows(&self, keys: &HashSet<Variant>) -> Self {
        self.filter_rows(|record, _| keys.contains(&record.variant))
    }

    /// Evaluates `f` once per row, in row order.
    fn aggregate_rows<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&VariantRecord, ArrayView1<'_, i8>) -> T + Sync + Send;
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenotypeMatrix {
    assembly: Assembly,
    variants: Vec<VariantRecord>,
    samples: Vec<SampleRecord>,
    /// variants x samples
    calls: Array2<i8>,
}

impl GenotypeMatrix {
    pub fn new(
        assembly: Assembly,
        variants: Vec<VariantRecord>,
        samples: Vec<SampleRecord>,
        calls: Array2<i8>,
    ) -> Result<Self> {
        if calls.nrows() != variants.len() || calls.ncols() != samples.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "call matrix is {}x{} but there are {} variants and {} samples",
                calls.nrows(),
                calls.ncols(),
                variants.len(),
                samples.len()
            )));
        }

        let mut seen_variants = HashSet::with_capacity(variants.len());
        for record in &variants {
            if record.variant.locus.assembly != assembly {
                return Err(PipelineError::ShapeMismatch(format!(
                    "variant {} is on {} but the matrix is {}",
                    record.variant, record.variant.locus.assembly, assembly
                )));
            }
            if !seen_variants.insert(&record.variant) {
                return Err(PipelineError::DuplicateVariant(record.variant.variant_str()));
            }
        }

        let mut seen_samples = HashSet::with_capacity(samples.len());
        for sample in &samples {
            if !seen_samples.insert(sample.id.as_str()) {
                return Err(PipelineError::ShapeMismatch(format!(
                    "sample '{}' appears more than once",
                    sample.id
                )));
            }
        }

        if let Some(bad) = calls
            .iter()
            .find(|&&g| g != MISSING && !(0..=2).contains(&g))
        {
            return Err(PipelineError::ShapeMismatch(format!(
                "genotype value {} is not a diploid alternate-allele count",
                bad
            )));
        }

        Ok(Self {
            assembly,
            variants,
            samples,
            calls,
        })
    }

    /// Builds a matrix from rows whose shape is already known to be valid.
    fn from_parts(
        assembly: Assembly,
        variants: Vec<VariantRecord>,
        samples: Vec<SampleRecord>,
        calls: Array2<i8>,
    ) -> Self {
        debug_assert_eq!(calls.nrows(), variants.len());
        debug_assert_eq!(calls.ncols(), samples.len());
        Self {
            assembly,
            variants,
            samples,
            calls,
        }
    }

    pub fn assembly(&self) -> Assembly {
        self.assembly
    }

    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn sample_ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.id.clone()).collect()
    }

    pub fn calls(&self) -> ArrayView2<'_, i8> {
        self.calls.view()
    }

    pub fn row(&self, idx: usize) -> ArrayView1<'_, i8> {
        self.calls.row(idx)
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty() || self.samples.is_empty()
    }

    /// Logs a warning when a stage produced an empty matrix. Returns whether
    /// it was empty so callers can decide to stop.
    pub fn warn_if_empty(&self, stage: &str) -> bool {
        if self.is_empty() {
            warn!(
                "{} produced an empty matrix ({} variants x {} samples); downstream stages will refuse it.",
                stage,
                self.n_variants(),
                self.n_samples()
            );
            true
        } else {
            false
        }
    }

    /// Fails with `EmptyResult` when there is nothing to operate on.
    pub fn ensure_non_empty(&self, stage: &'static str) -> Result<()> {
        if self.is_empty() {
            return Err(PipelineError::EmptyResult {
                stage,
                rows: self.n_variants(),
                cols: self.n_samples(),
            });
        }
        Ok(())
    }

    /// Rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let variants = indices.iter().map(|&i| self.variants[i].clone()).collect();
        let calls = self.calls.select(Axis(0), indices);
        Self::from_parts(self.assembly, variants, self.samples.clone(), calls)
    }

    /// Columns at `indices`, in the given order.
    pub fn select_cols(&self, indices: &[usize]) -> Self {
        let samples = indices.iter().map(|&j| self.samples[j].clone()).collect();
        let calls = self.calls.select(Axis(1), indices);
        Self::from_parts(self.assembly, self.variants.clone(), samples, calls)
    }

    /// Same matrix with rows in karyotypic locus order.
    pub fn sorted_by_locus(&self) -> Self {
        let mut order: Vec<usize> = (0..self.n_variants()).collect();
        order.sort_by(|&a, &b| self.variants[a].variant.cmp(&self.variants[b].variant));
        self.select_rows(&order)
    }
}

impl GenotypeOps for GenotypeMatrix {
    fn filter_rows<F>(&self, keep: F) -> Self
    where
        F: Fn(&VariantRecord, ArrayView1<'_, i8>) -> bool + Sync,
    {
        let kept: Vec<usize> = (0..self.n_variants())
            .into_par_iter()
            .filter(|&i| keep(&self.variants[i], self.calls.row(i)))
            .collect();
        self.select_rows(&kept)
    }

    fn filter_cols<F>(&self, keep: F) -> Self
    where
        F: Fn(&SampleRecord) -> bool,
    {
        let kept: Vec<usize> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| keep(s))
            .map(|(j, _)| j)
            .collect();
        self.select_cols(&kept)
    }

    fn aggregate_rows<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&VariantRecord, ArrayView1<'_, i8>) -> T + Sync + Send,
    {
        (0..self.n_variants())
            .into_par_iter()
            .map(|i| f(&self.variants[i], self.calls.row(i)))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Locus;
    use ndarray::array;

    pub(crate) fn variant(contig: &str, pos: u64, r: &str, a: &str) -> VariantRecord {
        VariantRecord::passing(Variant::biallelic(
            Locus::new(contig, pos, Assembly::GRCh38),
            r,
            a,
        ))
    }

    fn small() -> GenotypeMatrix {
        GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr2", 10, "A", "G"), variant("chr1", 50, "C", "T")],
            vec![SampleRecord::new("s1"), SampleRecord::new("s2"), SampleRecord::new("s3")],
            array![[0, 1, 2], [MISSING, 0, 1]],
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G"), variant("chr1", 1, "A", "G")],
            vec![SampleRecord::new("s1")],
            array![[0], [1]],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateVariant(_)));
    }

    #[test]
    fn same_locus_different_alleles_is_not_a_duplicate() {
        let m = GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G"), variant("chr1", 1, "G", "A")],
            vec![SampleRecord::new("s1")],
            array![[0], [1]],
        );
        assert!(m.is_ok());
    }

    #[test]
    fn rejects_shape_mismatch_and_bad_calls() {
        assert!(GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G")],
            vec![SampleRecord::new("s1")],
            array![[0, 1]],
        )
        .is_err());
        assert!(GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![variant("chr1", 1, "A", "G")],
            vec![SampleRecord::new("s1")],
            array![[3]],
        )
        .is_err());
    }

    #[test]
    fn filters_produce_new_matrices() {
        let m = small();
        let rows = m.filter_rows(|r, _| r.variant.locus.contig == "chr1");
        assert_eq!(rows.n_variants(), 1);
        assert_eq!(rows.row(0).to_vec(), vec![MISSING, 0, 1]);

        let cols = m.filter_cols(|s| s.id != "s2");
        assert_eq!(cols.sample_ids(), vec!["s1", "s3"]);
        assert_eq!(cols.row(0).to_vec(), vec![0, 2]);

        // original untouched
        assert_eq!(m.n_variants(), 2);
        assert_eq!(m.n_samples(), 3);
    }

    #[test]
    fn sorting_and_emptiness() {
        let sorted = small().sorted_by_locus();
        assert_eq!(sorted.variants()[0].variant.locus.contig, "chr1");
        assert_eq!(sorted.row(0).to_vec(), vec![MISSING, 0, 1]);

        let empty = small().filter_cols(|_| false);
        assert!(empty.is_empty());
        assert!(matches!(
            empty.ensure_non_empty("test"),
            Err(PipelineError::EmptyResult { rows: 2, cols: 0, .. })
        ));
    }
}
