//! Population-structure PCA over a reference genotype matrix: sample QC,
//! GRCh37 to GRCh38 liftover of a target panel, panel intersection, LD
//! pruning, HWE-normalized PCA and export of scores and loadings.

pub mod checkpoint;
pub mod error;
pub mod export;
pub mod intersect;
pub mod ld;
pub mod liftover;
pub mod linalg;
pub mod matrix;
pub mod panel;
pub mod pca;
pub mod pipeline;
pub mod qc;
pub mod types;
pub mod variant_qc;
pub mod vcf;

pub(crate) mod progress;

pub use error::{PipelineError, Result};
pub use matrix::{GenotypeMatrix, GenotypeOps};
pub use pca::{hwe_normalized_pca, project_samples, PcaConfig, PcaResult};
