// error.rs

use std::path::PathBuf;

use bed_reader::BedErrorPlus;
use thiserror::Error;

use crate::types::Assembly;

/// Errors raised by the pipeline stages and the checkpoint store.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unrecognized genome assembly '{0}' (expected GRCh37 or GRCh38)")]
    InvalidAssembly(String),

    #[error("{stage}: input has {rows} variants and {cols} samples; nothing to operate on")]
    EmptyResult {
        stage: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("degenerate PCA input: {0}")]
    DegenerateInput(String),

    #[error("checkpoint at {} cannot be reused: {reason}", path.display())]
    CheckpointConflict { path: PathBuf, reason: String },

    #[error("target panel is on {from} but no {from}->{to} liftover chain was supplied")]
    MissingLiftover { from: Assembly, to: Assembly },

    #[error("liftover from {from} to {to} is not supported by this pipeline")]
    UnsupportedLiftover { from: Assembly, to: Assembly },

    #[error("duplicate variant key {0} in genotype matrix")]
    DuplicateVariant(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("malformed record in {} at line {line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("no VCF files (.vcf, .vcf.gz, .vcf.bgz) found in {}", .0.display())]
    NoVcfFiles(PathBuf),

    #[error("VCF {} does not match the reference sample set: {reason}", path.display())]
    SampleMismatch { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint manifest error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("PLINK fileset error: {0}")]
    Bed(#[from] Box<BedErrorPlus>),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        PipelineError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn conflict(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::CheckpointConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
