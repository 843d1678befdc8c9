// checkpoint.rs
//
// On-disk stage outputs. A matrix checkpoint is a directory holding a PLINK
// fileset (genotypes.bed/.bim/.fam, ALT counted as allele 1) and a JSON
// manifest with the full variant and sample records. Directories are built
// next to their destination and renamed into place.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bed_reader::{Bed, ReadOptions, WriteOptions};
use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::export::write_atomic;
use crate::matrix::GenotypeMatrix;
use crate::pca::PcaResult;
use crate::types::{Assembly, SampleRecord, VariantRecord};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const BED: &str = "genotypes.bed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Reference,
    QcPass,
    QcPassUnrelated,
    Intersected,
    Pruned,
    Pca,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reference => "reference",
            Stage::QcPass => "qc-pass",
            Stage::QcPassUnrelated => "qc-pass-unrelated",
            Stage::Intersected => "intersected",
            Stage::Pruned => "pruned",
            Stage::Pca => "pca",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub stage: Stage,
    pub assembly: Assembly,
    /// Stage parameters the checkpoint was produced with.
    pub params: serde_json::Value,
    pub n_variants: usize,
    pub n_samples: usize,
    pub variants: Vec<VariantRecord>,
    pub samples: Vec<SampleRecord>,
}

/// What a reader requires of an existing checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Expectation {
    pub stage: Stage,
    /// `None` accepts either assembly.
    pub assembly: Option<Assembly>,
    /// `None` accepts whatever parameters the checkpoint was written with.
    pub params: Option<serde_json::Value>,
}

impl Expectation {
    pub fn new(stage: Stage, assembly: Option<Assembly>, params: impl Serialize) -> Result<Self> {
        Ok(Self {
            stage,
            assembly,
            params: Some(serde_json::to_value(params)?),
        })
    }

    /// Accepts any parameters; used when reading another stage's output.
    pub fn upstream(stage: Stage, assembly: Option<Assembly>) -> Self {
        Self {
            stage,
            assembly,
            params: None,
        }
    }

    fn written_params(&self) -> serde_json::Value {
        self.params.clone().unwrap_or_default()
    }

    fn check(&self, path: &Path, format_version: u32, stage: Stage, assembly: Assembly, params: &serde_json::Value) -> Result<()> {
        if format_version != FORMAT_VERSION {
            return Err(PipelineError::conflict(
                path,
                format!("format version {} (expected {})", format_version, FORMAT_VERSION),
            ));
        }
        if stage != self.stage {
            return Err(PipelineError::conflict(
                path,
                format!("holds stage '{}', expected '{}'", stage, self.stage),
            ));
        }
        if let Some(expected) = self.assembly {
            if assembly != expected {
                return Err(PipelineError::conflict(
                    path,
                    format!("assembly is {}, expected {}", assembly, expected),
                ));
            }
        }
        if let Some(expected) = &self.params {
            if params != expected {
                return Err(PipelineError::conflict(
                    path,
                    format!("written with parameters {} but this run uses {}", params, expected),
                ));
            }
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    }
}

/// Brings a checkpoint path back to a consistent state after an interrupted
/// replacement: restores the moved-aside copy if the new one never landed,
/// discards it otherwise.
fn recover(path: &Path) -> Result<()> {
    let backup = sibling(path, ".bak");
    if !backup.exists() {
        return Ok(());
    }
    if path.exists() {
        debug!("Removing stale backup {}", backup.display());
        remove_any(&backup)?;
    } else {
        warn!(
            "Restoring {} from {} after an interrupted write.",
            path.display(),
            backup.display()
        );
        fs::rename(&backup, path)?;
    }
    Ok(())
}

/// Moves the finished `staged` output onto `path`, keeping the previous
/// output aside until the rename has succeeded.
fn install(staged: &Path, path: &Path) -> Result<()> {
    let backup = sibling(path, ".bak");
    remove_any(&backup)?;
    let had_previous = path.exists();
    if had_previous {
        fs::rename(path, &backup)?;
    }
    if let Err(e) = fs::rename(staged, path) {
        if had_previous {
            fs::rename(&backup, path)?;
        }
        return Err(e.into());
    }
    if had_previous {
        remove_any(&backup)?;
    }
    Ok(())
}

pub fn exists(path: &Path) -> Result<bool> {
    recover(path)?;
    Ok(path.join(MANIFEST).is_file())
}

fn write_fileset(dir: &Path, matrix: &GenotypeMatrix) -> Result<()> {
    let bp_positions = matrix
        .variants()
        .iter()
        .map(|r| {
            i32::try_from(r.variant.locus.position).map_err(|_| {
                PipelineError::ShapeMismatch(format!(
                    "position of {} does not fit a PLINK .bim record",
                    r.variant
                ))
            })
        })
        .collect::<Result<Vec<i32>>>()?;

    let variants = matrix.variants();
    // bed-reader wants samples x variants.
    let calls = matrix.calls().t().to_owned();
    WriteOptions::builder(dir.join(BED))
        .iid(matrix.samples().iter().map(|s| s.id.as_str()))
        .sid(variants.iter().map(|r| r.variant.variant_str()))
        .chromosome(variants.iter().map(|r| r.variant.locus.contig.as_str()))
        .bp_position(bp_positions)
        .allele_1(variants.iter().map(|r| r.variant.alleles.get(1..).map(|a| a.join(",")).unwrap_or_default()))
        .allele_2(variants.iter().map(|r| r.variant.reference().to_string()))
        .write(&calls)?;
    Ok(())
}

/// Writes `matrix` to `path` as a checkpoint for `expectation.stage`,
/// replacing any previous checkpoint there only once the new one is complete.
pub fn write_matrix(path: &Path, matrix: &GenotypeMatrix, expectation: &Expectation) -> Result<()> {
    recover(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staged = sibling(path, ".tmp");
    remove_any(&staged)?;
    fs::create_dir_all(&staged)?;

    let result = (|| -> Result<()> {
        if !matrix.is_empty() {
            write_fileset(&staged, matrix)?;
        }
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            stage: expectation.stage,
            assembly: matrix.assembly(),
            params: expectation.written_params(),
            n_variants: matrix.n_variants(),
            n_samples: matrix.n_samples(),
            variants: matrix.variants().to_vec(),
            samples: matrix.samples().to_vec(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&staged.join(MANIFEST), |w| std::io::Write::write_all(w, &json))?;
        install(&staged, path)
    })();

    if result.is_err() {
        let _ = remove_any(&staged);
    }
    result?;
    info!(
        "Checkpoint '{}' written to {} ({} variants x {} samples).",
        expectation.stage,
        path.display(),
        matrix.n_variants(),
        matrix.n_samples()
    );
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<Manifest> {
    recover(path)?;
    let text = fs::read(path.join(MANIFEST))?;
    Ok(serde_json::from_slice(&text)?)
}

/// Loads the checkpoint at `path`, refusing it unless it matches `expectation`.
pub fn read_matrix(path: &Path, expectation: &Expectation) -> Result<GenotypeMatrix> {
    let manifest = read_manifest(path)?;
    expectation.check(
        path,
        manifest.format_version,
        manifest.stage,
        manifest.assembly,
        &manifest.params,
    )?;
    if manifest.variants.len() != manifest.n_variants || manifest.samples.len() != manifest.n_samples {
        return Err(PipelineError::conflict(path, "manifest counts disagree with its records"));
    }

    let calls = if manifest.n_variants == 0 || manifest.n_samples == 0 {
        Array2::<i8>::zeros((manifest.n_variants, manifest.n_samples))
    } else {
        let mut bed = Bed::new(path.join(BED))?;
        let iid = bed.iid()?;
        if iid.len() != manifest.n_samples
            || iid.iter().zip(&manifest.samples).any(|(a, b)| a != &b.id)
        {
            return Err(PipelineError::conflict(path, "PLINK .fam samples differ from the manifest"));
        }
        let sid = bed.sid()?;
        if sid.len() != manifest.n_variants
            || sid
                .iter()
                .zip(&manifest.variants)
                .any(|(a, b)| a != &b.variant.variant_str())
        {
            return Err(PipelineError::conflict(path, "PLINK .bim variants differ from the manifest"));
        }
        let samples_by_variants = ReadOptions::builder().i8().count_a1().read(&mut bed)?;
        samples_by_variants.t().to_owned()
    };

    let matrix = GenotypeMatrix::new(manifest.assembly, manifest.variants, manifest.samples, calls)?;
    info!(
        "Loaded checkpoint '{}' from {} ({} variants x {} samples).",
        manifest.stage,
        path.display(),
        matrix.n_variants(),
        matrix.n_samples()
    );
    Ok(matrix)
}

/// Reuses the checkpoint at `path` unless `overwrite` is set or none exists;
/// otherwise runs `compute` and checkpoints its output.
pub fn checkpointed<F, E>(
    path: &Path,
    overwrite: bool,
    expectation: &Expectation,
    compute: F,
) -> std::result::Result<GenotypeMatrix, E>
where
    F: FnOnce() -> std::result::Result<GenotypeMatrix, E>,
    E: From<PipelineError>,
{
    if !overwrite && exists(path)? {
        info!("Reusing existing checkpoint at {}", path.display());
        return Ok(read_matrix(path, expectation)?);
    }
    let matrix = compute()?;
    write_matrix(path, &matrix, expectation)?;
    Ok(matrix)
}

#[derive(Debug, Serialize, Deserialize)]
struct PcaCheckpoint {
    format_version: u32,
    params: serde_json::Value,
    result: PcaResult,
}

pub fn pca_path(prefix: &str) -> PathBuf {
    crate::export::output_path(prefix, "pca.json")
}

pub fn write_pca(path: &Path, result: &PcaResult, expectation: &Expectation) -> Result<()> {
    let checkpoint = PcaCheckpoint {
        format_version: FORMAT_VERSION,
        params: expectation.written_params(),
        result: result.clone(),
    };
    let json = serde_json::to_vec(&checkpoint)?;
    write_atomic(path, |w| std::io::Write::write_all(w, &json))?;
    info!("PCA result written to {}", path.display());
    Ok(())
}

pub fn read_pca(path: &Path, expectation: &Expectation) -> Result<PcaResult> {
    let text = fs::read(path)?;
    let checkpoint: PcaCheckpoint = serde_json::from_slice(&text)?;
    expectation.check(
        path,
        checkpoint.format_version,
        Stage::Pca,
        checkpoint.result.assembly,
        &checkpoint.params,
    )?;
    checkpoint.result.validate()?;
    Ok(checkpoint.result)
}
