// pipeline.rs
//
// Stage orchestration: import, sample QC, panel intersection, LD pruning and
// PCA, each memoized behind a checkpoint.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde_json::json;

use crate::checkpoint::{self, Expectation, Stage};
use crate::export::{self, ExportPaths};
use crate::intersect::intersect_with_panel;
use crate::ld::{ld_prune, LdPruneConfig};
use crate::liftover::{ChainMap, CoordinateMapper};
use crate::matrix::GenotypeMatrix;
use crate::panel::TargetPanel;
use crate::pca::{hwe_normalized_pca, PcaConfig, PcaResult};
use crate::qc::{filter_qc_pass, filter_unrelated_non_outliers, read_sample_list, SampleQcConfig};
use crate::types::Assembly;
use crate::vcf::import_reference;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageToggles {
    pub import: bool,
    pub qc_filter: bool,
    pub intersection: bool,
    pub ld_prune: bool,
    pub pca: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub reference: PathBuf,
    pub qc_pass: PathBuf,
    pub qc_pass_unrelated: PathBuf,
    pub intersected: PathBuf,
    pub pruned: PathBuf,
    /// Prepended to every PCA output file name.
    pub pca_prefix: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub vcf_dir: Option<PathBuf>,
    pub sample_meta: Option<PathBuf>,
    pub unrelated: Option<PathBuf>,
    pub outliers: Option<PathBuf>,
    pub target_panel: Option<PathBuf>,
    pub chain: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub stages: StageToggles,
    pub paths: CheckpointPaths,
    pub inputs: Inputs,
    /// Assembly of the reference matrix.
    pub reference_assembly: Assembly,
    pub target_assembly: Assembly,
    pub overwrite: bool,
    pub sample_qc: SampleQcConfig,
    pub ld: LdPruneConfig,
    pub pca: PcaConfig,
}

/// What a run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub stages_run: Vec<&'static str>,
    pub pca: Option<PcaResult>,
    pub exports: Option<ExportPaths>,
}

fn required<'a>(path: &'a Option<PathBuf>, flag: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| anyhow!("{} is required for this stage", flag))
}

/// The previous stage's output: the in-memory matrix when that stage ran in
/// this invocation, otherwise its checkpoint.
fn upstream(
    carried: Option<GenotypeMatrix>,
    path: &Path,
    stage: Stage,
    assembly: Assembly,
) -> Result<GenotypeMatrix> {
    if let Some(matrix) = carried {
        return Ok(matrix);
    }
    if !checkpoint::exists(path)? {
        return Err(anyhow!(
            "no '{}' checkpoint at {}; run the stage that produces it first",
            stage,
            path.display()
        ));
    }
    Ok(checkpoint::read_matrix(path, &Expectation::upstream(stage, Some(assembly)))?)
}

impl PipelineConfig {
    fn import_params(&self) -> serde_json::Value {
        json!({
            "vcf_dir": self.inputs.vcf_dir,
            "sample_meta": self.inputs.sample_meta,
        })
    }

    fn qc_params(&self) -> serde_json::Value {
        json!({ "exempt_metrics": self.sample_qc.exempt_metrics })
    }

    fn unrelated_params(&self) -> serde_json::Value {
        json!({
            "exempt_metrics": self.sample_qc.exempt_metrics,
            "unrelated": self.inputs.unrelated,
            "outliers": self.inputs.outliers,
        })
    }

    fn intersect_params(&self) -> serde_json::Value {
        json!({
            "target_panel": self.inputs.target_panel,
            "target_assembly": self.target_assembly,
        })
    }
}

fn run_import(config: &PipelineConfig) -> Result<GenotypeMatrix> {
    let vcf_dir = required(&config.inputs.vcf_dir, "--vcf-dir")?;
    let sample_meta = required(&config.inputs.sample_meta, "--sample-meta")?;
    let expectation = Expectation::new(
        Stage::Reference,
        Some(config.reference_assembly),
        config.import_params(),
    )?;
    let matrix = checkpoint::checkpointed(&config.paths.reference, config.overwrite, &expectation, || {
        import_reference(vcf_dir, sample_meta, config.reference_assembly)
    })?;
    matrix.warn_if_empty("import");
    Ok(matrix)
}

fn run_qc_filter(config: &PipelineConfig, carried: Option<GenotypeMatrix>) -> Result<GenotypeMatrix> {
    let unrelated_path = required(&config.inputs.unrelated, "--unrelated")?;
    let paths = &config.paths;

    let pass_expectation = Expectation::new(Stage::QcPass, Some(config.reference_assembly), config.qc_params())?;
    let pass = checkpoint::checkpointed(&paths.qc_pass, config.overwrite, &pass_expectation, || {
        let reference = upstream(carried, &paths.reference, Stage::Reference, config.reference_assembly)?;
        Ok::<_, anyhow::Error>(filter_qc_pass(&reference, &config.sample_qc))
    })?;
    pass.warn_if_empty("sample QC");

    let unrelated_expectation = Expectation::new(
        Stage::QcPassUnrelated,
        Some(config.reference_assembly),
        config.unrelated_params(),
    )?;
    let kept = checkpoint::checkpointed(&paths.qc_pass_unrelated, config.overwrite, &unrelated_expectation, || {
        let unrelated = read_sample_list(unrelated_path)?;
        let outliers = match &config.inputs.outliers {
            Some(path) => read_sample_list(path)?,
            None => HashSet::new(),
        };
        Ok::<_, anyhow::Error>(filter_unrelated_non_outliers(&pass, &unrelated, &outliers))
    })?;
    kept.warn_if_empty("unrelated/outlier filter");
    Ok(kept)
}

fn run_intersection(config: &PipelineConfig, carried: Option<GenotypeMatrix>) -> Result<GenotypeMatrix> {
    let panel_path = required(&config.inputs.target_panel, "--snp-list")?;
    let expectation = Expectation::new(
        Stage::Intersected,
        Some(config.reference_assembly),
        config.intersect_params(),
    )?;
    let intersected = checkpoint::checkpointed(&config.paths.intersected, config.overwrite, &expectation, || {
        let input = upstream(
            carried,
            &config.paths.qc_pass_unrelated,
            Stage::QcPassUnrelated,
            config.reference_assembly,
        )?;
        let panel = TargetPanel::from_path(panel_path, config.target_assembly)?;
        let chain = if panel.assembly() != input.assembly() {
            let chain_path = required(&config.inputs.chain, "--chain")?;
            Some(ChainMap::from_path(chain_path, panel.assembly(), input.assembly())?)
        } else {
            None
        };
        let mapper = chain.as_ref().map(|c| c as &dyn CoordinateMapper);
        Ok::<_, anyhow::Error>(intersect_with_panel(&input, &panel, mapper)?)
    })?;
    intersected.warn_if_empty("intersection");
    Ok(intersected)
}

fn run_ld_prune(config: &PipelineConfig, carried: Option<GenotypeMatrix>) -> Result<GenotypeMatrix> {
    let expectation = Expectation::new(Stage::Pruned, Some(config.reference_assembly), &config.ld)?;
    let pruned = checkpoint::checkpointed(&config.paths.pruned, config.overwrite, &expectation, || {
        let input = upstream(
            carried,
            &config.paths.intersected,
            Stage::Intersected,
            config.reference_assembly,
        )?;
        Ok::<_, anyhow::Error>(ld_prune(&input, &config.ld)?)
    })?;
    pruned.warn_if_empty("LD pruning");
    Ok(pruned)
}

fn run_pca(config: &PipelineConfig, carried: Option<GenotypeMatrix>) -> Result<(PcaResult, ExportPaths)> {
    let expectation = Expectation::new(Stage::Pca, Some(config.reference_assembly), &config.pca)?;
    let result_path = checkpoint::pca_path(&config.paths.pca_prefix);

    let result = if !config.overwrite && result_path.is_file() {
        info!("Reusing existing PCA result at {}", result_path.display());
        checkpoint::read_pca(&result_path, &expectation)?
    } else {
        let input = upstream(carried, &config.paths.pruned, Stage::Pruned, config.reference_assembly)?;
        let result = hwe_normalized_pca(&input, &config.pca)?;
        checkpoint::write_pca(&result_path, &result, &expectation)?;
        result
    };

    let paths = export::export_all(&result, &config.paths.pca_prefix)?;
    Ok((result, paths))
}

/// Runs the enabled stages in order. Each stage's failure is reported with
/// the stage named.
pub fn run(config: &PipelineConfig) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let mut carried: Option<GenotypeMatrix> = None;
    let stages = &config.stages;
    if !(stages.import || stages.qc_filter || stages.intersection || stages.ld_prune || stages.pca) {
        warn!("No stages enabled; nothing to do.");
        return Ok(summary);
    }

    if stages.import {
        let start = Instant::now();
        carried = Some(run_import(config).context("stage 'import' failed")?);
        info!("Stage 'import' finished in {:.2?}", start.elapsed());
        summary.stages_run.push("import");
    }
    if stages.qc_filter {
        let start = Instant::now();
        carried = Some(run_qc_filter(config, carried.take()).context("stage 'qc-filter' failed")?);
        info!("Stage 'qc-filter' finished in {:.2?}", start.elapsed());
        summary.stages_run.push("qc-filter");
    } else {
        carried = None;
    }
    if stages.intersection {
        let start = Instant::now();
        carried = Some(run_intersection(config, carried.take()).context("stage 'intersection' failed")?);
        info!("Stage 'intersection' finished in {:.2?}", start.elapsed());
        summary.stages_run.push("intersection");
    } else {
        carried = None;
    }
    if stages.ld_prune {
        let start = Instant::now();
        carried = Some(run_ld_prune(config, carried.take()).context("stage 'ld-prune' failed")?);
        info!("Stage 'ld-prune' finished in {:.2?}", start.elapsed());
        summary.stages_run.push("ld-prune");
    } else {
        carried = None;
    }
    if stages.pca {
        let start = Instant::now();
        let (result, paths) = run_pca(config, carried.take()).context("stage 'pca' failed")?;
        info!("Stage 'pca' finished in {:.2?}", start.elapsed());
        summary.stages_run.push("pca");
        summary.pca = Some(result);
        summary.exports = Some(paths);
    }
    Ok(summary)
}
