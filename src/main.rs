// main.rs

use anyhow::{anyhow, Error, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use reference_pca::pipeline;

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting reference_pca with args: {:?}", cli_args);

    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
        .map_err(|e| anyhow!("Failed to configure the thread pool: {}", e))?;

    let config = cli_args.to_config()?;
    let summary = pipeline::run(&config)?;

    if let Some(paths) = &summary.exports {
        info!(
            "PCA outputs: {}, {}, {}, {}, {}",
            paths.scores.display(),
            paths.loadings.display(),
            paths.plink_loadings.display(),
            paths.plink_afreq.display(),
            paths.eigenvalues.display()
        );
    }
    info!(
        "reference_pca finished stages {:?} in {:.2?}.",
        summary.stages_run,
        total_time_start.elapsed()
    );
    Ok(())
}

mod cli {
    use std::path::PathBuf;

    use anyhow::{anyhow, Result};
    use clap::{Parser, ValueEnum};

    use reference_pca::ld::{LdPruneConfig, PruneOrder};
    use reference_pca::pca::PcaConfig;
    use reference_pca::pipeline::{CheckpointPaths, Inputs, PipelineConfig, StageToggles};
    use reference_pca::qc::SampleQcConfig;
    use reference_pca::types::{Assembly, QcMetric};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
    pub(crate) enum PruneOrderArg {
        /// Lower position wins a conflict.
        Position,
        /// Higher minor allele frequency wins a conflict.
        Maf,
    }

    #[derive(Parser, Debug)]
    #[command(
        author,
        version,
        about = "Reference-panel PCA: sample QC, panel intersection with liftover, LD pruning and HWE-normalized PCA.",
        long_about = None,
        propagate_version = true
    )]
    pub(crate) struct CliArgs {
        /// Build the reference checkpoint from --vcf-dir and --sample-meta.
        #[arg(long)]
        pub(crate) run_import: bool,

        #[arg(long)]
        pub(crate) run_qc_filter: bool,

        #[arg(long)]
        pub(crate) run_intersection: bool,

        #[arg(long)]
        pub(crate) run_ld_prune: bool,

        #[arg(long)]
        pub(crate) run_pca: bool,

        #[arg(long, default_value = "reference.mt")]
        pub(crate) ref_matrix: PathBuf,

        #[arg(long, default_value = "qc_pass.mt")]
        pub(crate) pass_matrix: PathBuf,

        #[arg(long, default_value = "qc_pass_unrelated.mt")]
        pub(crate) pass_unrel_matrix: PathBuf,

        #[arg(long, default_value = "intersected.mt")]
        pub(crate) intersect_out: PathBuf,

        #[arg(long, default_value = "pruned.mt")]
        pub(crate) prune_out: PathBuf,

        /// Prefix for the PCA outputs, e.g. `out/ref_` or `out/`.
        #[arg(long, default_value = "pca_")]
        pub(crate) pca_prefix: String,

        #[arg(short = 'd', long)]
        pub(crate) vcf_dir: Option<PathBuf>,

        /// TSV with columns `s` and `qc_metrics_filters`.
        #[arg(long)]
        pub(crate) sample_meta: Option<PathBuf>,

        /// Unrelated sample IDs, one per line.
        #[arg(long)]
        pub(crate) unrelated: Option<PathBuf>,

        /// Outlier sample IDs, one per line.
        #[arg(long)]
        pub(crate) outliers: Option<PathBuf>,

        /// Target panel TSV (chr, pos, ref, alt).
        #[arg(long)]
        pub(crate) snp_list: Option<PathBuf>,

        /// Assembly of the target panel: GRCh37 or GRCh38.
        #[arg(long, default_value = "grch38")]
        pub(crate) target_assembly: String,

        /// GRCh37 to GRCh38 chain file, plain or gzipped.
        #[arg(long)]
        pub(crate) chain: Option<PathBuf>,

        /// Recompute stages even when their checkpoint exists.
        #[arg(long)]
        pub(crate) overwrite: bool,

        #[arg(long, default_value_t = 0.8)]
        pub(crate) r2: f64,

        #[arg(long, default_value_t = 500_000)]
        pub(crate) window_bp: u64,

        #[arg(long, default_value_t = 0.001)]
        pub(crate) min_af: f64,

        #[arg(long, default_value_t = 0.999)]
        pub(crate) max_af: f64,

        #[arg(long, default_value_t = 0.0)]
        pub(crate) min_call_rate: f64,

        #[arg(long, value_enum, default_value_t = PruneOrderArg::Position)]
        pub(crate) prune_order: PruneOrderArg,

        #[arg(short = 'k', long, default_value_t = 20)]
        pub(crate) components: usize,

        #[arg(long, default_value_t = 1)]
        pub(crate) pca_seed: u64,

        /// QC metric whose failure is tolerated (repeatable).
        #[arg(long = "exempt-qc-metric")]
        pub(crate) exempt_qc_metrics: Vec<String>,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn to_config(&self) -> Result<PipelineConfig> {
            let target_assembly: Assembly = self.target_assembly.parse()?;
            let exempt = self
                .exempt_qc_metrics
                .iter()
                .map(|m| m.parse::<QcMetric>().map_err(|e| anyhow!(e)))
                .collect::<Result<Vec<_>>>()?;
            if !(0.0..=1.0).contains(&self.r2) {
                return Err(anyhow!("--r2 must lie in [0, 1], got {}", self.r2));
            }
            if self.min_af >= self.max_af {
                return Err(anyhow!(
                    "--min-af ({}) must be below --max-af ({})",
                    self.min_af,
                    self.max_af
                ));
            }

            Ok(PipelineConfig {
                stages: StageToggles {
                    import: self.run_import,
                    qc_filter: self.run_qc_filter,
                    intersection: self.run_intersection,
                    ld_prune: self.run_ld_prune,
                    pca: self.run_pca,
                },
                paths: CheckpointPaths {
                    reference: self.ref_matrix.clone(),
                    qc_pass: self.pass_matrix.clone(),
                    qc_pass_unrelated: self.pass_unrel_matrix.clone(),
                    intersected: self.intersect_out.clone(),
                    pruned: self.prune_out.clone(),
                    pca_prefix: self.pca_prefix.clone(),
                },
                inputs: Inputs {
                    vcf_dir: self.vcf_dir.clone(),
                    sample_meta: self.sample_meta.clone(),
                    unrelated: self.unrelated.clone(),
                    outliers: self.outliers.clone(),
                    target_panel: self.snp_list.clone(),
                    chain: self.chain.clone(),
                },
                reference_assembly: Assembly::GRCh38,
                target_assembly,
                overwrite: self.overwrite,
                sample_qc: SampleQcConfig::with_exempt(exempt),
                ld: LdPruneConfig {
                    r2_threshold: self.r2,
                    window_bp: self.window_bp,
                    min_af: self.min_af,
                    max_af: self.max_af,
                    min_call_rate: self.min_call_rate,
                    order: match self.prune_order {
                        PruneOrderArg::Position => PruneOrder::Position,
                        PruneOrderArg::Maf => PruneOrder::MinorAlleleFrequency,
                    },
                },
                pca: PcaConfig {
                    k: self.components,
                    seed: self.pca_seed,
                    ..PcaConfig::default()
                },
            })
        }
    }

}
