use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reference_pca::checkpoint::{self, Expectation, Stage};
use reference_pca::ld::{r_squared, LdPruneConfig};
use reference_pca::pca::PcaConfig;
use reference_pca::pipeline::{run, CheckpointPaths, Inputs, PipelineConfig, StageToggles};
use reference_pca::qc::SampleQcConfig;
use reference_pca::types::Assembly;
use reference_pca::{project_samples, PipelineError};

const N_SAMPLES: usize = 10;
const N_VARIANTS: usize = 30;

fn gt(n_alt: u8) -> &'static str {
    match n_alt {
        0 => "0/0",
        1 => "0/1",
        _ => "1/1",
    }
}

/// Two VCFs (chr1 and chr2) with random genotypes. Samples s0 and s1 always
/// differ, so every site stays polymorphic after QC.
fn write_inputs(dir: &Path) -> Inputs {
    let vcf_dir = dir.join("vcfs");
    fs::create_dir_all(&vcf_dir).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let sample_header: Vec<String> = (0..N_SAMPLES).map(|j| format!("s{}", j)).collect();

    for contig in ["1", "2"] {
        let mut text = String::from(
            "##fileformat=VCFv4.3\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n",
        );
        text.push_str(&format!(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\t{}\n",
            sample_header.join("\t")
        ));
        for i in 0..N_VARIANTS / 2 {
            let pos = 10_000 + 1_000 * i;
            let filter = if i == 3 { "LowQual" } else { "PASS" };
            let calls: Vec<&str> = (0..N_SAMPLES)
                .map(|j| match j {
                    0 => gt((i % 3) as u8),
                    1 => gt(((i + 1) % 3) as u8),
                    _ => gt(rng.random_range(0..3)),
                })
                .collect();
            text.push_str(&format!(
                "{}\t{}\t.\tA\tG\t.\t{}\t.\tGT\t{}\n",
                contig,
                pos,
                filter,
                calls.join("\t")
            ));
        }
        fs::write(vcf_dir.join(format!("chr{}.vcf", contig)), text).unwrap();
    }

    let mut meta = String::from("s\tqc_metrics_filters\n");
    for j in 0..N_SAMPLES {
        let failures = if j == 9 { "[\"n_snp\"]" } else { "[]" };
        meta.push_str(&format!("s{}\t{}\n", j, failures));
    }
    let sample_meta = dir.join("meta.tsv");
    fs::write(&sample_meta, meta).unwrap();

    let unrelated = dir.join("unrelated.txt");
    fs::write(&unrelated, (0..N_SAMPLES).map(|j| format!("s{}\n", j)).collect::<String>()).unwrap();
    let outliers = dir.join("outliers.txt");
    fs::write(&outliers, "s8\n").unwrap();

    // GRCh37 panel: every chr1 site, shifted back by the chain offset, plus
    // one site the chain does not cover.
    let mut panel = String::from("chr\tpos\tref\talt\n");
    for i in 0..N_VARIANTS / 2 {
        panel.push_str(&format!("1\t{}\tA\tG\n", 10_000 + 1_000 * i - 65));
    }
    panel.push_str("2\t10000\tA\tG\n");
    let target_panel = dir.join("panel.tsv");
    fs::write(&target_panel, panel).unwrap();

    let chain = dir.join("hg19ToHg38.chain");
    fs::write(
        &chain,
        "chain 1000 chr1 1000000 + 0 500000 chr1 1000000 + 65 500065 1\n500000\n",
    )
    .unwrap();

    Inputs {
        vcf_dir: Some(vcf_dir),
        sample_meta: Some(sample_meta),
        unrelated: Some(unrelated),
        outliers: Some(outliers),
        target_panel: Some(target_panel),
        chain: Some(chain),
    }
}

fn config(dir: &Path, inputs: Inputs) -> PipelineConfig {
    let ckpt = |name: &str| -> PathBuf { dir.join("ckpt").join(name) };
    PipelineConfig {
        stages: StageToggles {
            import: true,
            qc_filter: true,
            intersection: true,
            ld_prune: true,
            pca: true,
        },
        paths: CheckpointPaths {
            reference: ckpt("reference"),
            qc_pass: ckpt("qc_pass"),
            qc_pass_unrelated: ckpt("qc_pass_unrelated"),
            intersected: ckpt("intersected"),
            pruned: ckpt("pruned"),
            pca_prefix: format!("{}/out/ref_", dir.display()),
        },
        inputs,
        reference_assembly: Assembly::GRCh38,
        target_assembly: Assembly::GRCh37,
        overwrite: false,
        sample_qc: SampleQcConfig::default(),
        ld: LdPruneConfig::default(),
        pca: PcaConfig {
            k: 2,
            ..PcaConfig::default()
        },
    }
}

#[test]
fn full_run_produces_consistent_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path());
    let config = config(dir.path(), inputs);

    let summary = run(&config).unwrap();
    assert_eq!(
        summary.stages_run,
        vec!["import", "qc-filter", "intersection", "ld-prune", "pca"]
    );

    // s9 fails QC, s8 is an outlier.
    let kept = checkpoint::read_matrix(
        &config.paths.qc_pass_unrelated,
        &Expectation::upstream(Stage::QcPassUnrelated, Some(Assembly::GRCh38)),
    )
    .unwrap();
    let expected: Vec<String> = (0..8).map(|j| format!("s{}", j)).collect();
    assert_eq!(kept.sample_ids(), expected);
    assert!(kept.variants().iter().all(|r| r.is_pass()));

    // Only lifted chr1 sites survive the intersection.
    let intersected = checkpoint::read_matrix(
        &config.paths.intersected,
        &Expectation::upstream(Stage::Intersected, None),
    )
    .unwrap();
    assert!(intersected.n_variants() > 0);
    assert!(intersected
        .variants()
        .iter()
        .all(|r| r.variant.locus.contig == "chr1"));

    let pruned = checkpoint::read_matrix(&config.paths.pruned, &Expectation::upstream(Stage::Pruned, None)).unwrap();
    for a in 0..pruned.n_variants() {
        for b in (a + 1)..pruned.n_variants() {
            assert!(r_squared(pruned.row(a), pruned.row(b)) < 0.8);
        }
    }

    let result = summary.pca.unwrap();
    assert_eq!(result.eigenvalues.len(), 2);
    assert_eq!(result.samples, expected);
    assert_eq!(result.variants.len(), pruned.n_variants());

    let paths = summary.exports.unwrap();
    let scores = fs::read_to_string(&paths.scores).unwrap();
    let lines: Vec<&str> = scores.lines().collect();
    assert_eq!(lines[0], "s\tPC1\tPC2");
    assert_eq!(lines.len(), 1 + 8);
    for (line, sample) in lines[1..].iter().zip(&result.samples) {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[0], sample);
        let score = result.score(sample).unwrap();
        assert_eq!(fields[1].parse::<f64>().unwrap(), score[0]);
        assert_eq!(fields[2].parse::<f64>().unwrap(), score[1]);
    }

    let plink_ids: HashSet<String> = fs::read_to_string(&paths.plink_loadings)
        .unwrap()
        .lines()
        .skip(1)
        .map(|l| l.split('\t').next().unwrap().to_string())
        .collect();
    let afreq_ids: HashSet<String> = fs::read_to_string(&paths.plink_afreq)
        .unwrap()
        .lines()
        .skip(1)
        .map(|l| l.split('\t').next().unwrap().to_string())
        .collect();
    assert_eq!(plink_ids, afreq_ids);
    assert!(plink_ids.iter().all(|id| id.starts_with("chr1:") && id.ends_with(":A:G")));

    let projected = project_samples(&result, &pruned).unwrap();
    for (x, y) in projected.scores.iter().zip(result.scores.iter()) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn rerun_reuses_checkpoints_and_reproduces_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path());
    let config = config(dir.path(), inputs);

    let first = run(&config).unwrap();
    let paths = first.exports.unwrap();
    let scores_before = fs::read(&paths.scores).unwrap();
    let loadings_before = fs::read(&paths.loadings).unwrap();

    // Inputs vanish; everything must come from checkpoints.
    fs::remove_dir_all(dir.path().join("vcfs")).unwrap();
    let second = run(&config).unwrap();
    let paths = second.exports.unwrap();
    assert_eq!(fs::read(&paths.scores).unwrap(), scores_before);
    assert_eq!(fs::read(&paths.loadings).unwrap(), loadings_before);
}

#[test]
fn changed_parameters_conflict_with_existing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path());
    let mut config = config(dir.path(), inputs);
    run(&config).unwrap();

    config.ld.r2_threshold = 0.5;
    let err = run(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("stage 'ld-prune' failed"));
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::CheckpointConflict { .. })
    ));

    config.overwrite = true;
    run(&config).unwrap();
}

#[test]
fn later_stage_without_its_input_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path());
    let mut config = config(dir.path(), inputs);
    config.stages = StageToggles {
        pca: true,
        ..StageToggles::default()
    };
    let err = run(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("stage 'pca' failed"));
}

#[test]
fn grch37_panel_without_chain_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = write_inputs(dir.path());
    inputs.chain = None;
    let config = config(dir.path(), inputs);
    let err = run(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("stage 'intersection' failed"));
}
