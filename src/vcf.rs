// vcf.rs
//
// Builds the reference genotype matrix from a directory of VCFs plus a
// per-sample QC metadata table.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use ndarray::Array2;
use noodles_vcf::{self as vcf, variant::record::samples::series::Value, variant::record::samples::Series as _};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::matrix::GenotypeMatrix;
use crate::progress;
use crate::types::{Assembly, Locus, QcMetric, SampleRecord, Variant, VariantRecord, MISSING};

const GT: &str = "GT";

/// A parsed VCF row.
#[derive(Debug)]
struct ImportedRow {
    record: VariantRecord,
    calls: Vec<i8>,
}

/// `.vcf`, `.vcf.gz` and `.vcf.bgz` files directly under `dir`, sorted.
pub fn find_vcf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.file_name().map_or(false, |name| {
                    let name = name.to_string_lossy();
                    name.ends_with(".vcf") || name.ends_with(".vcf.gz") || name.ends_with(".vcf.bgz")
                })
        })
        .collect();
    if files.is_empty() {
        return Err(PipelineError::NoVcfFiles(dir.to_path_buf()));
    }
    files.sort();
    Ok(files)
}

/// Allele indices of a diploid GT string such as `0/1`, `1|2` or `./.`.
/// `None` for missing, partially missing or non-diploid calls.
fn parse_gt_alleles(gt: &str) -> Option<[usize; 2]> {
    let mut alleles = gt.split(['/', '|']);
    let (Some(a), Some(b), None) = (alleles.next(), alleles.next(), alleles.next()) else {
        return None;
    };
    Some([a.parse().ok()?, b.parse().ok()?])
}

/// Number of non-reference alleles in a diploid GT string. Anything that is
/// not a complete diploid call is missing.
pub fn parse_gt(gt: &str) -> i8 {
    parse_gt_alleles(gt).map_or(MISSING, |[a, b]| (a != 0) as i8 + (b != 0) as i8)
}

fn genotype_alleles(value: Option<Value<'_>>) -> Option<[usize; 2]> {
    match value? {
        Value::String(s) => parse_gt_alleles(s.as_ref()),
        Value::Genotype(genotype) => {
            let mut alleles = Vec::with_capacity(2);
            for allele in genotype.iter() {
                alleles.push(allele.ok()?.0);
            }
            match alleles.as_slice() {
                [Some(a), Some(b)] => Some([*a, *b]),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Dosage of allele `index` in a called genotype.
fn allele_dosage(call: Option<[usize; 2]>, index: usize) -> i8 {
    call.map_or(MISSING, |[a, b]| (a == index) as i8 + (b == index) as i8)
}

/// `PASS` and `.` mean the site passed; otherwise the semicolon-separated
/// filter names.
fn parse_filters(raw: &str) -> std::collections::BTreeSet<String> {
    match raw.trim() {
        "" | "." | "PASS" => Default::default(),
        other => other
            .split(';')
            .map(str::trim)
            .filter(|f| !f.is_empty() && *f != "PASS")
            .map(str::to_string)
            .collect(),
    }
}

fn read_single_vcf(path: &Path, samples: &[String], assembly: Assembly) -> Result<Vec<ImportedRow>> {
    debug!("Processing VCF: {}", path.display());
    let mut reader = vcf::io::reader::Builder::default().build_from_path(path)?;
    let header = reader.read_header()?;

    let names: Vec<&String> = header.sample_names().iter().collect();
    if names.len() != samples.len() || names.iter().zip(samples).any(|(a, b)| *a != b) {
        return Err(PipelineError::SampleMismatch {
            path: path.to_path_buf(),
            reason: format!(
                "expected {} samples (first: {:?}), found {} (first: {:?})",
                samples.len(),
                samples.iter().take(3).collect::<Vec<_>>(),
                names.len(),
                names.iter().take(3).collect::<Vec<_>>()
            ),
        });
    }
    let has_gt = header.formats().contains_key(GT);
    if !has_gt {
        warn!("{} has no FORMAT=GT header; all calls will be missing.", path.display());
    }

    let mut rows = Vec::new();
    let mut record = vcf::Record::default();
    while reader.read_record(&mut record)? != 0 {
        let position = match record.variant_start() {
            Some(Ok(p)) => p.get() as u64,
            _ => {
                warn!(
                    "{}: record on {} has no usable POS; skipped.",
                    path.display(),
                    record.reference_sequence_name()
                );
                continue;
            }
        };
        let contig = assembly.normalize_contig(record.reference_sequence_name());
        let reference = record.reference_bases().to_string();
        let alternate_bases = record.alternate_bases();
        let alternates: Vec<&str> = match alternate_bases.as_ref() {
            "." => Vec::new(),
            raw => raw.split(',').collect(),
        };

        let mut gts: Vec<Option<[usize; 2]>> = vec![None; samples.len()];
        if has_gt {
            if let Some(series) = record.samples().select(GT) {
                for (j, value) in series.iter(&header).enumerate().take(samples.len()) {
                    match value {
                        Ok(v) => gts[j] = genotype_alleles(v),
                        Err(e) => debug!("{}:{}: unparsable GT for sample #{}: {}", contig, position, j, e),
                    }
                }
            }
        }
        let filters = parse_filters(record.filters().as_ref());

        if alternates.is_empty() {
            let locus = Locus::new(contig, position, assembly);
            rows.push(ImportedRow {
                record: VariantRecord {
                    variant: Variant::new(locus, vec![reference]),
                    filters,
                },
                calls: gts.iter().map(|&call| allele_dosage(call, 1)).collect(),
            });
            continue;
        }
        // Multi-allelic sites become one biallelic row per ALT; each row
        // counts copies of its own ALT.
        for (a, alternate) in alternates.iter().enumerate() {
            let locus = Locus::new(contig.clone(), position, assembly);
            rows.push(ImportedRow {
                record: VariantRecord {
                    variant: Variant::biallelic(locus, reference.clone(), *alternate),
                    filters: filters.clone(),
                },
                calls: gts.iter().map(|&call| allele_dosage(call, a + 1)).collect(),
            });
        }
    }
    debug!("{}: {} records", path.display(), rows.len());
    Ok(rows)
}

/// Reads the per-sample metadata table: a header naming `s` and
/// `qc_metrics_filters`, then one tab-separated line per sample.
pub fn read_sample_metadata(path: &Path) -> Result<HashMap<String, SampleRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines().enumerate();

    let header = match lines.next() {
        Some((_, line)) => line?,
        None => return Err(PipelineError::parse(path, 1, "empty sample metadata file")),
    };
    let columns: Vec<&str> = header.trim_end().split('\t').collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| c.trim() == name)
            .ok_or_else(|| PipelineError::parse(path, 1, format!("missing column '{}'", name)))
    };
    let id_col = column("s")?;
    let filters_col = column("qc_metrics_filters")?;

    let mut samples = HashMap::new();
    for (idx, line) in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let id = fields
            .get(id_col)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::parse(path, idx + 1, "missing sample id"))?;
        let raw = fields.get(filters_col).copied().unwrap_or("");
        let failures = raw
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .map(|m| m.trim().trim_matches('"'))
            .filter(|m| !m.is_empty())
            .map(|m| m.parse::<QcMetric>().map_err(|e| PipelineError::parse(path, idx + 1, e)))
            .collect::<Result<Vec<_>>>()?;
        if samples
            .insert(id.to_string(), SampleRecord::with_failures(id, failures))
            .is_some()
        {
            return Err(PipelineError::parse(path, idx + 1, format!("duplicate sample '{}'", id)));
        }
    }
    info!("Read QC metadata for {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

/// Imports every VCF under `vcf_dir` into one matrix on `assembly`. All
/// files must list the same samples in the same order. Samples without a
/// metadata row are dropped.
pub fn import_reference(vcf_dir: &Path, sample_meta: &Path, assembly: Assembly) -> Result<GenotypeMatrix> {
    let files = find_vcf_files(vcf_dir)?;
    info!(
        "Found {} VCF file(s). Processing order (first 5): {:?}",
        files.len(),
        files.iter().take(5).collect::<Vec<_>>()
    );
    let metadata = read_sample_metadata(sample_meta)?;

    let mut first = vcf::io::reader::Builder::default().build_from_path(&files[0])?;
    let sample_names: Vec<String> = first.read_header()?.sample_names().iter().cloned().collect();
    info!(
        "Established sample set from {}: {} samples.",
        files[0].display(),
        sample_names.len()
    );

    let pb = progress::bar(files.len() as u64, "VCFs");
    let results: Vec<Result<Vec<ImportedRow>>> = files
        .par_iter()
        .map(|path| {
            let result = read_single_vcf(path, &sample_names, assembly);
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_with_message("VCF processing complete.");

    let mut rows = Vec::new();
    let mut first_error = None;
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(mut file_rows) => rows.append(&mut file_rows),
            Err(e) => {
                error!("Error processing VCF file {}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let keep: Vec<usize> = sample_names
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            let known = metadata.contains_key(*name);
            if !known {
                warn!("Sample {} has no QC metadata and is dropped.", name);
            }
            known
        })
        .map(|(j, _)| j)
        .collect();
    let samples: Vec<SampleRecord> = keep
        .iter()
        .filter_map(|&j| metadata.get(&sample_names[j]).cloned())
        .collect();

    rows.sort_by(|a, b| a.record.variant.cmp(&b.record.variant));
    let mut calls = Array2::<i8>::from_elem((rows.len(), samples.len()), MISSING);
    for (i, row) in rows.iter().enumerate() {
        for (out, &j) in keep.iter().enumerate() {
            calls[[i, out]] = row.calls[j];
        }
    }
    let variants = rows.into_iter().map(|row| row.record).collect();

    let matrix = GenotypeMatrix::new(assembly, variants, samples, calls)?;
    info!(
        "Imported reference matrix: {} variants x {} samples on {}.",
        matrix.n_variants(),
        matrix.n_samples(),
        assembly
    );
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VCF_HEADER: &str = "##fileformat=VCFv4.3\n\
##contig=<ID=1>\n\
##FILTER=<ID=LowQual,Description=\"low\">\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\ts3\n";

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn gt_strings() {
        assert_eq!(parse_gt("0/0"), 0);
        assert_eq!(parse_gt("0|1"), 1);
        assert_eq!(parse_gt("1/1"), 2);
        assert_eq!(parse_gt("1/2"), 2);
        assert_eq!(parse_gt("./."), MISSING);
        assert_eq!(parse_gt("0/."), MISSING);
        assert_eq!(parse_gt("1"), MISSING);
        assert_eq!(parse_gt("0/1/1"), MISSING);
    }

    #[test]
    fn multi_allelic_dosages_count_each_alt() {
        let het = parse_gt_alleles("1|2");
        assert_eq!(allele_dosage(het, 1), 1);
        assert_eq!(allele_dosage(het, 2), 1);
        let hom = parse_gt_alleles("2/2");
        assert_eq!(allele_dosage(hom, 1), 0);
        assert_eq!(allele_dosage(hom, 2), 2);
        assert_eq!(allele_dosage(parse_gt_alleles("./."), 1), MISSING);
    }

    #[test]
    fn filter_column() {
        assert!(parse_filters("PASS").is_empty());
        assert!(parse_filters(".").is_empty());
        let f = parse_filters("LowQual;q10");
        assert_eq!(f.len(), 2);
        assert!(f.contains("q10"));
    }

    #[test]
    fn sample_metadata_accepts_list_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "meta.tsv",
            "s\tpop\tqc_metrics_filters\n\
s1\tEUR\t[]\n\
s2\tAFR\t[\"n_snp\",\"r_ti_tv\"]\n\
s3\tEAS\tfail_n_deletion_residual\n",
        );
        let meta = read_sample_metadata(&path).unwrap();
        assert!(meta["s1"].qc_metrics_filters.is_empty());
        assert_eq!(meta["s2"].qc_metrics_filters.len(), 2);
        assert!(meta["s3"].qc_metrics_filters.contains(&QcMetric::NDeletion));

        let bad = write(dir.path(), "bad.tsv", "s\tqc_metrics_filters\ns1\tn_bogus\n");
        assert!(matches!(
            read_sample_metadata(&bad),
            Err(PipelineError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn imports_vcfs_into_a_sorted_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let vcfs = dir.path().join("vcfs");
        fs::create_dir(&vcfs).unwrap();
        write(
            &vcfs,
            "b.vcf",
            &format!("{}1\t300\t.\tC\tT,G\t.\tLowQual\t.\tGT\t1/2\t0/0\t./.\n", VCF_HEADER),
        );
        write(
            &vcfs,
            "a.vcf",
            &format!("{}1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/1\t1|1\t0/0\n", VCF_HEADER),
        );
        write(&vcfs, "notes.txt", "ignored");
        let meta = write(
            dir.path(),
            "meta.tsv",
            "s\tqc_metrics_filters\ns1\t\ns3\tn_snp\n",
        );

        let matrix = import_reference(&vcfs, &meta, Assembly::GRCh38).unwrap();
        assert_eq!(matrix.sample_ids(), vec!["s1", "s3"]);
        assert_eq!(matrix.n_variants(), 3);
        assert_eq!(matrix.variants()[0].variant.variant_str(), "chr1:100:A:G");
        assert!(matrix.variants()[0].is_pass());
        assert_eq!(matrix.row(0).to_vec(), vec![1, 0]);

        // C>T,G is split: s1 (1/2) carries one copy of each ALT.
        let split: Vec<String> = matrix.variants()[1..]
            .iter()
            .map(|r| r.variant.variant_str())
            .collect();
        assert_eq!(split, vec!["chr1:300:C:G", "chr1:300:C:T"]);
        assert!(matrix.variants()[1..].iter().all(|r| !r.is_pass() && r.variant.is_biallelic()));
        assert_eq!(matrix.row(1).to_vec(), vec![1, MISSING]);
        assert_eq!(matrix.row(2).to_vec(), vec![1, MISSING]);
        assert!(matrix.samples()[1].qc_metrics_filters.contains(&QcMetric::NSnp));
    }

    #[test]
    fn sample_order_must_agree_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.vcf", VCF_HEADER);
        write(
            dir.path(),
            "b.vcf",
            &VCF_HEADER.replace("s1\ts2\ts3", "s2\ts1\ts3"),
        );
        let meta = write(dir.path(), "meta.tsv", "s\tqc_metrics_filters\ns1\t\n");
        assert!(matches!(
            import_reference(dir.path(), &meta, Assembly::GRCh38),
            Err(PipelineError::SampleMismatch { .. })
        ));
    }

    #[test]
    fn empty_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(find_vcf_files(dir.path()), Err(PipelineError::NoVcfFiles(_))));
    }
}
