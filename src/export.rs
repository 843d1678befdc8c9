// export.rs
//
// Text outputs of a PCA result: scores, loadings, eigenvalues and the
// PLINK-style loadings/frequency pair keyed by the canonical variant string.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::Result;
use crate::pca::PcaResult;

/// Writes through `fill` into a sibling temporary file and renames it over
/// `path` once everything has been flushed.
pub(crate) fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let written = File::create(&tmp).and_then(|file| {
        let mut writer = BufWriter::new(file);
        fill(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// `<prefix><suffix>`; a prefix ending in a path separator names a directory.
pub fn output_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, suffix))
}

fn write_pc_header(writer: &mut impl Write, k: usize) -> std::io::Result<()> {
    for i in 1..=k {
        write!(writer, "\tPC{}", i)?;
    }
    Ok(())
}

fn write_row_values<'a>(writer: &mut impl Write, values: impl IntoIterator<Item = &'a f64>) -> std::io::Result<()> {
    for v in values {
        write!(writer, "\t{}", v)?;
    }
    Ok(())
}

/// `s`, PC1..PCk; one line per sample.
pub fn write_scores(result: &PcaResult, path: &Path) -> Result<()> {
    info!("Writing PCA scores to {}", path.display());
    write_atomic(path, |w| {
        write!(w, "s")?;
        write_pc_header(w, result.k())?;
        writeln!(w)?;
        for (sample, row) in result.samples.iter().zip(result.scores.rows()) {
            write!(w, "{}", sample)?;
            write_row_values(w, row.iter())?;
            writeln!(w)?;
        }
        Ok(())
    })
}

/// `locus`, `alleles`, PC1..PCk, `pca_af`; one line per variant.
pub fn write_loadings(result: &PcaResult, path: &Path) -> Result<()> {
    info!("Writing variant loadings to {}", path.display());
    let alleles = result
        .variants
        .iter()
        .map(|v| serde_json::to_string(&v.alleles))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    write_atomic(path, |w| {
        write!(w, "locus\talleles")?;
        write_pc_header(w, result.k())?;
        writeln!(w, "\tpca_af")?;
        for (i, variant) in result.variants.iter().enumerate() {
            write!(w, "{}\t{}", variant.locus, alleles[i])?;
            write_row_values(w, result.loadings.row(i).iter())?;
            writeln!(w, "\t{}", result.pca_af[i])?;
        }
        Ok(())
    })
}

/// PLINK `--score` style loadings: `ID`, `ALT`, PC1..PCk.
pub fn write_plink_loadings(result: &PcaResult, path: &Path) -> Result<()> {
    info!("Writing PLINK loadings to {}", path.display());
    write_atomic(path, |w| {
        write!(w, "ID\tALT")?;
        write_pc_header(w, result.k())?;
        writeln!(w)?;
        for (i, variant) in result.variants.iter().enumerate() {
            write!(w, "{}\t{}", variant.variant_str(), variant.alternate())?;
            write_row_values(w, result.loadings.row(i).iter())?;
            writeln!(w)?;
        }
        Ok(())
    })
}

/// PLINK `.afreq` companion: `#ID`, `REF`, `ALT`, `ALT1_FREQ`.
pub fn write_plink_afreq(result: &PcaResult, path: &Path) -> Result<()> {
    info!("Writing PLINK allele frequencies to {}", path.display());
    write_atomic(path, |w| {
        writeln!(w, "#ID\tREF\tALT\tALT1_FREQ")?;
        for (variant, af) in result.variants.iter().zip(&result.pca_af) {
            writeln!(
                w,
                "{}\t{}\t{}\t{}",
                variant.variant_str(),
                variant.reference(),
                variant.alternate(),
                af
            )?;
        }
        Ok(())
    })
}

pub fn write_eigenvalues(result: &PcaResult, path: &Path) -> Result<()> {
    info!("Writing eigenvalues to {}", path.display());
    write_atomic(path, |w| {
        writeln!(w, "PC\teigenvalue")?;
        for (i, value) in result.eigenvalues.iter().enumerate() {
            writeln!(w, "PC{}\t{}", i + 1, value)?;
        }
        Ok(())
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportPaths {
    pub scores: PathBuf,
    pub loadings: PathBuf,
    pub plink_loadings: PathBuf,
    pub plink_afreq: PathBuf,
    pub eigenvalues: PathBuf,
}

impl ExportPaths {
    pub fn for_prefix(prefix: &str) -> Self {
        Self {
            scores: output_path(prefix, "scores.tsv"),
            loadings: output_path(prefix, "loadings.tsv"),
            plink_loadings: output_path(prefix, "loadings.plink.tsv"),
            plink_afreq: output_path(prefix, "loadings.plink.afreq"),
            eigenvalues: output_path(prefix, "eigenvalues.tsv"),
        }
    }
}

/// Writes every text output for `result` under `prefix`.
pub fn export_all(result: &PcaResult, prefix: &str) -> Result<ExportPaths> {
    result.validate()?;
    let paths = ExportPaths::for_prefix(prefix);
    write_scores(result, &paths.scores)?;
    write_loadings(result, &paths.loadings)?;
    write_plink_loadings(result, &paths.plink_loadings)?;
    write_plink_afreq(result, &paths.plink_afreq)?;
    write_eigenvalues(result, &paths.eigenvalues)?;
    Ok(paths)
}
