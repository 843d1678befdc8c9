// types.rs
//
// Identity types shared by every stage: assemblies, loci, variants and the
// per-sample / per-variant QC annotations carried alongside the genotypes.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Genotype call encoding: number of non-reference alleles (0, 1, 2) or this
/// sentinel for a missing call. Matches the `bed-reader` i8 convention.
pub const MISSING: i8 = -127;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Assembly {
    GRCh37,
    GRCh38,
}

impl Assembly {
    /// Puts a contig name into the naming convention of this assembly.
    /// GRCh38 contigs always carry the `chr` prefix; GRCh37 names are kept
    /// as given since both conventions circulate for that build.
    pub fn normalize_contig(&self, contig: &str) -> String {
        match self {
            Assembly::GRCh38 => {
                if contig.starts_with("chr") {
                    contig.to_string()
                } else if contig == "MT" {
                    "chrM".to_string()
                } else {
                    format!("chr{}", contig)
                }
            }
            Assembly::GRCh37 => contig.to_string(),
        }
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assembly::GRCh37 => write!(f, "GRCh37"),
            Assembly::GRCh38 => write!(f, "GRCh38"),
        }
    }
}

impl FromStr for Assembly {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grch37" => Ok(Assembly::GRCh37),
            "grch38" => Ok(Assembly::GRCh38),
            _ => Err(PipelineError::InvalidAssembly(s.to_string())),
        }
    }
}

/// Sort rank of a contig: autosomes numerically, then X, Y, M, then anything
/// else lexically.
pub fn contig_rank(contig: &str) -> u32 {
    let bare = contig.strip_prefix("chr").unwrap_or(contig);
    match bare {
        "X" => 23,
        "Y" => 24,
        "M" | "MT" => 25,
        _ => bare.parse::<u32>().unwrap_or(1000),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locus {
    pub contig: String,
    /// 1-based position.
    pub position: u64,
    pub assembly: Assembly,
}

impl Locus {
    pub fn new(contig: impl Into<String>, position: u64, assembly: Assembly) -> Self {
        Self {
            contig: contig.into(),
            position,
            assembly,
        }
    }
}

impl Ord for Locus {
    fn cmp(&self, other: &Self) -> Ordering {
        contig_rank(&self.contig)
            .cmp(&contig_rank(&other.contig))
            .then_with(|| self.contig.cmp(&other.contig))
            .then_with(|| self.position.cmp(&other.position))
            .then_with(|| self.assembly.cmp(&other.assembly))
    }
}

impl PartialOrd for Locus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contig, self.position)
    }
}

/// A variant key: locus plus ordered alleles, reference first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variant {
    pub locus: Locus,
    pub alleles: Vec<String>,
}

impl Variant {
    pub fn new(locus: Locus, alleles: Vec<String>) -> Self {
        Self { locus, alleles }
    }

    pub fn biallelic(locus: Locus, reference: impl Into<String>, alternate: impl Into<String>) -> Self {
        Self {
            locus,
            alleles: vec![reference.into(), alternate.into()],
        }
    }

    pub fn is_biallelic(&self) -> bool {
        self.alleles.len() == 2
    }

    pub fn reference(&self) -> &str {
        self.alleles.first().map(String::as_str).unwrap_or("")
    }

    /// First alternate allele.
    pub fn alternate(&self) -> &str {
        self.alleles.get(1).map(String::as_str).unwrap_or("")
    }

    /// Canonical `contig:pos:ref:alt[,alt...]` identifier.
    pub fn variant_str(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.locus.contig,
            self.locus.position,
            self.reference(),
            self.alleles.get(1..).map(|alts| alts.join(",")).unwrap_or_default()
        )
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.variant_str())
    }
}

/// Sample quality metrics whose outlier status is recorded per sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcMetric {
    NSnp,
    RTiTv,
    RInsertionDeletion,
    NInsertion,
    NDeletion,
    RHetHomVar,
    NTransition,
    NTransversion,
}

impl QcMetric {
    pub const ALL: [QcMetric; 8] = [
        QcMetric::NSnp,
        QcMetric::RTiTv,
        QcMetric::RInsertionDeletion,
        QcMetric::NInsertion,
        QcMetric::NDeletion,
        QcMetric::RHetHomVar,
        QcMetric::NTransition,
        QcMetric::NTransversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QcMetric::NSnp => "n_snp",
            QcMetric::RTiTv => "r_ti_tv",
            QcMetric::RInsertionDeletion => "r_insertion_deletion",
            QcMetric::NInsertion => "n_insertion",
            QcMetric::NDeletion => "n_deletion",
            QcMetric::RHetHomVar => "r_het_hom_var",
            QcMetric::NTransition => "n_transition",
            QcMetric::NTransversion => "n_transversion",
        }
    }
}

impl fmt::Display for QcMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QcMetric {
    type Err = String;

    /// Accepts `n_snp`, `fail_n_snp`, `n_snp_residual` and `fail_n_snp_residual`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed.strip_prefix("fail_").unwrap_or(trimmed);
        let bare = bare.strip_suffix("_residual").unwrap_or(bare);
        QcMetric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == bare)
            .ok_or_else(|| format!("unrecognized QC metric '{}'", s))
    }
}

/// A reference sample and its failed QC metrics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: String,
    #[serde(default)]
    pub qc_metrics_filters: BTreeSet<QcMetric>,
}

impl SampleRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            qc_metrics_filters: BTreeSet::new(),
        }
    }

    pub fn with_failures(id: impl Into<String>, failures: impl IntoIterator<Item = QcMetric>) -> Self {
        Self {
            id: id.into(),
            qc_metrics_filters: failures.into_iter().collect(),
        }
    }
}

/// A matrix row: the variant and the site-level filters it failed
/// (empty means the site passed).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub variant: Variant,
    #[serde(default)]
    pub filters: BTreeSet<String>,
}

impl VariantRecord {
    pub fn passing(variant: Variant) -> Self {
        Self {
            variant,
            filters: BTreeSet::new(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.filters.is_empty()
    }
}
