// panel.rs
//
// Target SNP panel: a whitespace-delimited table with a header naming the
// chromosome, position, reference and alternate allele columns.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{info, warn};

use crate::error::{PipelineError, Result};
use crate::types::{Assembly, Locus, Variant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelEntry {
    pub contig: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
}

#[derive(Clone, Debug)]
pub struct TargetPanel {
    assembly: Assembly,
    entries: Vec<PanelEntry>,
}

const CHROM_COLUMNS: [&str; 4] = ["chr", "chrom", "chromosome", "#chrom"];
const POS_COLUMNS: [&str; 3] = ["pos", "position", "bp"];
const REF_COLUMNS: [&str; 2] = ["ref", "a1"];
const ALT_COLUMNS: [&str; 2] = ["alt", "a2"];

impl TargetPanel {
    pub fn new(assembly: Assembly, entries: Vec<PanelEntry>) -> Self {
        Self { assembly, entries }
    }

    pub fn from_path(path: &Path, assembly: Assembly) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), path, assembly)
    }

    pub fn from_reader<R: BufRead>(reader: R, origin: &Path, assembly: Assembly) -> Result<Self> {
        let mut lines = reader.lines().enumerate();

        let header = loop {
            match lines.next() {
                Some((_, line)) => {
                    let line = line?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(Self::new(assembly, Vec::new())),
            }
        };
        let columns: Vec<String> = header
            .split_whitespace()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let find = |names: &[&str], what: &str| -> Result<usize> {
            columns
                .iter()
                .position(|c| names.contains(&c.as_str()))
                .ok_or_else(|| {
                    PipelineError::parse(origin, 1, format!("header has no {} column ({:?})", what, names))
                })
        };
        let chr_idx = find(&CHROM_COLUMNS, "chromosome")?;
        let pos_idx = find(&POS_COLUMNS, "position")?;
        let ref_idx = find(&REF_COLUMNS, "reference allele")?;
        let alt_idx = find(&ALT_COLUMNS, "alternate allele")?;
        let width = columns.len();

        let mut entries = Vec::new();
        for (line_idx, line) in lines {
            let line = line?;
            let line_no = line_idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < width {
                return Err(PipelineError::parse(
                    origin,
                    line_no,
                    format!("expected {} fields, found {}", width, fields.len()),
                ));
            }
            let position = fields[pos_idx].parse::<u64>().map_err(|e| {
                PipelineError::parse(origin, line_no, format!("bad position '{}': {}", fields[pos_idx], e))
            })?;
            if position == 0 {
                return Err(PipelineError::parse(origin, line_no, "positions are 1-based"));
            }
            entries.push(PanelEntry {
                contig: assembly.normalize_contig(fields[chr_idx]),
                position,
                reference: fields[ref_idx].to_ascii_uppercase(),
                alternate: fields[alt_idx].to_ascii_uppercase(),
            });
        }

        if entries.is_empty() {
            warn!("Target panel {} contains no entries.", origin.display());
        } else {
            info!(
                "Loaded {} target panel entries on {} from {}",
                entries.len(),
                assembly,
                origin.display()
            );
        }
        Ok(Self::new(assembly, entries))
    }

    pub fn assembly(&self) -> Assembly {
        self.assembly
    }

    pub fn entries(&self) -> &[PanelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variant keys in the panel's own assembly, `[ref, alt]` allele order.
    pub fn keys(&self) -> impl Iterator<Item = Variant> + '_ {
        self.entries.iter().map(move |e| {
            Variant::biallelic(
                Locus::new(e.contig.clone(), e.position, self.assembly),
                e.reference.clone(),
                e.alternate.clone(),
            )
        })
    }
}
