// liftover.rs
//
// Coordinate liftover over a UCSC chain alignment. The chain is loaded once
// into an immutable per-contig block index; lookups are pure.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::{debug, info};

use crate::error::{PipelineError, Result};
use crate::types::{Assembly, Locus};

/// Maps loci between two assemblies. `None` means unmapped: the position is
/// outside every aligned block, or it lands in more than one place.
pub trait CoordinateMapper: Send + Sync {
    fn source(&self) -> Assembly;
    fn target(&self) -> Assembly;

    /// `position` is 1-based in the source assembly.
    fn lift(&self, contig: &str, position: u64) -> Option<(String, u64)>;

    fn lift_locus(&self, locus: &Locus) -> Option<Locus> {
        if locus.assembly != self.source() {
            return None;
        }
        let (contig, position) = self.lift(&locus.contig, locus.position)?;
        let target = self.target();
        Some(Locus::new(target.normalize_contig(&contig), position, target))
    }
}

/// One ungapped aligned block.
#[derive(Clone, Copy, Debug)]
struct Block {
    /// 0-based start on the source contig.
    source_start: u64,
    len: u64,
    target_contig: usize,
    /// 0-based forward-strand start of the aligned target interval.
    target_start: u64,
    reverse: bool,
}

impl Block {
    fn contains(&self, pos0: u64) -> bool {
        pos0 >= self.source_start && pos0 < self.source_start + self.len
    }

    fn map(&self, pos0: u64) -> u64 {
        let offset = pos0 - self.source_start;
        if self.reverse {
            self.target_start + self.len - 1 - offset
        } else {
            self.target_start + offset
        }
    }
}

#[derive(Debug, Default)]
struct ContigBlocks {
    /// Sorted by `source_start`.
    blocks: Vec<Block>,
    max_len: u64,
}

#[derive(Debug)]
pub struct ChainMap {
    source: Assembly,
    target: Assembly,
    target_contigs: Vec<String>,
    by_source_contig: HashMap<String, ContigBlocks>,
}

impl ChainMap {
    pub fn from_path(path: &Path, source: Assembly, target: Assembly) -> Result<Self> {
        info!(
            "Loading {}->{} liftover chain from {}",
            source,
            target,
            path.display()
        );
        let file = File::open(path)?;
        let is_gz = path
            .extension()
            .map_or(false, |ext| ext == "gz" || ext == "bgz");
        if is_gz {
            Self::from_reader(BufReader::new(MultiGzDecoder::new(file)), path, source, target)
        } else {
            Self::from_reader(BufReader::new(file), path, source, target)
        }
    }

    /// Parses UCSC chain text. `origin` is only used in error messages.
    pub fn from_reader<R: BufRead>(
        reader: R,
        origin: &Path,
        source: Assembly,
        target: Assembly,
    ) -> Result<Self> {
        struct OpenChain {
            source_contig: String,
            target_contig: usize,
            target_size: u64,
            reverse: bool,
            t_pos: u64,
            q_pos: u64,
        }

        let mut target_contigs: Vec<String> = Vec::new();
        let mut target_index: HashMap<String, usize> = HashMap::new();
        let mut raw: HashMap<String, Vec<Block>> = HashMap::new();
        let mut open: Option<OpenChain> = None;
        let mut n_chains = 0usize;

        for (line_idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = line_idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            let num = |s: &str| -> Result<u64> {
                s.parse::<u64>().map_err(|e| {
                    PipelineError::parse(origin, line_no, format!("bad integer '{}': {}", s, e))
                })
            };

            if fields[0] == "chain" {
                if open.is_some() {
                    return Err(PipelineError::parse(
                        origin,
                        line_no,
                        "new chain header before the previous chain's final block",
                    ));
                }
                if fields.len() < 12 {
                    return Err(PipelineError::parse(
                        origin,
                        line_no,
                        format!("chain header has {} fields, expected at least 12", fields.len()),
                    ));
                }
                if fields[4] != "+" {
                    return Err(PipelineError::parse(
                        origin,
                        line_no,
                        "reference strand must be '+'",
                    ));
                }
                let reverse = match fields[9] {
                    "+" => false,
                    "-" => true,
                    other => {
                        return Err(PipelineError::parse(
                            origin,
                            line_no,
                            format!("bad query strand '{}'", other),
                        ))
                    }
                };
                let q_name = fields[7].to_string();
                let target_contig = *target_index.entry(q_name.clone()).or_insert_with(|| {
                    target_contigs.push(q_name);
                    target_contigs.len() - 1
                });
                open = Some(OpenChain {
                    source_contig: fields[2].to_string(),
                    target_contig,
                    target_size: num(fields[8])?,
                    reverse,
                    t_pos: num(fields[5])?,
                    q_pos: num(fields[10])?,
                });
                n_chains += 1;
                continue;
            }

            let chain = open.as_mut().ok_or_else(|| {
                PipelineError::parse(origin, line_no, "alignment data outside of a chain")
            })?;
            let size = num(fields[0])?;
            let target_start = if chain.reverse {
                chain
                    .target_size
                    .checked_sub(chain.q_pos + size)
                    .ok_or_else(|| {
                        PipelineError::parse(origin, line_no, "block runs past the query contig")
                    })?
            } else {
                chain.q_pos
            };
            raw.entry(chain.source_contig.clone()).or_default().push(Block {
                source_start: chain.t_pos,
                len: size,
                target_contig: chain.target_contig,
                target_start,
                reverse: chain.reverse,
            });

            match fields.len() {
                3 => {
                    chain.t_pos += size + num(fields[1])?;
                    chain.q_pos += size + num(fields[2])?;
                }
                1 => open = None,
                n => {
                    return Err(PipelineError::parse(
                        origin,
                        line_no,
                        format!("alignment line has {} fields, expected 1 or 3", n),
                    ))
                }
            }
        }

        if open.is_some() {
            return Err(PipelineError::parse(
                origin,
                0,
                "chain file ended before the last chain's final block",
            ));
        }

        let map = Self::index(source, target, target_contigs, raw);
        info!(
            "Liftover chain loaded: {} chains, {} aligned blocks over {} source contigs.",
            n_chains,
            map.n_blocks(),
            map.by_source_contig.len()
        );
        Ok(map)
    }

    fn index(
        source: Assembly,
        target: Assembly,
        target_contigs: Vec<String>,
        raw: HashMap<String, Vec<Block>>,
    ) -> Self {
        let by_source_contig = raw
            .into_iter()
            .map(|(contig, mut blocks)| {
                blocks.sort_by_key(|b| b.source_start);
                let max_len = blocks.iter().map(|b| b.len).max().unwrap_or(0);
                (contig, ContigBlocks { blocks, max_len })
            })
            .collect();
        Self {
            source,
            target,
            target_contigs,
            by_source_contig,
        }
    }

    pub fn n_blocks(&self) -> usize {
        self.by_source_contig.values().map(|c| c.blocks.len()).sum()
    }

    /// The same alignment read in the opposite direction.
    pub fn inverted(&self) -> Self {
        let mut source_contigs: Vec<String> = Vec::new();
        let mut source_index: HashMap<&str, usize> = HashMap::new();
        let mut raw: HashMap<String, Vec<Block>> = HashMap::new();

        for (contig, contig_blocks) in &self.by_source_contig {
            let new_target = *source_index.entry(contig.as_str()).or_insert_with(|| {
                source_contigs.push(contig.clone());
                source_contigs.len() - 1
            });
            for block in &contig_blocks.blocks {
                raw.entry(self.target_contigs[block.target_contig].clone())
                    .or_default()
                    .push(Block {
                        source_start: block.target_start,
                        len: block.len,
                        target_contig: new_target,
                        target_start: block.source_start,
                        reverse: block.reverse,
                    });
            }
        }
        Self::index(self.target, self.source, source_contigs, raw)
    }

    fn blocks_for(&self, contig: &str) -> Option<&ContigBlocks> {
        self.by_source_contig.get(contig).or_else(|| {
            let toggled = match contig {
                "chrM" => "MT".to_string(),
                "MT" => "chrM".to_string(),
                _ => match contig.strip_prefix("chr") {
                    Some(bare) => bare.to_string(),
                    None => format!("chr{}", contig),
                },
            };
            self.by_source_contig.get(&toggled)
        })
    }
}

impl CoordinateMapper for ChainMap {
    fn source(&self) -> Assembly {
        self.source
    }

    fn target(&self) -> Assembly {
        self.target
    }

    fn lift(&self, contig: &str, position: u64) -> Option<(String, u64)> {
        if position == 0 {
            return None;
        }
        let pos0 = position - 1;
        let contig_blocks = self.blocks_for(contig)?;
        let blocks = &contig_blocks.blocks;

        // Blocks may overlap across chains; scan back from the last block
        // starting at or before pos0 as far as the longest block reaches.
        let end = blocks.partition_point(|b| b.source_start <= pos0);
        let mut hit: Option<(usize, u64)> = None;
        for block in blocks[..end].iter().rev() {
            if block.source_start + contig_blocks.max_len <= pos0 {
                break;
            }
            if !block.contains(pos0) {
                continue;
            }
            let mapped = (block.target_contig, block.map(pos0));
            match hit {
                None => hit = Some(mapped),
                Some(prev) if prev == mapped => {}
                Some(_) => {
                    debug!("{}:{} maps to multiple targets; treating as unmapped", contig, position);
                    return None;
                }
            }
        }
        hit.map(|(c, p0)| (self.target_contigs[c].clone(), p0 + 1))
    }
}
