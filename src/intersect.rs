// intersect.rs
//
// Restricts the reference matrix to variants present in a target panel,
// lifting the panel onto the matrix's assembly first when needed.

use std::collections::HashSet;

use log::{debug, info};

use crate::error::{PipelineError, Result};
use crate::liftover::CoordinateMapper;
use crate::matrix::{GenotypeMatrix, GenotypeOps};
use crate::panel::TargetPanel;
use crate::types::{Assembly, Variant};

/// Panel keys expressed in `target` coordinates. Entries that fail to lift
/// are dropped.
pub fn panel_keys_on(
    panel: &TargetPanel,
    target: Assembly,
    liftover: Option<&dyn CoordinateMapper>,
) -> Result<HashSet<Variant>> {
    if panel.assembly() == target {
        return Ok(panel.keys().collect());
    }

    if !(panel.assembly() == Assembly::GRCh37 && target == Assembly::GRCh38) {
        return Err(PipelineError::UnsupportedLiftover {
            from: panel.assembly(),
            to: target,
        });
    }
    let mapper = liftover.ok_or(PipelineError::MissingLiftover {
        from: panel.assembly(),
        to: target,
    })?;
    if mapper.source() != panel.assembly() || mapper.target() != target {
        return Err(PipelineError::UnsupportedLiftover {
            from: mapper.source(),
            to: mapper.target(),
        });
    }

    let mut keys = HashSet::with_capacity(panel.len());
    let mut unmapped = 0usize;
    for key in panel.keys() {
        match mapper.lift_locus(&key.locus) {
            Some(locus) => {
                keys.insert(Variant::new(locus, key.alleles));
            }
            None => {
                debug!("Panel entry {} did not lift to {}; dropped.", key, target);
                unmapped += 1;
            }
        }
    }
    info!(
        "Liftover {}->{}: {} / {} panel entries mapped, {} unmapped and dropped.",
        panel.assembly(),
        target,
        panel.len() - unmapped,
        panel.len(),
        unmapped
    );
    Ok(keys)
}

/// Semi-join of the matrix against the panel. Panel entries with no matching
/// row are ignored. The result is sorted by locus.
pub fn intersect_with_panel(
    matrix: &GenotypeMatrix,
    panel: &TargetPanel,
    liftover: Option<&dyn CoordinateMapper>,
) -> Result<GenotypeMatrix> {
    let keys = panel_keys_on(panel, matrix.assembly(), liftover)?;
    let intersected = matrix.semi_join_rows(&keys).sorted_by_locus();
    info!(
        "Intersection: {} / {} reference variants found in the target panel ({} distinct panel keys).",
        intersected.n_variants(),
        matrix.n_variants(),
        keys.len()
    );
    Ok(intersected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liftover::ChainMap;
    use crate::matrix::tests::variant;
    use crate::panel::PanelEntry;
    use crate::types::SampleRecord;
    use ndarray::array;
    use std::path::Path;

    fn matrix() -> GenotypeMatrix {
        GenotypeMatrix::new(
            Assembly::GRCh38,
            vec![
                variant("chr1", 1065, "A", "G"),
                variant("chr1", 1065, "G", "A"),
                variant("chr1", 1000, "A", "G"),
                variant("chr2", 10, "C", "T"),
            ],
            vec![SampleRecord::new("a"), SampleRecord::new("b")],
            array![[0, 1], [1, 1], [2, 0], [0, 0]],
        )
        .unwrap()
    }

    fn entry(contig: &str, pos: u64, r: &str, a: &str) -> PanelEntry {
        PanelEntry {
            contig: contig.into(),
            position: pos,
            reference: r.into(),
            alternate: a.into(),
        }
    }

    fn chain() -> ChainMap {
        let text = "chain 1 chr1 10000 + 0 5000 chr1 10000 + 65 5065 1\n5000\n";
        ChainMap::from_reader(text.as_bytes(), Path::new("t"), Assembly::GRCh37, Assembly::GRCh38).unwrap()
    }

    #[test]
    fn direct_intersection_on_same_assembly() {
        let panel = TargetPanel::new(
            Assembly::GRCh38,
            vec![entry("chr1", 1000, "A", "G"), entry("chr3", 1, "A", "C")],
        );
        let out = intersect_with_panel(&matrix(), &panel, None).unwrap();
        assert_eq!(out.n_variants(), 1);
        assert_eq!(out.variants()[0].variant.variant_str(), "chr1:1000:A:G");
    }

    #[test]
    fn grch37_panel_matches_lifted_locus_with_original_allele_order() {
        let panel = TargetPanel::new(Assembly::GRCh37, vec![entry("chr1", 1000, "A", "G")]);
        let chain = chain();
        let out = intersect_with_panel(&matrix(), &panel, Some(&chain as &dyn CoordinateMapper)).unwrap();
        assert_eq!(out.n_variants(), 1);
        assert_eq!(out.variants()[0].variant.variant_str(), "chr1:1065:A:G");
        assert_eq!(out.row(0).to_vec(), vec![0, 1]);
    }

    #[test]
    fn unmapped_panel_entries_are_dropped_silently() {
        let panel = TargetPanel::new(
            Assembly::GRCh37,
            vec![entry("chr1", 1000, "A", "G"), entry("chr2", 10, "C", "T")],
        );
        let chain = chain();
        let keys = panel_keys_on(&panel, Assembly::GRCh38, Some(&chain as &dyn CoordinateMapper)).unwrap();
        assert_eq!(keys.len(), 1);
        let out = intersect_with_panel(&matrix(), &panel, Some(&chain as &dyn CoordinateMapper)).unwrap();
        assert!(out.variants().iter().all(|r| keys.contains(&r.variant)));
    }

    #[test]
    fn liftover_configuration_errors() {
        let panel = TargetPanel::new(Assembly::GRCh37, vec![entry("chr1", 1000, "A", "G")]);
        assert!(matches!(
            intersect_with_panel(&matrix(), &panel, None),
            Err(PipelineError::MissingLiftover { .. })
        ));

        let panel38 = TargetPanel::new(Assembly::GRCh38, vec![entry("chr1", 1000, "A", "G")]);
        assert!(matches!(
            panel_keys_on(&panel38, Assembly::GRCh37, None),
            Err(PipelineError::UnsupportedLiftover { .. })
        ));

        let backwards = chain().inverted();
        assert!(matches!(
            intersect_with_panel(&matrix(), &panel, Some(&backwards as &dyn CoordinateMapper)),
            Err(PipelineError::UnsupportedLiftover { .. })
        ));
    }
}
