//! Reading trees and metadata, writing result tables.
//!
//! Input trees are plain Newick files (optionally gzip-compressed). The
//! metadata table is tab-separated with a header row; parsing is
//! intersection-friendly: rows that cannot be interpreted are logged and
//! skipped, never fatal.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use phylotree::tree::Tree;

use crate::cut::{CandidateSplit, GenotypeMatrix, ReferenceTips};
use crate::error::{Error, Result};
use crate::meta::{categorize_pair, Cohort, DiseaseType, SampleMeta, SampleRecord};
use crate::sharing::{day_delta_bucket, PersistKey, ResultAggregator};

/// Read one Newick tree from a file; `.gz` paths are decompressed.
pub fn read_newick_file<P: AsRef<Path>>(path: P) -> Result<Tree> {
    let p = path.as_ref();
    let content = if p.to_string_lossy().ends_with(".gz") {
        let file = File::open(p).map_err(|e| Error::io(e, p))?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut s = String::new();
        decoder.read_to_string(&mut s).map_err(|e| Error::io(e, p))?;
        s
    } else {
        fs::read_to_string(p).map_err(|e| Error::io(e, p))?
    };

    Tree::from_newick(content.trim()).map_err(|e| Error::Newick {
        path: p.to_path_buf(),
        message: e.to_string(),
    })
}

/// Read a list of tree file paths, one per line, blank lines ignored.
pub fn read_path_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let p = path.as_ref();
    let content = fs::read_to_string(p).map_err(|e| Error::io(e, p))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// Parse the metadata table from its TSV content.
///
/// Required columns: ID, Cohort, individual, Day, Disease type. The donor
/// column is optional. Rows with unknown cohorts or disease types, or
/// unparsable days, are skipped with a warning; the first occurrence of a
/// duplicated sample id wins.
pub fn parse_metadata(content: &str) -> Result<SampleMeta> {
    let mut lines = content.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::Metadata("empty metadata file".to_string()))?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let find = |name: &'static str| -> Result<usize> {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or(Error::MissingColumn(name))
    };
    let id_col = find("ID")?;
    let cohort_col = find("Cohort")?;
    let individual_col = find("individual")?;
    let day_col = find("Day")?;
    let disease_col = find("Disease type")?;
    let donor_col = columns.iter().position(|c| *c == "donor");

    let mut rows = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let field = |idx: usize| fields.get(idx).copied().unwrap_or("");

        let id = field(id_col);
        if id.is_empty() {
            continue;
        }
        let Some(cohort) = Cohort::parse(field(cohort_col)) else {
            warn!(
                "metadata line {}: unknown cohort '{}', skipping {id}",
                lineno + 2,
                field(cohort_col)
            );
            continue;
        };
        let Some(disease) = DiseaseType::parse(field(disease_col)) else {
            warn!(
                "metadata line {}: unknown disease type '{}', skipping {id}",
                lineno + 2,
                field(disease_col)
            );
            continue;
        };
        let day_text = field(day_col);
        let day = match day_text.parse::<i64>() {
            Ok(d) => d,
            Err(_) => match day_text.parse::<f64>() {
                Ok(d) => d as i64,
                Err(_) => {
                    warn!(
                        "metadata line {}: unparsable day '{day_text}', skipping {id}",
                        lineno + 2
                    );
                    continue;
                }
            },
        };
        let donor = donor_col
            .map(|c| field(c))
            .filter(|d| !d.is_empty() && *d != "NA")
            .map(str::to_string);

        rows.push((
            id.to_string(),
            SampleRecord {
                cohort,
                individual: field(individual_col).to_string(),
                day,
                disease,
                donor,
            },
        ));
    }
    Ok(SampleMeta::from_records(rows))
}

/// Read the metadata TSV from a file.
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<SampleMeta> {
    let p = path.as_ref();
    let content = fs::read_to_string(p).map_err(|e| Error::io(e, p))?;
    parse_metadata(&content)
}

/// Open an output file for writing; `.gz` paths are gzip-compressed.
pub fn open_output<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn Write>> {
    let p = path.as_ref();
    let is_gz = p.to_string_lossy().ends_with(".gz");
    let file = File::create(p)?;
    if is_gz {
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Box::new(BufWriter::new(encoder)))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// One cut-search output line: tree id, p-values, node name, compact-JSON
/// tables and group memberships. `None` yields the NA sentinel row, never an
/// omitted row.
pub fn cut_record_line(tree_id: &str, best: Option<&CandidateSplit>) -> String {
    match best {
        Some(split) => {
            let d_h = serde_json::to_string(&split.disease_counts).unwrap_or_default();
            let d_c = serde_json::to_string(&split.cohort_counts).unwrap_or_default();
            let ingroup = serde_json::to_string(&split.ingroup).unwrap_or_default();
            let outgroup = serde_json::to_string(&split.outgroup).unwrap_or_default();
            format!(
                "{tree_id}\t{}\t{}\t{}\t{}\t{d_h}\t{d_c}\t{ingroup}\t{outgroup}",
                split.cmh.p_value(),
                split.health_fisher,
                split.cohort_fisher,
                split.node_name,
            )
        }
        None => format!("{tree_id}\tNA\tNA\tNA\tNA\tNA\tNA\tNA\tNA"),
    }
}

/// Sorted `|`-join of a metadata field over the two samples of a pair.
fn joined_field(a: Option<&str>, b: Option<&str>) -> String {
    let mut values = [a.unwrap_or(""), b.unwrap_or("")];
    values.sort();
    values.join("|")
}

/// Write the strain-sharing table: one row per sample pair, sorted for
/// deterministic output.
pub fn write_sharing_table(
    out: &mut dyn Write,
    aggregated: &ResultAggregator,
    meta: &SampleMeta,
) -> io::Result<()> {
    writeln!(
        out,
        "sample1\tsample2\tcategory\tdonor\tindividual\tDisease type\t\
         trees_observed\ttrees_shared\tsharing_rate\tmean_distance"
    )?;

    let ordered: BTreeMap<_, _> = aggregated.pairs.iter().collect();
    for ((sample1, sample2), stats) in ordered {
        let (r1, r2) = (meta.get(sample1), meta.get(sample2));
        let category = match (r1, r2) {
            (Some(a), Some(b)) => categorize_pair(a, b).label(),
            _ => "other",
        };
        let donor = joined_field(
            r1.and_then(|r| r.donor.as_deref()),
            r2.and_then(|r| r.donor.as_deref()),
        );
        let individual = joined_field(
            r1.map(|r| r.individual.as_str()),
            r2.map(|r| r.individual.as_str()),
        );
        let disease = joined_field(r1.map(|r| r.disease.name()), r2.map(|r| r.disease.name()));
        writeln!(
            out,
            "{sample1}\t{sample2}\t{category}\t{donor}\t{individual}\t{disease}\t{}\t{}\t{}\t{}",
            stats.trees_observed,
            stats.trees_shared,
            stats.sharing_rate(),
            stats.mean_distance(),
        )?;
    }
    out.flush()
}

/// Write the persistence table: one row per (tree, cohort, individual,
/// day pair), with the power-of-two day-delta bucket and the shared flag.
pub fn write_persistence_table(
    out: &mut dyn Write,
    per_tree: &[(String, BTreeMap<PersistKey, f64>)],
    threshold: f64,
) -> io::Result<()> {
    writeln!(
        out,
        "tree\tcohort\tindividual\tday1\tday2\tdelta_bucket\tmin_distance\tshared"
    )?;
    for (tree_id, minima) in per_tree {
        for (key, distance) in minima {
            let delta = key.day_hi - key.day_lo;
            if delta < 1 {
                continue;
            }
            writeln!(
                out,
                "{tree_id}\t{}\t{}\t{}\t{}\t{}\t{distance}\t{}",
                key.cohort.name(),
                key.individual,
                key.day_lo,
                key.day_hi,
                day_delta_bucket(delta),
                u8::from(*distance <= threshold),
            )?;
        }
    }
    out.flush()
}

/// A parsed row of a cut-search output table, as consumed by the post-hoc
/// reference and genotype steps. NA sentinel rows parse with
/// `disease_counts = None` and empty group lists.
#[derive(Clone, Debug)]
pub struct CutRow {
    pub tree_path: String,
    pub cmh: String,
    pub node_name: String,
    pub disease_counts: Option<[[u64; 2]; 2]>,
    pub ingroup: Vec<String>,
    pub outgroup: Vec<String>,
}

/// Read a cut-search output table back in.
pub fn read_cut_rows<P: AsRef<Path>>(path: P) -> Result<Vec<CutRow>> {
    let p = path.as_ref();
    let content = fs::read_to_string(p).map_err(|e| Error::io(e, p))?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 9 {
                warn!("cut table row with {} fields, skipping", fields.len());
                return None;
            }
            Some(CutRow {
                tree_path: fields[0].to_string(),
                cmh: fields[1].to_string(),
                node_name: fields[4].to_string(),
                disease_counts: serde_json::from_str(fields[5]).ok(),
                ingroup: serde_json::from_str(fields[7]).unwrap_or_default(),
                outgroup: serde_json::from_str(fields[8]).unwrap_or_default(),
            })
        })
        .collect())
}

/// Species name encoded in a tree path laid out as `<batch>/<species>/<file>`;
/// paths without a second component fall back to the whole path.
pub fn species_from_path(tree_path: &str) -> &str {
    tree_path.split('/').nth(1).unwrap_or(tree_path)
}

/// Write the genotype feature table: species rows, sample columns, `-` for
/// cells no split assigned.
pub fn write_genotype_table(out: &mut dyn Write, matrix: &GenotypeMatrix) -> io::Result<()> {
    let samples: Vec<&String> = matrix.samples().collect();
    for sample in &samples {
        write!(out, "\t{sample}")?;
    }
    writeln!(out)?;

    for (species, row) in matrix.species() {
        write!(out, "{species}")?;
        for sample in &samples {
            match row.get(*sample) {
                Some(geno) => write!(out, "\t{geno}")?,
                None => write!(out, "\t-")?,
            }
        }
        writeln!(out)?;
    }
    out.flush()
}

/// One reference-lookup output line; `None` yields the NA sentinel.
pub fn reference_line(row: &CutRow, tips: Option<&ReferenceTips>) -> String {
    match tips {
        Some(t) => format!(
            "{}\t{}\t{}\t{}\t{}",
            row.tree_path,
            row.cmh,
            row.node_name,
            t.healthy_side.join(","),
            t.diseased_side.join(","),
        ),
        None => format!("{}\t{}\tNA\tNA", row.tree_path, row.node_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DiseaseCode;

    const META: &str = "ID\tCohort\tindividual\tDay\tDisease type\tdonor\n\
        S1\trCDI\tp1\t0\tbefore_FMT\tD1\n\
        S2\trCDI\tp1\t30\tresponder\tD1\n\
        S3\tIBS\td2\t0\thealthy\t\n\
        S4\tMars\tp9\t0\thealthy\t\n\
        S5\tLUAD\tp2\tsoon\tnon-responder\tD7\n\
        S1\tMEL\tzz\t9\thealthy\t\n";

    #[test]
    fn metadata_parsing_drops_bad_rows_and_keeps_first_duplicate() {
        let meta = parse_metadata(META).unwrap();
        // S4 (unknown cohort) and S5 (unparsable day) are dropped; the
        // duplicate S1 keeps its first row.
        assert_eq!(meta.len(), 3);
        let s1 = meta.get("S1").unwrap();
        assert_eq!(s1.cohort, Cohort::Rcdi);
        assert_eq!(s1.disease, DiseaseType::BeforeFmt);
        assert_eq!(s1.disease.code(), DiseaseCode::Diseased);
        assert_eq!(s1.donor.as_deref(), Some("D1"));
        assert_eq!(meta.get("S3").unwrap().donor, None);
    }

    #[test]
    fn metadata_requires_the_id_column() {
        let err = parse_metadata("Cohort\tindividual\tDay\tDisease type\nx\ty\t0\thealthy\n");
        assert!(matches!(err, Err(Error::MissingColumn("ID"))));
    }

    #[test]
    fn cut_record_lines_are_tab_separated_with_compact_json() {
        use crate::stats::TestOutcome;
        let split = CandidateSplit {
            cmh: TestOutcome::PValue(0.01),
            health_fisher: 0.02,
            cohort_fisher: 0.5,
            node_name: "n1".to_string(),
            disease_counts: [[2, 0], [0, 2]],
            cohort_counts: [[2, 0, 0, 0], [2, 0, 0, 0]],
            ingroup: vec!["A".to_string(), "B".to_string()],
            outgroup: vec!["C".to_string(), "D".to_string()],
        };
        let line = cut_record_line("trees/species_x/uscg.nwk", Some(&split));
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[4], "n1");
        assert_eq!(fields[5], "[[2,0],[0,2]]");
        assert_eq!(fields[7], "[\"A\",\"B\"]");
        assert!(!fields[5].contains(' '));

        let na = cut_record_line("trees/species_y/uscg.nwk", None);
        assert_eq!(na.split('\t').count(), 9);
        assert!(na.ends_with("NA"));
    }

    #[test]
    fn cut_rows_round_trip_through_the_table() {
        use crate::stats::TestOutcome;
        let split = CandidateSplit {
            cmh: TestOutcome::Inconclusive,
            health_fisher: 0.02,
            cohort_fisher: 0.5,
            node_name: "n7".to_string(),
            disease_counts: [[1, 3], [4, 2]],
            cohort_counts: [[1, 1, 1, 1], [1, 1, 2, 2]],
            ingroup: vec!["A".to_string()],
            outgroup: vec!["B".to_string()],
        };
        let table = format!(
            "{}\n{}\n",
            cut_record_line("t1.nwk", Some(&split)),
            cut_record_line("t2.nwk", None)
        );
        let dir = std::env::temp_dir().join(format!("cutrows-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cuts.tsv");
        fs::write(&path, table).unwrap();

        let rows = read_cut_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_name, "n7");
        // Inconclusive CMH renders as the neutral 1 in the table.
        assert_eq!(rows[0].cmh, "1");
        assert_eq!(rows[0].disease_counts, Some([[1, 3], [4, 2]]));
        assert_eq!(rows[0].ingroup, vec!["A"]);
        assert_eq!(rows[0].outgroup, vec!["B"]);
        assert_eq!(rows[1].disease_counts, None);
        assert!(rows[1].ingroup.is_empty());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn species_is_the_second_path_component() {
        assert_eq!(
            species_from_path("all_cohorts/Alistipes_senegalensis/uscg.nwk"),
            "Alistipes_senegalensis"
        );
        assert_eq!(species_from_path("lone_file.nwk"), "lone_file.nwk");
    }

    #[test]
    fn genotype_table_fills_missing_cells_with_a_dash() {
        let mut matrix = GenotypeMatrix::default();
        matrix.add_split(
            "sp_a",
            &[[0, 2], [2, 0]],
            &["S1".to_string(), "S2".to_string()],
            &["S3".to_string()],
        );
        matrix.add_split("sp_b", &[[2, 0], [0, 2]], &["S1".to_string()], &["S4".to_string()]);

        let mut buf = Vec::new();
        write_genotype_table(&mut buf, &matrix).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "\tS1\tS2\tS3\tS4");
        assert_eq!(lines[1], "sp_a\tD\tD\tH\t-");
        assert_eq!(lines[2], "sp_b\tH\t-\t-\tD");
    }

    #[test]
    fn sharing_table_has_sorted_joined_info_fields() {
        use crate::sharing::SharingMap;
        let meta = parse_metadata(META).unwrap();
        let tree = Tree::from_newick("(S1|a:0.1,S2|b:0.1);").unwrap();
        let mut agg = ResultAggregator::new(0.001);
        agg.add_tree(&SharingMap::from_tree(&tree, &meta));

        let mut buf = Vec::new();
        write_sharing_table(&mut buf, &agg, &meta).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("sample1\tsample2\tcategory"));
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields[0], "S1");
        assert_eq!(fields[1], "S2");
        assert_eq!(fields[2], "before_after_FMT_same_responder");
        assert_eq!(fields[3], "D1|D1");
        assert_eq!(fields[4], "p1|p1");
        assert_eq!(fields[5], "before_FMT|responder");
    }
}
