//! Tab-separated per-read input.
//!
//! Expected columns: `CHROM POS MOTIF SAMPLE READ_BP LOGP1 LOGP2`, with a
//! header row. Rows belonging to one locus must be consecutive and share
//! `(CHROM, POS)`; the candidate alleles for a locus are the sorted distinct
//! observed `READ_BP` values.

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use super::LocusInput;
use crate::locus::{AlleleSet, Read, ReadTable};

const EXPECTED_COLUMNS: usize = 7;

struct ReadRow {
    chrom: String,
    pos: u32,
    motif_len: i32,
    sample: String,
    read_bp: i32,
    log_p1: f64,
    log_p2: f64,
}

/// Parse a reads file into per-locus inputs, preserving locus order.
pub fn read_locus_reads<P: AsRef<Path>>(path: P) -> Result<Vec<LocusInput>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_locus_reads(file)
}

/// Same as [`read_locus_reads`] but over any reader, for tests and pipes.
pub fn parse_locus_reads<R: std::io::Read>(input: R) -> Result<Vec<LocusInput>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .comment(Some(b'#'))
        .from_reader(input);

    let mut loci = Vec::new();
    let mut pending: Vec<ReadRow> = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("malformed reads row {}", line + 2))?;
        let row = parse_row(&record).with_context(|| format!("reads row {}", line + 2))?;

        if let Some(first) = pending.first() {
            if first.chrom != row.chrom || first.pos != row.pos {
                loci.push(build_locus(std::mem::take(&mut pending))?);
            }
        }
        pending.push(row);
    }
    if !pending.is_empty() {
        loci.push(build_locus(pending)?);
    }
    Ok(loci)
}

fn parse_row(record: &csv::StringRecord) -> Result<ReadRow> {
    if record.len() != EXPECTED_COLUMNS {
        bail!(
            "expected {} tab-separated columns, found {}",
            EXPECTED_COLUMNS,
            record.len()
        );
    }
    let field = |idx: usize| record.get(idx).unwrap_or("").trim();
    Ok(ReadRow {
        chrom: field(0).to_string(),
        pos: field(1)
            .parse()
            .map_err(|_| anyhow!("invalid POS {:?}", field(1)))?,
        motif_len: field(2)
            .parse()
            .map_err(|_| anyhow!("invalid MOTIF {:?}", field(2)))?,
        sample: field(3).to_string(),
        read_bp: field(4)
            .parse()
            .map_err(|_| anyhow!("invalid READ_BP {:?}", field(4)))?,
        log_p1: field(5)
            .parse()
            .map_err(|_| anyhow!("invalid LOGP1 {:?}", field(5)))?,
        log_p2: field(6)
            .parse()
            .map_err(|_| anyhow!("invalid LOGP2 {:?}", field(6)))?,
    })
}

fn build_locus(rows: Vec<ReadRow>) -> Result<LocusInput> {
    let chrom = rows[0].chrom.clone();
    let pos = rows[0].pos;
    let motif_len = rows[0].motif_len;
    if let Some(row) = rows.iter().find(|r| r.motif_len != motif_len) {
        bail!(
            "locus {}:{} mixes motif lengths {} and {}",
            chrom,
            pos,
            motif_len,
            row.motif_len
        );
    }

    // Candidate alleles: sorted distinct observed read lengths
    let mut allele_bps: Vec<i32> = rows.iter().map(|r| r.read_bp).collect();
    allele_bps.sort_unstable();
    allele_bps.dedup();
    let alleles = AlleleSet::new(allele_bps, motif_len)
        .with_context(|| format!("locus {}:{}", chrom, pos))?;

    // Samples indexed in order of first appearance
    let mut sample_names: Vec<String> = Vec::new();
    let mut reads = Vec::with_capacity(rows.len());
    for row in &rows {
        let sample = match sample_names.iter().position(|n| n == &row.sample) {
            Some(index) => index,
            None => {
                sample_names.push(row.sample.clone());
                sample_names.len() - 1
            }
        };
        let allele = alleles
            .bps()
            .binary_search(&row.read_bp)
            .map_err(|_| anyhow!("read length {} missing from allele set", row.read_bp))?;
        reads.push(Read {
            sample,
            allele,
            log_p1: row.log_p1,
            log_p2: row.log_p2,
        });
    }

    let reads = ReadTable::new(reads, sample_names)
        .with_context(|| format!("locus {}:{}", chrom, pos))?;
    Ok(LocusInput {
        chrom,
        pos,
        alleles,
        reads,
    })
}
