//! VCF-style genotype record emission.
//!
//! Records carry six columns: `CHROM POS ID INFO FORMAT` plus one column per
//! output sample. Samples that were not genotyped at a locus are written as a
//! single `.`.

use std::io::Write;

use anyhow::Result;

use crate::LocusCall;

/// Writes the meta-information lines and the column header.
pub fn write_header(writer: &mut dyn Write, sample_names: &[String]) -> Result<()> {
    writeln!(writer, "##fileformat=VCFv4.2")?;
    writeln!(writer, "##source=strutter-em")?;
    writeln!(writer, "##INFO=<ID=INFRAME_PGEOM,Number=1,Type=Float,Description=\"In-frame stutter geometric step parameter (repeat units)\">")?;
    writeln!(writer, "##INFO=<ID=INFRAME_UP,Number=1,Type=Float,Description=\"In-frame stutter probability of lengthening\">")?;
    writeln!(writer, "##INFO=<ID=INFRAME_DOWN,Number=1,Type=Float,Description=\"In-frame stutter probability of shortening\">")?;
    writeln!(writer, "##INFO=<ID=OUTFRAME_PGEOM,Number=1,Type=Float,Description=\"Out-of-frame stutter geometric step parameter (bp)\">")?;
    writeln!(writer, "##INFO=<ID=OUTFRAME_UP,Number=1,Type=Float,Description=\"Out-of-frame stutter probability of lengthening\">")?;
    writeln!(writer, "##INFO=<ID=OUTFRAME_DOWN,Number=1,Type=Float,Description=\"Out-of-frame stutter probability of shortening\">")?;
    writeln!(writer, "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Phased genotype as allele indices\">")?;
    writeln!(writer, "##FORMAT=<ID=POSTERIOR,Number=1,Type=Float,Description=\"Phased genotype posterior\">")?;
    writeln!(writer, "##FORMAT=<ID=TOTALREADS,Number=1,Type=Integer,Description=\"Reads used to genotype the sample\">")?;
    writeln!(writer, "##FORMAT=<ID=CHROMREADS,Number=1,Type=Float,Description=\"Expected reads supporting phase 1\">")?;
    writeln!(writer, "##FORMAT=<ID=PHASEDREADS,Number=1,Type=Float,Description=\"Expected reads supporting phase 2\">")?;

    write!(writer, "#CHROM\tPOS\tID\tINFO\tFORMAT")?;
    for name in sample_names {
        write!(writer, "\t{}", name)?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Writes one locus record.
pub fn write_record(
    writer: &mut dyn Write,
    call: &LocusCall,
    sample_names: &[String],
    precision: usize,
) -> Result<()> {
    write!(writer, "{}\t{}\t.", call.chrom, call.pos)?;

    let model = &call.stutter;
    write!(
        writer,
        "\tINFRAME_PGEOM={:.p$};INFRAME_UP={:.p$};INFRAME_DOWN={:.p$};\
         OUTFRAME_PGEOM={:.p$};OUTFRAME_UP={:.p$};OUTFRAME_DOWN={:.p$};",
        model.in_geom(),
        model.in_up(),
        model.in_down(),
        model.out_geom(),
        model.out_up(),
        model.out_down(),
        p = precision
    )?;

    write!(writer, "\tGT:POSTERIOR:TOTALREADS:CHROMREADS:PHASEDREADS")?;

    for name in sample_names {
        let Some(sample) = call.sample_index(name) else {
            write!(writer, "\t.")?;
            continue;
        };
        let sample_call = &call.calls[sample];
        let phase2_reads = sample_call.total_reads as f64 - sample_call.phase1_reads;
        write!(
            writer,
            "\t{}|{}:{:.p$}:{}:{:.p$}|{:.p$}",
            sample_call.gt.0,
            sample_call.gt.1,
            sample_call.log_phased_posterior.exp(),
            sample_call.total_reads,
            sample_call.phase1_reads,
            phase2_reads,
            p = precision
        )?;
    }
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::em::{SampleCall, TrainOutcome};
    use crate::model::stutter::StutterModel;
    use std::collections::HashMap;

    fn call() -> LocusCall {
        let stutter = StutterModel::new(0.9, 0.1, 0.1, 0.8, 0.01, 0.01, 4).unwrap();
        let mut sample_indices = HashMap::new();
        sample_indices.insert("s1".to_string(), 0);
        LocusCall {
            chrom: "chr7".to_string(),
            pos: 123456,
            outcome: TrainOutcome::Converged,
            stutter,
            calls: vec![SampleCall {
                gt: (0, 1),
                log_phased_posterior: (0.9876f64).ln(),
                log_unphased_posterior: (0.99f64).ln(),
                phase_prob: 0.997,
                total_reads: 10,
                phase1_reads: 4.25,
            }],
            sample_indices,
        }
    }

    #[test]
    fn test_record_grammar() {
        let mut out = Vec::new();
        let names = vec!["s1".to_string(), "s2".to_string()];
        write_record(&mut out, &call(), &names, 3).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(
            line,
            "chr7\t123456\t.\
             \tINFRAME_PGEOM=0.900;INFRAME_UP=0.100;INFRAME_DOWN=0.100;\
             OUTFRAME_PGEOM=0.800;OUTFRAME_UP=0.010;OUTFRAME_DOWN=0.010;\
             \tGT:POSTERIOR:TOTALREADS:CHROMREADS:PHASEDREADS\
             \t0|1:0.988:10:4.250|5.750\t.\n"
        );
    }

    #[test]
    fn test_header_columns() {
        let mut out = Vec::new();
        write_header(&mut out, &["s1".to_string()]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let last = text.lines().last().unwrap();
        assert_eq!(last, "#CHROM\tPOS\tID\tINFO\tFORMAT\ts1");
        assert!(text.starts_with("##fileformat=VCFv4.2\n"));
        assert_eq!(text.matches("##INFO=").count(), 6);
        assert_eq!(text.matches("##FORMAT=").count(), 5);
    }
}
