//! Per-locus fitted stutter parameter table.

use std::io::Write;

use anyhow::Result;

use crate::LocusCall;

pub fn write_header(writer: &mut dyn Write) -> Result<()> {
    writeln!(
        writer,
        "CHROM\tPOS\tINFRAME_PGEOM\tINFRAME_UP\tINFRAME_DOWN\tOUTFRAME_PGEOM\tOUTFRAME_UP\tOUTFRAME_DOWN"
    )?;
    Ok(())
}

pub fn write_record(writer: &mut dyn Write, call: &LocusCall, precision: usize) -> Result<()> {
    let model = &call.stutter;
    writeln!(
        writer,
        "{}\t{}\t{:.p$}\t{:.p$}\t{:.p$}\t{:.p$}\t{:.p$}\t{:.p$}",
        call.chrom,
        call.pos,
        model.in_geom(),
        model.in_up(),
        model.in_down(),
        model.out_geom(),
        model.out_up(),
        model.out_down(),
        p = precision
    )?;
    Ok(())
}
