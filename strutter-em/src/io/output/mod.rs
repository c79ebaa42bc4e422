//! Streaming per-locus output writers.

mod stutter;
mod vcf;

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{bail, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::LocusCall;

/// Default number of fixed decimal places in emitted records.
pub const DEFAULT_PRECISION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    #[default]
    None,
    Gzip,
}

/// Opens the output target (file or stdout), optionally gzip-wrapped.
fn open_writer(
    output_path: Option<&str>,
    compress: CompressMode,
) -> Result<BufWriter<Box<dyn Write>>> {
    let writer: Box<dyn Write> = match output_path {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    };
    Ok(match compress {
        CompressMode::Gzip => {
            let encoder = GzEncoder::new(writer, Compression::default());
            BufWriter::with_capacity(64 * 1024, Box::new(encoder))
        }
        CompressMode::None => BufWriter::with_capacity(64 * 1024, writer),
    })
}

/// Streaming writer for the VCF-style genotype records.
pub struct VcfWriter {
    writer: BufWriter<Box<dyn Write>>,
    precision: usize,
    sample_names: Vec<String>,
    header_written: bool,
}

impl VcfWriter {
    pub fn new(
        output_path: Option<&str>,
        compress: CompressMode,
        precision: usize,
    ) -> Result<Self> {
        Ok(VcfWriter {
            writer: open_writer(output_path, compress)?,
            precision,
            sample_names: Vec::new(),
            header_written: false,
        })
    }

    /// Writes the header. Must be called once before any record.
    pub fn write_header(&mut self, sample_names: &[String]) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.sample_names = sample_names.to_vec();
        vcf::write_header(&mut self.writer, sample_names)?;
        self.header_written = true;
        Ok(())
    }

    pub fn write_record(&mut self, call: &LocusCall) -> Result<()> {
        if !self.header_written {
            bail!("header must be written before records");
        }
        vcf::write_record(&mut self.writer, call, &self.sample_names, self.precision)
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Streaming writer for the per-locus fitted stutter parameter table.
pub struct StutterWriter {
    writer: BufWriter<Box<dyn Write>>,
    precision: usize,
}

impl StutterWriter {
    pub fn new(
        output_path: Option<&str>,
        compress: CompressMode,
        precision: usize,
    ) -> Result<Self> {
        let mut writer = open_writer(output_path, compress)?;
        stutter::write_header(&mut writer)?;
        Ok(StutterWriter { writer, precision })
    }

    pub fn write_record(&mut self, call: &LocusCall) -> Result<()> {
        stutter::write_record(&mut self.writer, call, self.precision)
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
