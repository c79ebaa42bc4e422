//! # strutter-em: length-based STR genotyping with a learned stutter model
//!
//! Jointly estimates a parametric PCR stutter noise model and per-sample
//! diploid STR genotype posteriors by Expectation-Maximization, from reads
//! pre-classified by inferred repeat length and phased against SNP
//! haplotypes upstream.
//!
//! ## Usage
//! ```bash
//! # Genotype every locus in a reads file, VCF-style records to stdout
//! strutter --reads reads.tsv
//!
//! # Write records and the fitted stutter parameters to files
//! strutter --reads reads.tsv --out calls.vcf --stutter-out stutter.tsv
//! ```

pub mod io;
pub mod locus;
pub mod math;
pub mod model;

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use rayon::prelude::*;
use tracing::{info, warn};

use io::output::{StutterWriter, VcfWriter};
use io::LocusInput;

pub use io::output::{CompressMode, DEFAULT_PRECISION};
pub use locus::{AlleleSet, Read, ReadTable};
pub use math::LseMode;
pub use model::em::{EmGenotyper, LocusGenotypes, SampleCall, TrainOutcome};
pub use model::stutter::StutterModel;

/// EM convergence parameters.
#[derive(Debug, Clone, Copy)]
pub struct EmOptions {
    pub max_iter: usize,
    /// Converged when `new_LL - prev_LL < abs_tol` ...
    pub abs_tol: f64,
    /// ... and `-(new_LL - prev_LL) / prev_LL < frac_tol` in the same iteration.
    pub frac_tol: f64,
    pub lse: LseMode,
}

impl Default for EmOptions {
    fn default() -> Self {
        EmOptions {
            max_iter: 100,
            abs_tol: 0.01,
            frac_tol: 0.001,
            lse: LseMode::Exact,
        }
    }
}

/// Options for a multi-locus genotyping run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub em: EmOptions,
    /// Fixed decimal places for posteriors, stutter parameters, and read counts.
    pub precision: usize,
    pub compress: CompressMode,
    /// Rayon thread count; `None` leaves the global pool untouched.
    pub threads: Option<usize>,
    /// Loci per parallel batch; 0 processes loci sequentially.
    pub chunk_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            em: EmOptions::default(),
            precision: DEFAULT_PRECISION,
            compress: CompressMode::None,
            threads: None,
            chunk_size: 0,
        }
    }
}

/// Fitted model and per-sample calls for one locus, ready for emission.
#[derive(Debug, Clone)]
pub struct LocusCall {
    pub chrom: String,
    pub pos: u32,
    pub outcome: TrainOutcome,
    pub stutter: StutterModel,
    /// Indexed by the locus-local sample index.
    pub calls: Vec<SampleCall>,
    /// Sample name to locus-local index.
    pub sample_indices: HashMap<String, usize>,
}

impl LocusCall {
    pub fn sample_index(&self, name: &str) -> Option<usize> {
        self.sample_indices.get(name).copied()
    }
}

/// Train the EM on one locus and extract its genotype calls.
///
/// The posterior tensors are refreshed under the final fitted model before
/// extraction, so the emitted posteriors reflect the parameters reported in
/// the record.
pub fn genotype_locus(locus: &LocusInput, opts: &EmOptions) -> Result<LocusCall> {
    let mut genotyper = EmGenotyper::new(&locus.alleles, &locus.reads, opts.lse)?;
    let outcome = genotyper.train(opts.max_iter, opts.abs_tol, opts.frac_tol)?;
    genotyper.genotype()?;
    let genotypes = genotyper.extract_genotypes()?;
    Ok(LocusCall {
        chrom: locus.chrom.clone(),
        pos: locus.pos,
        outcome,
        stutter: genotypes.stutter,
        calls: genotypes.calls,
        sample_indices: locus.reads.sample_indices().clone(),
    })
}

/// Top-level entry point used by the CLI: genotype every locus in a reads
/// file and stream the records out.
pub fn run_genotyping(
    reads_path: &str,
    vcf_path: Option<&str>,
    stutter_path: Option<&str>,
    opts: &RunOptions,
) -> Result<()> {
    if let Some(n) = opts.threads {
        if n > 0 {
            let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
        }
    }

    let loci = io::reads::read_locus_reads(reads_path)?;
    info!("parsed {} loci from {}", loci.len(), reads_path);

    // Output columns cover every sample seen anywhere in the run, sorted
    let sample_names: Vec<String> = loci
        .iter()
        .flat_map(|locus| locus.reads.sample_names().iter().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let mut vcf = VcfWriter::new(vcf_path, opts.compress, opts.precision)?;
    vcf.write_header(&sample_names)?;
    let mut stutter_out = match stutter_path {
        Some(path) => Some(StutterWriter::new(
            Some(path),
            opts.compress,
            opts.precision,
        )?),
        None => None,
    };

    let mut num_converged = 0usize;
    let mut num_failed = 0usize;
    let mut num_skipped = 0usize;

    let mut emit = |result: Result<LocusCall>,
                    locus: &LocusInput,
                    vcf: &mut VcfWriter,
                    stutter_out: &mut Option<StutterWriter>|
     -> Result<()> {
        match result {
            Ok(call) => {
                match call.outcome {
                    TrainOutcome::Converged => num_converged += 1,
                    TrainOutcome::DidNotConverge => num_failed += 1,
                }
                vcf.write_record(&call)?;
                if let Some(writer) = stutter_out {
                    writer.write_record(&call)?;
                }
            }
            Err(error) => {
                warn!("skipping locus {}:{}: {:#}", locus.chrom, locus.pos, error);
                num_skipped += 1;
            }
        }
        Ok(())
    };

    if opts.chunk_size == 0 {
        for locus in &loci {
            let result = genotype_locus(locus, &opts.em);
            emit(result, locus, &mut vcf, &mut stutter_out)?;
        }
    } else {
        for chunk in loci.chunks(opts.chunk_size) {
            let results: Vec<Result<LocusCall>> = chunk
                .par_iter()
                .map(|locus| genotype_locus(locus, &opts.em))
                .collect();
            for (locus, result) in chunk.iter().zip(results) {
                emit(result, locus, &mut vcf, &mut stutter_out)?;
            }
        }
    }

    info!(
        "EM converged at {} loci, hit the iteration cap at {}, skipped {}",
        num_converged, num_failed, num_skipped
    );

    vcf.finish()?;
    if let Some(writer) = stutter_out {
        writer.finish()?;
    }
    Ok(())
}
