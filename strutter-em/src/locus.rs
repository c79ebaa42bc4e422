//! Validated per-locus input tables: candidate alleles and classified reads.

use std::collections::HashMap;

use anyhow::{bail, Result};

/// Ordered set of candidate allele lengths (bp) plus the repeat motif length.
#[derive(Debug, Clone)]
pub struct AlleleSet {
    bps: Vec<i32>,
    motif_len: i32,
}

impl AlleleSet {
    pub fn new(bps: Vec<i32>, motif_len: i32) -> Result<Self> {
        if bps.is_empty() {
            bail!("at least one candidate allele is required");
        }
        if motif_len < 1 {
            bail!("motif length must be >= 1 bp, got {}", motif_len);
        }
        if let Some(&bp) = bps.iter().find(|&&bp| bp < 1) {
            bail!("allele lengths must be positive, got {} bp", bp);
        }
        Ok(AlleleSet { bps, motif_len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bps.is_empty()
    }

    /// Length in bp of the allele at `index`.
    #[inline]
    pub fn bp(&self, index: usize) -> i32 {
        self.bps[index]
    }

    pub fn bps(&self) -> &[i32] {
        &self.bps
    }

    #[inline]
    pub fn motif_len(&self) -> i32 {
        self.motif_len
    }
}

/// One sequencing read, pre-classified by observed repeat length and phased
/// against the sample's SNP haplotypes upstream.
///
/// `log_p1`/`log_p2` are the log-likelihoods of the read originating from
/// phase 1 or phase 2 of its sample; both must be <= 0.
#[derive(Debug, Clone, Copy)]
pub struct Read {
    pub sample: usize,
    pub allele: usize,
    pub log_p1: f64,
    pub log_p2: f64,
}

/// All reads for a locus, with the sample names they index into.
#[derive(Debug, Clone)]
pub struct ReadTable {
    reads: Vec<Read>,
    sample_names: Vec<String>,
    sample_indices: HashMap<String, usize>,
    reads_per_sample: Vec<usize>,
}

impl ReadTable {
    pub fn new(reads: Vec<Read>, sample_names: Vec<String>) -> Result<Self> {
        let num_samples = sample_names.len();
        if num_samples == 0 {
            bail!("at least one sample is required");
        }

        let mut reads_per_sample = vec![0usize; num_samples];
        for read in &reads {
            if read.sample >= num_samples {
                bail!(
                    "read references sample index {} but only {} samples were supplied",
                    read.sample,
                    num_samples
                );
            }
            if read.log_p1 > 0.0 || read.log_p2 > 0.0 {
                bail!(
                    "phasing log-likelihoods must be <= 0, got ({}, {})",
                    read.log_p1,
                    read.log_p2
                );
            }
            reads_per_sample[read.sample] += 1;
        }

        let mut sample_indices = HashMap::with_capacity(num_samples);
        for (index, name) in sample_names.iter().enumerate() {
            if sample_indices.insert(name.clone(), index).is_some() {
                bail!("duplicate sample name {:?}", name);
            }
        }

        Ok(ReadTable {
            reads,
            sample_names,
            sample_indices,
            reads_per_sample,
        })
    }

    #[inline]
    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.sample_names.len()
    }

    #[inline]
    pub fn reads(&self) -> &[Read] {
        &self.reads
    }

    pub fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    /// Locus-local index of a sample name, if it was genotyped here.
    pub fn sample_index(&self, name: &str) -> Option<usize> {
        self.sample_indices.get(name).copied()
    }

    pub fn sample_indices(&self) -> &HashMap<String, usize> {
        &self.sample_indices
    }

    #[inline]
    pub fn reads_per_sample(&self) -> &[usize] {
        &self.reads_per_sample
    }
}
