pub mod output;
pub mod reads;

use crate::locus::{AlleleSet, ReadTable};

/// One locus worth of parsed input: locus coordinates plus the validated
/// allele and read tables.
#[derive(Debug, Clone)]
pub struct LocusInput {
    pub chrom: String,
    pub pos: u32,
    pub alleles: AlleleSet,
    pub reads: ReadTable,
}
