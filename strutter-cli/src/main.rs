use anyhow::Result;
use clap::Parser;

use strutter_em::{CompressMode, EmOptions, LseMode, RunOptions};

/// Length-based STR genotyping with a jointly learned PCR stutter model.
#[derive(Parser)]
#[command(name = "strutter", version, about)]
struct Cli {
    /// Reads file: tab-separated CHROM POS MOTIF SAMPLE READ_BP LOGP1 LOGP2,
    /// rows grouped by locus
    #[arg(long)]
    reads: String,

    /// Output path for genotype records (stdout when omitted)
    #[arg(long)]
    out: Option<String>,

    /// Optional output path for the per-locus fitted stutter parameters
    #[arg(long)]
    stutter_out: Option<String>,

    /// Maximum EM iterations per locus
    #[arg(long, default_value_t = 100)]
    max_iter: usize,

    /// Absolute log-likelihood change below which EM may stop
    #[arg(long, default_value_t = 0.01)]
    abs_tol: f64,

    /// Fractional log-likelihood change below which EM may stop
    #[arg(long, default_value_t = 0.001)]
    frac_tol: f64,

    /// Use the fast log-sum-exp aggregator in the posterior inner loops
    #[arg(long, default_value_t = false)]
    fast_log_sum_exp: bool,

    /// Decimal places for posteriors and stutter parameters
    #[arg(long, default_value_t = 3)]
    precision: usize,

    /// Gzip-compress the outputs
    #[arg(long, default_value_t = false)]
    gzip: bool,

    /// Worker threads for parallel locus batches
    #[arg(long)]
    threads: Option<usize>,

    /// Loci per parallel batch; 0 processes loci sequentially
    #[arg(long, default_value_t = 0)]
    chunk_size: usize,

    /// Log EM iteration traces to stderr
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let opts = RunOptions {
        em: EmOptions {
            max_iter: cli.max_iter,
            abs_tol: cli.abs_tol,
            frac_tol: cli.frac_tol,
            lse: if cli.fast_log_sum_exp {
                LseMode::Fast
            } else {
                LseMode::Exact
            },
        },
        precision: cli.precision,
        compress: if cli.gzip {
            CompressMode::Gzip
        } else {
            CompressMode::None
        },
        threads: cli.threads,
        chunk_size: cli.chunk_size,
    };

    strutter_em::run_genotyping(
        &cli.reads,
        cli.out.as_deref(),
        cli.stutter_out.as_deref(),
        &opts,
    )
}
