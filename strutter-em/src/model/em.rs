//! Expectation-Maximization over diploid phased genotypes and stutter noise.
//!
//! The E-step fills two log-domain tensors: the phased genotype posterior
//! `P[a][b][s]` (shape `A x A x S`) and the per-read phase posterior
//! `Q[a][b][r][phase]` (shape `A x A x R x 2`). The M-step re-estimates the
//! marginal allele prior and re-fits the stutter model from posterior-weighted
//! pseudo-counts. Both tensors are allocated once and rewritten in place.

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array3, Array4};
use tracing::{debug, trace};

use crate::locus::{AlleleSet, ReadTable};
use crate::math::{log_sum_exp2, log_sum_exp3, LseMode};
use crate::model::stutter::StutterModel;

// Seed parameters for the first E-step; changing them shifts convergence basins
const INIT_IN_GEOM: f64 = 0.9;
const INIT_IN_UP: f64 = 0.1;
const INIT_IN_DOWN: f64 = 0.1;
const INIT_OUT_GEOM: f64 = 0.8;
const INIT_OUT_UP: f64 = 0.01;
const INIT_OUT_DOWN: f64 = 0.01;

const LN_2: f64 = std::f64::consts::LN_2;

/// Whether the training loop met both convergence criteria within the
/// iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Converged,
    DidNotConverge,
}

/// Per-sample result of genotype extraction.
#[derive(Debug, Clone)]
pub struct SampleCall {
    /// MAP phased genotype as allele indices (phase 1, phase 2).
    pub gt: (usize, usize),
    pub log_phased_posterior: f64,
    pub log_unphased_posterior: f64,
    /// Probability of the reported phase ordering given the unordered genotype.
    pub phase_prob: f64,
    pub total_reads: usize,
    /// Expected number of reads assigned to phase 1 under the MAP genotype.
    pub phase1_reads: f64,
}

/// Fitted model plus one call per sample, ready for record emission.
#[derive(Debug, Clone)]
pub struct LocusGenotypes {
    pub stutter: StutterModel,
    pub calls: Vec<SampleCall>,
}

/// EM state for one locus. Borrows the immutable input tables; owns the
/// prior vector, both posterior tensors, and the current stutter model.
pub struct EmGenotyper<'a> {
    alleles: &'a AlleleSet,
    reads: &'a ReadTable,
    lse: LseMode,
    log_gt_priors: Array1<f64>,
    log_sample_posteriors: Array3<f64>,
    log_read_phase_posteriors: Array4<f64>,
    stutter: Option<StutterModel>,
}

impl<'a> EmGenotyper<'a> {
    pub fn new(alleles: &'a AlleleSet, reads: &'a ReadTable, lse: LseMode) -> Result<Self> {
        let num_alleles = alleles.len();
        for read in reads.reads() {
            if read.allele >= num_alleles {
                return Err(anyhow!(
                    "read references allele index {} but only {} alleles were supplied",
                    read.allele,
                    num_alleles
                ));
            }
        }

        let num_samples = reads.num_samples();
        let num_reads = reads.num_reads();
        let mut genotyper = EmGenotyper {
            alleles,
            reads,
            lse,
            log_gt_priors: Array1::zeros(num_alleles),
            log_sample_posteriors: Array3::zeros((num_alleles, num_alleles, num_samples)),
            log_read_phase_posteriors: Array4::zeros((num_alleles, num_alleles, num_reads, 2)),
            stutter: None,
        };
        genotyper.init_log_gt_priors();
        Ok(genotyper)
    }

    pub fn stutter_model(&self) -> Option<&StutterModel> {
        self.stutter.as_ref()
    }

    /// Install an externally fitted model, e.g. to genotype without training.
    pub fn set_stutter_model(&mut self, model: StutterModel) {
        self.stutter = Some(model);
    }

    fn stutter(&self) -> Result<&StutterModel> {
        self.stutter
            .as_ref()
            .ok_or_else(|| anyhow!("no stutter model installed; run train() or set_stutter_model() first"))
    }

    /// Seed the marginal allele prior from read label counts, weighting each
    /// read by the inverse of its sample's depth so every sample contributes
    /// equally, with a one-sample pseudocount per allele.
    fn init_log_gt_priors(&mut self) {
        let mut counts = vec![1.0f64; self.alleles.len()];
        let reads_per_sample = self.reads.reads_per_sample();
        for read in self.reads.reads() {
            counts[read.allele] += 1.0 / reads_per_sample[read.sample] as f64;
        }
        let log_total = counts.iter().sum::<f64>().ln();
        for (prior, count) in self.log_gt_priors.iter_mut().zip(&counts) {
            *prior = count.ln() - log_total;
        }
    }

    /// M-step: new prior is the posterior allele marginal across samples.
    fn recalc_log_gt_priors(&mut self) {
        let (num_alleles, _, num_samples) = self.log_sample_posteriors.dim();
        for a in 0..num_alleles {
            let mut max_val = f64::NEG_INFINITY;
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    max_val = max_val.max(self.log_sample_posteriors[[a, b, s]]);
                }
            }
            let mut total = 0.0;
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    total += (self.log_sample_posteriors[[a, b, s]] - max_val).exp();
                }
            }
            self.log_gt_priors[a] = max_val + total.ln();
        }

        let mut max_val = f64::NEG_INFINITY;
        for &prior in &self.log_gt_priors {
            max_val = max_val.max(prior);
        }
        let log_total =
            max_val + self.log_gt_priors.iter().map(|p| (p - max_val).exp()).sum::<f64>().ln();
        self.log_gt_priors.mapv_inplace(|p| p - log_total);
    }

    /// E-step: rewrite the phased genotype posterior tensor and return the
    /// total log-likelihood under the current parameters.
    fn recalc_log_sample_posteriors(&mut self) -> Result<f64> {
        let model = self.stutter()?.clone();
        let (num_alleles, _, num_samples) = self.log_sample_posteriors.dim();

        for a in 0..num_alleles {
            let len_a = self.alleles.bp(a);
            for b in 0..num_alleles {
                let len_b = self.alleles.bp(b);
                let log_prior = self.log_gt_priors[a] + self.log_gt_priors[b];
                for s in 0..num_samples {
                    self.log_sample_posteriors[[a, b, s]] = log_prior;
                }
                for read in self.reads.reads() {
                    let read_bps = self.alleles.bp(read.allele);
                    let contrib = self.lse.combine(
                        read.log_p1 + model.log_pmf(len_a, read_bps),
                        read.log_p2 + model.log_pmf(len_b, read_bps),
                    );
                    self.log_sample_posteriors[[a, b, read.sample]] += contrib;
                }
            }
        }

        // Two-pass log-sum-exp normalization per sample
        let mut sample_max_lls = vec![f64::NEG_INFINITY; num_samples];
        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    let val = self.log_sample_posteriors[[a, b, s]];
                    if val > sample_max_lls[s] {
                        sample_max_lls[s] = val;
                    }
                }
            }
        }
        let mut sample_total_lls = vec![0.0f64; num_samples];
        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    sample_total_lls[s] +=
                        (self.log_sample_posteriors[[a, b, s]] - sample_max_lls[s]).exp();
                }
            }
        }
        for s in 0..num_samples {
            sample_total_lls[s] = sample_max_lls[s] + sample_total_lls[s].ln();
        }

        let total_ll: f64 = sample_total_lls.iter().sum();

        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    self.log_sample_posteriors[[a, b, s]] -= sample_total_lls[s];
                    debug_assert!(self.log_sample_posteriors[[a, b, s]] <= 0.0);
                }
            }
        }

        Ok(total_ll)
    }

    /// E-step: rewrite the per-read phase posterior tensor.
    fn recalc_log_read_phase_posteriors(&mut self) -> Result<()> {
        let model = self.stutter()?.clone();
        let num_alleles = self.alleles.len();

        for a in 0..num_alleles {
            let len_a = self.alleles.bp(a);
            for b in 0..num_alleles {
                let len_b = self.alleles.bp(b);
                for (r, read) in self.reads.reads().iter().enumerate() {
                    let read_bps = self.alleles.bp(read.allele);
                    let log_phase_one = read.log_p1 + model.log_pmf(len_a, read_bps);
                    let log_phase_two = read.log_p2 + model.log_pmf(len_b, read_bps);
                    let log_phase_total = self.lse.combine(log_phase_one, log_phase_two);
                    self.log_read_phase_posteriors[[a, b, r, 0]] = log_phase_one - log_phase_total;
                    self.log_read_phase_posteriors[[a, b, r, 1]] = log_phase_two - log_phase_total;
                }
            }
        }
        Ok(())
    }

    /// M-step: re-fit the stutter model from posterior-weighted log counts.
    ///
    /// Each bucket is a running log-sum-exp; the up/down buckets are seeded
    /// with one pseudo-observation and the step-size buckets with two summing
    /// to three, which keeps both estimated geometric parameters strictly
    /// below one.
    fn recalc_stutter_model(&mut self) -> Result<()> {
        let motif_len = self.alleles.motif_len();
        let num_alleles = self.alleles.len();

        let mut in_log_up = 0.0f64;
        let mut in_log_down = 0.0f64;
        let mut in_log_eq = f64::NEG_INFINITY;
        let mut in_log_diffs = log_sum_exp2(0.0, LN_2);
        let mut out_log_up = 0.0f64;
        let mut out_log_down = 0.0f64;
        let mut out_log_diffs = log_sum_exp2(0.0, LN_2);

        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for (r, read) in self.reads.reads().iter().enumerate() {
                    let log_gt_posterior = self.log_sample_posteriors[[a, b, read.sample]];
                    for phase in 0..2 {
                        let gt_index = if phase == 0 { a } else { b };
                        let weight =
                            log_gt_posterior + self.log_read_phase_posteriors[[a, b, r, phase]];
                        if read.allele == gt_index {
                            in_log_eq = log_sum_exp2(in_log_eq, weight);
                            continue;
                        }
                        let bp_diff = self.alleles.bp(read.allele) - self.alleles.bp(gt_index);
                        if bp_diff % motif_len != 0 {
                            let eff_diff = bp_diff - bp_diff / motif_len;
                            out_log_diffs = log_sum_exp2(
                                out_log_diffs,
                                weight + f64::from(eff_diff.abs()).ln(),
                            );
                            if bp_diff > 0 {
                                out_log_up = log_sum_exp2(out_log_up, weight);
                            } else {
                                out_log_down = log_sum_exp2(out_log_down, weight);
                            }
                        } else {
                            let eff_diff = bp_diff / motif_len;
                            in_log_diffs = log_sum_exp2(
                                in_log_diffs,
                                weight + f64::from(eff_diff.abs()).ln(),
                            );
                            if bp_diff > 0 {
                                in_log_up = log_sum_exp2(in_log_up, weight);
                            } else {
                                in_log_down = log_sum_exp2(in_log_down, weight);
                            }
                        }
                    }
                }
            }
        }

        let in_log_total = log_sum_exp3(in_log_up, in_log_down, in_log_eq);
        let in_geom = (log_sum_exp2(in_log_up, in_log_down) - in_log_diffs).exp();
        let in_up = (in_log_up - in_log_total).exp();
        let in_down = (in_log_down - in_log_total).exp();

        let out_log_total = log_sum_exp2(out_log_up, out_log_down);
        let out_geom = (out_log_total - out_log_diffs).exp();
        let out_up = (out_log_up - out_log_total).exp();
        let out_down = (out_log_down - out_log_total).exp();

        debug_assert!(in_geom < 1.0 && out_geom < 1.0);
        self.stutter = Some(StutterModel::new(
            in_geom, in_up, in_down, out_geom, out_up, out_down, motif_len,
        )?);
        Ok(())
    }

    /// Run EM to convergence or `max_iter`. Convergence requires both the
    /// absolute and the fractional change in total log-likelihood to fall
    /// below their thresholds in the same iteration; the first iteration can
    /// never converge because the previous LL starts at negative infinity.
    pub fn train(&mut self, max_iter: usize, abs_tol: f64, frac_tol: f64) -> Result<TrainOutcome> {
        self.init_log_gt_priors();
        self.stutter = Some(StutterModel::new(
            INIT_IN_GEOM,
            INIT_IN_UP,
            INIT_IN_DOWN,
            INIT_OUT_GEOM,
            INIT_OUT_UP,
            INIT_OUT_DOWN,
            self.alleles.motif_len(),
        )?);

        let mut prev_ll = f64::NEG_INFINITY;
        for iteration in 1..=max_iter {
            // E-step
            let new_ll = self.recalc_log_sample_posteriors()?;
            self.recalc_log_read_phase_posteriors()?;
            debug!("EM iteration {}: LL = {:.6}", iteration, new_ll);

            // M-step
            self.recalc_log_gt_priors();
            self.recalc_stutter_model()?;
            if let Some(model) = &self.stutter {
                trace!("refit stutter model:\n{}", model);
            }

            let abs_change = new_ll - prev_ll;
            let frac_change = -(new_ll - prev_ll) / prev_ll;
            if abs_change < abs_tol && frac_change < frac_tol {
                return Ok(TrainOutcome::Converged);
            }
            prev_ll = new_ll;
        }
        Ok(TrainOutcome::DidNotConverge)
    }

    /// Refresh both posterior tensors under the installed stutter model, so
    /// extraction reflects it. Errors if no model has been installed.
    pub fn genotype(&mut self) -> Result<()> {
        self.stutter()?;
        self.recalc_log_sample_posteriors()?;
        self.recalc_log_read_phase_posteriors()?;
        Ok(())
    }

    /// Extract each sample's MAP phased genotype together with its phased and
    /// unphased posteriors and expected per-phase read counts. Read-only;
    /// calling it repeatedly yields identical results.
    pub fn extract_genotypes(&self) -> Result<LocusGenotypes> {
        let stutter = self.stutter()?.clone();
        let (num_alleles, _, num_samples) = self.log_sample_posteriors.dim();

        let mut gts = vec![(0usize, 0usize); num_samples];
        let mut log_phased = vec![f64::NEG_INFINITY; num_samples];
        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for s in 0..num_samples {
                    let val = self.log_sample_posteriors[[a, b, s]];
                    if val > log_phased[s] {
                        log_phased[s] = val;
                        gts[s] = (a, b);
                    }
                }
            }
        }

        // Expected phase-1 read counts conditioned on the MAP genotypes,
        // accumulated per sample in read order
        let mut log_read_phases: Vec<Vec<f64>> = vec![Vec::new(); num_samples];
        for (r, read) in self.reads.reads().iter().enumerate() {
            let (gt_a, gt_b) = gts[read.sample];
            log_read_phases[read.sample]
                .push(self.log_read_phase_posteriors[[gt_a, gt_b, r, 0]]);
        }

        let mut calls = Vec::with_capacity(num_samples);
        for s in 0..num_samples {
            let (gt_a, gt_b) = gts[s];
            let (log_unphased, phase_prob) = if gt_a == gt_b {
                (log_phased[s], 1.0)
            } else {
                let log_flipped = self.log_sample_posteriors[[gt_b, gt_a, s]];
                let log_total = log_sum_exp2(log_phased[s], log_flipped);
                (log_total, (log_phased[s] - log_total).exp())
            };
            let phase1_reads = crate::math::log_sum_exp(&log_read_phases[s]).exp();
            calls.push(SampleCall {
                gt: (gt_a, gt_b),
                log_phased_posterior: log_phased[s],
                log_unphased_posterior: log_unphased,
                phase_prob,
                total_reads: self.reads.reads_per_sample()[s],
                phase1_reads,
            });
        }

        Ok(LocusGenotypes { stutter, calls })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locus::Read;
    use approx::assert_relative_eq;

    fn log_half() -> f64 {
        (0.5f64).ln()
    }

    fn unphased_read(sample: usize, allele: usize) -> Read {
        Read {
            sample,
            allele,
            log_p1: log_half(),
            log_p2: log_half(),
        }
    }

    fn single_sample_locus(allele_counts: &[usize], bps: Vec<i32>, motif: i32) -> (AlleleSet, ReadTable) {
        let alleles = AlleleSet::new(bps, motif).unwrap();
        let mut reads = Vec::new();
        for (allele, &count) in allele_counts.iter().enumerate() {
            for _ in 0..count {
                reads.push(unphased_read(0, allele));
            }
        }
        let table = ReadTable::new(reads, vec!["sample_a".to_string()]).unwrap();
        (alleles, table)
    }

    #[test]
    fn test_rejects_out_of_range_allele_index() {
        let alleles = AlleleSet::new(vec![20], 4).unwrap();
        let reads = ReadTable::new(vec![unphased_read(0, 3)], vec!["s".to_string()]).unwrap();
        assert!(EmGenotyper::new(&alleles, &reads, LseMode::Exact).is_err());
    }

    #[test]
    fn test_prior_init_weights_samples_equally() {
        // Sample 0 has 4 reads of allele 0, sample 1 a single read of allele 1;
        // depth weighting gives both alleles the same prior mass.
        let alleles = AlleleSet::new(vec![20, 24], 4).unwrap();
        let mut reads: Vec<Read> = (0..4).map(|_| unphased_read(0, 0)).collect();
        reads.push(unphased_read(1, 1));
        let table = ReadTable::new(reads, vec!["s1".to_string(), "s2".to_string()]).unwrap();
        let genotyper = EmGenotyper::new(&alleles, &table, LseMode::Exact).unwrap();

        let p0 = genotyper.log_gt_priors[0].exp();
        let p1 = genotyper.log_gt_priors[1].exp();
        assert_relative_eq!(p0, p1, epsilon = 1e-12);
        assert_relative_eq!(p0 + p1, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_posterior_rows_normalize() {
        let (alleles, reads) = single_sample_locus(&[6, 3, 1], vec![20, 24, 25], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        genotyper.train(5, 0.0, 0.0).unwrap();

        let (num_alleles, _, num_samples) = genotyper.log_sample_posteriors.dim();
        for s in 0..num_samples {
            let mut total = 0.0;
            for a in 0..num_alleles {
                for b in 0..num_alleles {
                    total += genotyper.log_sample_posteriors[[a, b, s]].exp();
                }
            }
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_read_phase_rows_normalize() {
        let (alleles, reads) = single_sample_locus(&[6, 3], vec![20, 24], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        genotyper.train(5, 0.0, 0.0).unwrap();

        let num_alleles = alleles.len();
        for a in 0..num_alleles {
            for b in 0..num_alleles {
                for r in 0..reads.num_reads() {
                    let total = genotyper.log_read_phase_posteriors[[a, b, r, 0]].exp()
                        + genotyper.log_read_phase_posteriors[[a, b, r, 1]].exp();
                    assert_relative_eq!(total, 1.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_log_likelihood_is_monotone() {
        let (alleles, reads) = single_sample_locus(&[10, 2, 1], vec![20, 24, 25], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        genotyper.init_log_gt_priors();
        genotyper.stutter = Some(
            StutterModel::new(
                INIT_IN_GEOM,
                INIT_IN_UP,
                INIT_IN_DOWN,
                INIT_OUT_GEOM,
                INIT_OUT_UP,
                INIT_OUT_DOWN,
                4,
            )
            .unwrap(),
        );

        let mut prev_ll = f64::NEG_INFINITY;
        for _ in 0..15 {
            let ll = genotyper.recalc_log_sample_posteriors().unwrap();
            genotyper.recalc_log_read_phase_posteriors().unwrap();
            assert!(
                ll >= prev_ll - 1e-6,
                "log-likelihood decreased: {} -> {}",
                prev_ll,
                ll
            );
            prev_ll = ll;
            genotyper.recalc_log_gt_priors();
            genotyper.recalc_stutter_model().unwrap();
        }
    }

    #[test]
    fn test_trivial_single_allele_locus() {
        // Ten reads of the lone allele with uninformative phasing: the MAP
        // genotype is certain and the reads split evenly across phases.
        let (alleles, reads) = single_sample_locus(&[10], vec![20], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        genotyper.train(100, 0.01, 0.001).unwrap();
        genotyper.genotype().unwrap();

        assert_relative_eq!(genotyper.log_gt_priors[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(
            genotyper.log_sample_posteriors[[0, 0, 0]],
            0.0,
            epsilon = 1e-12
        );

        let extracted = genotyper.extract_genotypes().unwrap();
        let call = &extracted.calls[0];
        assert_eq!(call.gt, (0, 0));
        assert_relative_eq!(call.log_phased_posterior.exp(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(call.phase_prob, 1.0, epsilon = 1e-12);
        assert_eq!(call.total_reads, 10);
        assert_relative_eq!(call.phase1_reads, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_genotype_requires_model() {
        let (alleles, reads) = single_sample_locus(&[4], vec![20], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        assert!(genotyper.genotype().is_err());
        assert!(genotyper.extract_genotypes().is_err());
    }

    #[test]
    fn test_genotype_with_installed_model() {
        let (alleles, reads) = single_sample_locus(&[8, 2], vec![20, 24], 4);
        let mut genotyper = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        genotyper.set_stutter_model(
            StutterModel::new(0.9, 0.15, 0.05, 0.8, 0.01, 0.01, 4).unwrap(),
        );
        genotyper.genotype().unwrap();
        let extracted = genotyper.extract_genotypes().unwrap();
        assert_eq!(extracted.calls[0].gt, (0, 0));
    }

    #[test]
    fn test_fast_lse_mode_agrees_with_exact() {
        let (alleles, reads) = single_sample_locus(&[10, 2], vec![20, 24], 4);

        let mut exact = EmGenotyper::new(&alleles, &reads, LseMode::Exact).unwrap();
        exact.train(100, 0.01, 0.001).unwrap();
        exact.genotype().unwrap();

        let mut fast = EmGenotyper::new(&alleles, &reads, LseMode::Fast).unwrap();
        fast.train(100, 0.01, 0.001).unwrap();
        fast.genotype().unwrap();

        let e = exact.extract_genotypes().unwrap();
        let f = fast.extract_genotypes().unwrap();
        assert_eq!(e.calls[0].gt, f.calls[0].gt);
        assert_relative_eq!(
            e.stutter.in_up(),
            f.stutter.in_up(),
            epsilon = 1e-6
        );
    }
}
