//! Stage sequencing and the three nested loops of global placement.
//!
//! Each stage solves `f_gamma(g_density(h(x); density weight); gamma)`:
//! the gamma loop anneals the wirelength smoothing, the lambda loop anneals the
//! density weight, and the sub loop takes raw descent steps with both fixed.

use std::time::Instant;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::{self, PlaceParams, StageConfig};
use crate::controllers::{DensityWeightController, GammaController};
use crate::error::{PlaceError, PlaceResult};
use crate::metrics::{GammaHistory, IterationId, MetricKind, MetricRecord, SubHistory};
use crate::model::{Hyperparams, MetricSource, PlacementModel};
use crate::optimizer::Optimizer;
use crate::routability::RoutabilityAdjuster;
use crate::stopping::{terminal, GammaDecision, StoppingCriteria};

/// Everything a finished run hands to post-processing.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementOutcome {
    pub position: Array1<f64>,
    /// Nested metric history, one entry per stage.
    pub stages: Vec<GammaHistory>,
    /// Records taken after legalization and detailed placement.
    pub post_records: Vec<MetricRecord>,
    pub total_iterations: usize,
    pub area_adjustments: usize,
    pub hyper: Hyperparams,
}

impl PlacementOutcome {
    /// All records in the order they were taken.
    pub fn records(&self) -> impl Iterator<Item = &MetricRecord> {
        self.stages
            .iter()
            .flatten()
            .flatten()
            .flatten()
            .chain(self.post_records.iter())
    }

    /// Terminal record of the last descent step.
    pub fn last_descent_record(&self) -> Option<&MetricRecord> {
        self.stages
            .iter()
            .rev()
            .find_map(|stage| stage.last().and_then(terminal))
    }
}

///the pieces of loop state that outlive a single stage
struct RunContext {
    rng: StdRng,
    iteration: usize,
    hyper: Hyperparams,
}

struct StageResult {
    history: GammaHistory,
    area_adjustments: usize,
}

pub struct NonLinearPlacer {
    params: PlaceParams,
}

impl NonLinearPlacer {
    pub fn new(params: PlaceParams) -> Self {
        NonLinearPlacer { params }
    }

    pub fn params(&self) -> &PlaceParams {
        &self.params
    }

    /// Runs every configured stage starting from `pos`.
    #[instrument(skip_all, name = "global_place")]
    pub fn run<M, G, D>(
        &self,
        model: &mut M,
        gamma_ctl: &mut G,
        density_ctl: &mut D,
        mut pos: Array1<f64>,
    ) -> PlaceResult<PlacementOutcome>
    where
        M: PlacementModel,
        G: GammaController,
        D: DensityWeightController,
    {
        // every configuration problem is reported before the first step
        config::validate(&self.params)?;
        model.layout().check(&pos)?;
        for stage in &self.params.stages {
            Optimizer::for_stage(stage)?;
        }
        if self.params.routability.enabled && model.routability().is_none() {
            return Err(PlaceError::RoutabilityUnsupported);
        }

        let mut ctx = RunContext {
            rng: StdRng::seed_from_u64(self.params.random_seed),
            iteration: 0,
            hyper: Hyperparams {
                gamma: gamma_ctl.initial_gamma(),
                density_weight: 0.0,
            },
        };
        let mut stages = Vec::with_capacity(self.params.stages.len());
        let mut area_adjustments = 0;

        for (index, stage) in self.params.stages.iter().enumerate() {
            let result = self.run_stage(index, stage, model, gamma_ctl, density_ctl, &mut pos, &mut ctx)?;
            area_adjustments += result.area_adjustments;
            stages.push(result.history);
        }

        // legalization wants the real cell sizes back
        if area_adjustments > 0 {
            if let Some(ops) = model.routability() {
                ops.restore_original_geometry(&mut pos);
                info!("restored original node sizes after {} area adjustments", area_adjustments);
            }
        }

        Ok(PlacementOutcome {
            position: pos,
            stages,
            post_records: Vec::new(),
            total_iterations: ctx.iteration,
            area_adjustments,
            hyper: ctx.hyper,
        })
    }

    #[instrument(skip_all, fields(stage = index))]
    #[allow(clippy::too_many_arguments)]
    fn run_stage<M, G, D>(
        &self,
        index: usize,
        stage: &StageConfig,
        model: &mut M,
        gamma_ctl: &mut G,
        density_ctl: &mut D,
        pos: &mut Array1<f64>,
        ctx: &mut RunContext,
    ) -> PlaceResult<StageResult>
    where
        M: PlacementModel,
        G: GammaController,
        D: DensityWeightController,
    {
        model.synchronize();
        let tt = Instant::now();
        let mut optimizer = Optimizer::for_stage(stage)?;
        let kind = optimizer.kind();
        info!("use {} optimizer", kind);

        // zero means "not initialized yet", the first descent step fills it in
        ctx.hyper.density_weight = 0.0;
        ctx.hyper.gamma = gamma_ctl.initial_gamma();

        if ctx.iteration == 0 && stage.noise_ratio > 0.0 {
            info!("add {}% noise", stage.noise_ratio * 100.0);
            model.add_noise(pos, stage.noise_ratio, &mut ctx.rng);
            let lr = model.estimate_initial_learning_rate(pos, stage.learning_rate, &ctx.hyper);
            optimizer.set_learning_rate(lr)?;
        }
        // the snapshot has to be taken after the learning rate is settled
        let initial_snapshot = optimizer.snapshot();
        model.synchronize();
        info!("{} initialization takes {:.3} seconds", kind, tt.elapsed().as_secs_f64());

        let kinds: &[MetricKind] = if self.params.routability.enabled {
            &[
                MetricKind::Hpwl,
                MetricKind::Overflow,
                MetricKind::RouteUtilization,
                MetricKind::PinUtilization,
            ]
        } else {
            &[MetricKind::Hpwl, MetricKind::Overflow]
        };
        let criteria = StoppingCriteria::for_stage(stage);
        density_ctl.begin_stage(stage);
        let mut adjuster = if self.params.routability.enabled {
            Some(RoutabilityAdjuster::new(&self.params.routability, initial_snapshot))
        } else {
            None
        };

        let mut sub_cap = stage.sub_iteration;
        let mut flat_lambda = 0;
        let mut total_sub = 0;
        let mut reserved: Option<(MetricRecord, Array1<f64>)> = None;
        // where the latest step started, i.e. where its record was measured
        let mut step_start = pos.clone();
        let mut history: GammaHistory = Vec::new();

        for gamma_step in 0..stage.iteration {
            history.push(Vec::new());
            let g = history.len() - 1;

            for lambda_step in 0..stage.lambda_iteration {
                let mut sub_history: SubHistory = Vec::new();
                for sub_step in 0..sub_cap {
                    let id = IterationId::new(gamma_step, lambda_step, sub_step);
                    let record = self.one_descent_step(
                        id,
                        ctx,
                        &*model,
                        &mut optimizer,
                        pos,
                        &mut step_start,
                        kinds,
                    );
                    sub_history.push(record);
                    ctx.iteration += 1;
                    total_sub += 1;
                    if criteria.sub_stop(sub_cap, &sub_history) {
                        break;
                    }
                }
                let Some(current) = sub_history.last().cloned() else {
                    break;
                };
                history[g].push(sub_history);
                flat_lambda += 1;

                let better = reserved
                    .as_ref()
                    .map_or(true, |(best, _)| current.overflow_or_max() < best.overflow_or_max());
                if better {
                    reserved = Some((current.clone(), step_start.clone()));
                }

                if flat_lambda > 1 {
                    if let Some(previous) = previous_terminal(&history) {
                        ctx.hyper.density_weight = density_ctl.update(
                            &current,
                            previous,
                            flat_lambda,
                            ctx.hyper.density_weight,
                        );
                        debug!("density_weight updated to {:.6E}", ctx.hyper.density_weight);
                    }
                }

                if criteria.lambda_stop(&history[g]) {
                    break;
                }

                if let Some(adjuster) = adjuster.as_mut() {
                    let restart = adjuster.optimize(
                        model,
                        pos,
                        &current,
                        &mut optimizer,
                        &mut ctx.hyper,
                        stage.learning_rate,
                    )?;
                    if let Some(restart) = restart {
                        // slow the search down after the restart
                        sub_cap = restart.sub_iteration;
                        break;
                    }
                }
            }

            //gradually reduce gamma to trade smoothness for accuracy
            let overflow = history[g]
                .last()
                .and_then(|sub| sub.last())
                .and_then(|record| record.overflow)
                .unwrap_or(1.0);
            ctx.hyper.gamma = gamma_ctl.update(gamma_step, overflow);
            model.set_precondition_overflow(overflow);

            let decision = criteria.gamma_stop(
                gamma_step,
                index == 0,
                &history,
                total_sub,
                reserved.as_ref().map(|(record, _)| record),
            );
            match decision {
                GammaDecision::Stop => break,
                GammaDecision::ReuseReserved => {
                    if let Some((record, best)) = &reserved {
                        info!("overflow oscillation, reusing the position of iteration {}", record.iteration);
                        pos.assign(best);
                    }
                    break;
                }
                GammaDecision::Continue => {}
            }

            if let Some(decay) = stage.learning_rate_decay {
                optimizer.decay_learning_rate(decay)?;
            }
        }

        model.synchronize();
        info!("optimizer {} takes {:.3} seconds", kind, tt.elapsed().as_secs_f64());

        Ok(StageResult {
            history,
            area_adjustments: adjuster.map_or(0, |a| a.state().num_area_adjust),
        })
    }

    ///the main step down along the gradient. the record reports metrics at the
    ///position the step started from, which is copied into `start`
    #[allow(clippy::too_many_arguments)]
    fn one_descent_step<M: PlacementModel>(
        &self,
        id: IterationId,
        ctx: &mut RunContext,
        model: &M,
        optimizer: &mut Optimizer,
        pos: &mut Array1<f64>,
        start: &mut Array1<f64>,
        kinds: &[MetricKind],
    ) -> MetricRecord {
        let t0 = Instant::now();
        // move any out-of-bound node back into the region
        model.project(pos);
        start.assign(pos);

        if ctx.hyper.density_weight == 0.0 {
            ctx.hyper.density_weight =
                model.density_gradient_ratio(pos, &ctx.hyper) * self.params.density_weight;
            info!("density_weight = {:.6E}", ctx.hyper.density_weight);
        }

        let mut record = MetricRecord::new(id, ctx.iteration, &ctx.hyper);
        record.evaluate(model, kinds, pos);

        let hyper = ctx.hyper;
        let t1 = Instant::now();
        let report = optimizer.step(
            pos,
            |p| model.obj_and_grad(p, &hyper),
            |p| model.project(p),
        );
        model.synchronize();
        debug!(
            "optimizer step {:.3} ms, {} evaluations, step size {:.6E}",
            t1.elapsed().as_secs_f64() * 1000.0,
            report.evaluations,
            report.step_size
        );

        record.objective = Some(report.start_objective);
        record.eval_time = Some(t0.elapsed().as_secs_f64());
        info!("{}", record);
        record
    }
}

/// Terminal record of the lambda iteration before the newest one, looking
/// back into the previous gamma iteration when needed.
fn previous_terminal(history: &GammaHistory) -> Option<&MetricRecord> {
    let g = history.len().checked_sub(1)?;
    let lambdas = &history[g];
    if lambdas.len() > 1 {
        lambdas[lambdas.len() - 2].last()
    } else {
        history.get(g.checked_sub(1)?).and_then(terminal)
    }
}

/// Legalization and detailed placement engines.
pub trait PostProcessor {
    fn legalize(&mut self, pos: &mut Array1<f64>) -> PlaceResult<()>;
    fn detailed_place(&mut self, pos: &mut Array1<f64>) -> PlaceResult<()>;
}

///runs the enabled post steps and appends an hpwl record after each
#[instrument(skip_all, name = "post_process")]
pub fn post_process<S: MetricSource + ?Sized>(
    params: &PlaceParams,
    source: &S,
    processor: Option<&mut dyn PostProcessor>,
    outcome: &mut PlacementOutcome,
) -> PlaceResult<()> {
    let Some(processor) = processor else {
        if params.legalize || params.detailed_place {
            info!("no legalizer attached, keeping the global placement");
        }
        return Ok(());
    };

    let mut iteration = outcome.total_iterations;
    if params.legalize {
        let tt = Instant::now();
        processor.legalize(&mut outcome.position)?;
        info!("legalization takes {:.3} seconds", tt.elapsed().as_secs_f64());
        outcome.post_records.push(hpwl_record(source, iteration, &outcome.position));
        iteration += 1;
    }
    if params.detailed_place {
        let tt = Instant::now();
        processor.detailed_place(&mut outcome.position)?;
        info!("detailed placement takes {:.3} seconds", tt.elapsed().as_secs_f64());
        outcome.post_records.push(hpwl_record(source, iteration, &outcome.position));
    }
    Ok(())
}

fn hpwl_record<S: MetricSource + ?Sized>(source: &S, iteration: usize, pos: &Array1<f64>) -> MetricRecord {
    let mut record = MetricRecord::standalone(iteration);
    record.evaluate(source, &[MetricKind::Hpwl], pos);
    info!("{}", record);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizerKind, RoutabilityParams};
    use crate::controllers::{EplaceDensityWeight, EplaceGamma};
    use crate::error::ConfigError;
    use crate::model::AreaAdjustment;
    use crate::test_support::{MockRoutability, QuadraticModel};
    use ndarray::array;

    fn stage(iteration: usize, lambda: usize, sub: usize) -> StageConfig {
        StageConfig {
            iteration,
            lambda_iteration: lambda,
            sub_iteration: sub,
            ..StageConfig::default()
        }
    }

    fn params(stages: Vec<StageConfig>) -> PlaceParams {
        PlaceParams {
            stages,
            ..PlaceParams::default()
        }
    }

    fn model() -> QuadraticModel {
        QuadraticModel::new(array![1.0, 2.0, 3.0, 4.0, -1.0, -2.0], 2.0)
    }

    fn start() -> Array1<f64> {
        Array1::zeros(6)
    }

    fn gamma() -> EplaceGamma {
        EplaceGamma::new(4.0, 1.0, 1.0)
    }

    fn weight() -> EplaceDensityWeight {
        EplaceDensityWeight::default()
    }

    #[test]
    fn configuration_errors_come_before_any_step() {
        let bad = params(vec![StageConfig {
            learning_rate: -1.0,
            ..stage(3, 1, 1)
        }]);
        let mut m = model();
        let err = NonLinearPlacer::new(bad)
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap_err();
        assert!(matches!(err, PlaceError::Config(ConfigError::Validation(_))));
        assert!(m.precondition_overflows.is_empty());
    }

    #[test]
    fn wrong_position_length_is_rejected() {
        let mut m = model();
        let err = NonLinearPlacer::new(params(vec![stage(1, 1, 1)]))
            .run(&mut m, &mut gamma(), &mut weight(), Array1::zeros(5))
            .unwrap_err();
        assert!(matches!(err, PlaceError::PositionSize { expected: 6, found: 5 }));
    }

    #[test]
    fn routability_needs_area_ops() {
        let mut p = params(vec![stage(1, 1, 1)]);
        p.routability.enabled = true;
        let err = NonLinearPlacer::new(p)
            .run(&mut model(), &mut gamma(), &mut weight(), start())
            .unwrap_err();
        assert!(matches!(err, PlaceError::RoutabilityUnsupported));
    }

    #[test]
    fn caps_bound_every_loop() {
        let mut m = model();
        m.overflow = 0.5;
        m.max_density = 2.0;
        let outcome = NonLinearPlacer::new(params(vec![stage(5, 3, 2)]))
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();

        let history = &outcome.stages[0];
        assert_eq!(history.len(), 5);
        for lambdas in history {
            assert_eq!(lambdas.len(), 3);
            for subs in lambdas {
                assert!(!subs.is_empty() && subs.len() <= 2);
            }
        }
        assert_eq!(outcome.total_iterations, outcome.records().count());
        assert_eq!(m.precondition_overflows, vec![0.5; 5]);
        let ids: Vec<_> = outcome.records().map(|r| r.iteration).collect();
        assert_eq!(ids, (0..outcome.total_iterations).collect::<Vec<_>>());
    }

    #[test]
    fn low_density_stops_lambda_and_gamma_loops() {
        let mut m = model();
        m.overflow = 0.5;
        m.max_density = 0.5;
        m.density_ratio = 10.0;
        let mut s = stage(10, 10, 3);
        s.gamma_step_threshold = 0;
        let outcome = NonLinearPlacer::new(params(vec![s]))
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();

        let history = &outcome.stages[0];
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|lambdas| lambdas.len() == 2));

        let weights: Vec<f64> = outcome.records().filter_map(|r| r.density_weight).collect();
        assert!((weights[0] - 10.0 * 8e-5).abs() < 1e-15);
        // overflow stays above the stop threshold, so the weight never shrinks
        assert!(weights.windows(2).all(|w| w[1] >= w[0]));
        assert!(weights.last().unwrap() > &weights[0]);
    }

    #[test]
    fn routability_restarts_lambda_loop_up_to_the_cap() {
        let mut m = model();
        m.overflow = 0.1;
        m.max_density = 2.0;
        m.density_ratio = 1.0;
        m.routability = Some(MockRoutability {
            result: AreaAdjustment {
                area: true,
                route_area: true,
                pin_area: true,
            },
            ..MockRoutability::default()
        });
        let mut p = params(vec![stage(3, 3, 2)]);
        p.routability = RoutabilityParams {
            enabled: true,
            max_num_area_adjust: 2,
            node_area_adjust_overflow: 0.15,
            sub_iteration: 4,
            ..RoutabilityParams::default()
        };

        let outcome = NonLinearPlacer::new(p)
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();
        let ops = m.routability.as_ref().unwrap();
        assert_eq!(outcome.area_adjustments, 2);
        assert_eq!(ops.calls, 2);
        assert_eq!(ops.resets, 2);
        assert_eq!(ops.restores, 1);

        let history = &outcome.stages[0];
        // two restarts cut the first two gamma iterations short
        assert_eq!(history[0].len(), 1);
        assert_eq!(history[1].len(), 1);
        assert_eq!(history[2].len(), 3);
        assert!(history[1][0].len() <= 4);
        assert!(outcome
            .records()
            .all(|r| r.route_utilization == Some(1.5) && r.pin_utilization == Some(0.5)));
    }

    #[test]
    fn oscillation_puts_the_reserved_position_back() {
        let mut m = model();
        m.overflow = 0.05;
        m.max_density = 2.0;
        let mut s = stage(200, 1, 1);
        s.oscillation_overflow = 0.1;

        let outcome = NonLinearPlacer::new(params(vec![s]))
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();
        // 101 records are needed before the check may fire
        assert_eq!(outcome.total_iterations, 101);

        // the first record is the best one and it was measured at the start position
        let reserved = &outcome.stages[0][0][0][0];
        assert_eq!(reserved.iteration, 0);
        assert_eq!(reserved.hpwl, 13.0);
        assert_eq!(outcome.position, start());
        assert_eq!(m.hpwl(&outcome.position), reserved.hpwl);

        // the run did move away from it before falling back
        let last = outcome.last_descent_record().unwrap();
        assert!(last.hpwl < 1e-3);
    }

    #[test]
    fn later_stages_continue_the_iteration_count() {
        let mut m = model();
        m.overflow = 0.5;
        m.max_density = 2.0;
        let mut second = stage(2, 1, 1);
        second.optimizer = OptimizerKind::Adam;
        second.learning_rate_decay = Some(0.5);
        let outcome = NonLinearPlacer::new(params(vec![stage(2, 1, 1), second]))
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.total_iterations, 4);
        assert_eq!(outcome.stages[1][0][0][0].iteration, 2);
        assert_eq!(outcome.last_descent_record().unwrap().iteration, 3);
    }

    ///doubles the weight on every update and remembers each stage it saw
    #[derive(Default)]
    struct Doubling {
        stages: Vec<f64>,
        updates: usize,
    }

    impl DensityWeightController for Doubling {
        fn begin_stage(&mut self, stage: &StageConfig) {
            self.stages.push(stage.stop_overflow);
        }

        fn update(&mut self, _: &MetricRecord, _: &MetricRecord, _: usize, weight: f64) -> f64 {
            self.updates += 1;
            weight * 2.0
        }
    }

    #[test]
    fn density_weight_follows_the_given_controller() {
        let mut m = model();
        m.overflow = 0.5;
        m.max_density = 2.0;
        m.density_ratio = 1.0;
        let mut second = stage(1, 2, 1);
        second.stop_overflow = 0.3;
        let mut ctl = Doubling::default();
        let outcome = NonLinearPlacer::new(params(vec![stage(1, 3, 1), second]))
            .run(&mut m, &mut gamma(), &mut ctl, start())
            .unwrap();

        assert_eq!(ctl.stages, vec![0.1, 0.3]);
        assert_eq!(ctl.updates, 2);
        let weights: Vec<f64> = outcome.stages[0][0]
            .iter()
            .map(|sub| sub[0].density_weight.unwrap())
            .collect();
        assert_eq!(weights, vec![8e-5, 8e-5, 1.6e-4]);
    }

    struct Shift {
        calls: Vec<&'static str>,
    }

    impl PostProcessor for Shift {
        fn legalize(&mut self, pos: &mut Array1<f64>) -> PlaceResult<()> {
            self.calls.push("legalize");
            pos.mapv_inplace(f64::round);
            Ok(())
        }

        fn detailed_place(&mut self, _pos: &mut Array1<f64>) -> PlaceResult<()> {
            self.calls.push("detailed_place");
            Ok(())
        }
    }

    #[test]
    fn post_process_records_hpwl_after_each_step() {
        let mut m = model();
        m.overflow = 0.5;
        m.max_density = 2.0;
        let mut p = params(vec![stage(1, 1, 3)]);
        p.detailed_place = true;
        let mut outcome = NonLinearPlacer::new(p.clone())
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();

        let mut shift = Shift { calls: Vec::new() };
        post_process(&p, &m, Some(&mut shift), &mut outcome).unwrap();
        assert_eq!(shift.calls, vec!["legalize", "detailed_place"]);
        assert_eq!(outcome.post_records.len(), 2);
        assert_eq!(outcome.post_records[0].iteration, outcome.total_iterations);
        assert_eq!(outcome.post_records[1].iteration, outcome.total_iterations + 1);
        assert!(outcome.post_records[0].overflow.is_none());
        assert!(outcome.position.iter().all(|x| x.fract() == 0.0));
    }

    #[test]
    fn post_process_without_engines_is_a_no_op() {
        let mut m = model();
        m.max_density = 2.0;
        let p = params(vec![stage(1, 1, 1)]);
        let mut outcome = NonLinearPlacer::new(p.clone())
            .run(&mut m, &mut gamma(), &mut weight(), start())
            .unwrap();
        let before = outcome.position.clone();
        post_process(&p, &m, None, &mut outcome).unwrap();
        assert!(outcome.post_records.is_empty());
        assert_eq!(outcome.position, before);
    }
}
