use crate::data::{ScheduleOutcome, HOURS_EPSILON};
use crate::engine::Scheduler;
use good_lp::variable;
use good_lp::{
    constraint, default_solver, Expression, ProblemVariables, Solution, SolverModel, Variable,
};
use itertools::Itertools;
use log::{info, trace};
use std::collections::HashMap;
use std::time::Duration;

/// Durations enter the model in hundredths of an hour so every coefficient
/// is a whole unit. Caps are rounded to the same grid, so a volunteer's
/// budget can be off by up to half a unit (18 seconds) either way.
const HOUR_SCALE: f64 = 100.0;

fn scaled(hours: f64) -> f64 {
    (hours * HOUR_SCALE).round()
}

/// Decision variables for one solve: x_vs = 1 if volunteer v works shift s.
/// Pairs exist only where the volunteer's group is required, `allows` holds,
/// and no current commitment (seed or earlier chunk) already conflicts.
struct PairModel {
    problem: ProblemVariables,
    pairs: Vec<(usize, usize)>,
    vars: Vec<Variable>,
}

impl Scheduler {
    fn build_model(&self, shift_subset: &[usize]) -> PairModel {
        let mut problem = ProblemVariables::new();
        let mut pairs = Vec::new();
        for &s in shift_subset {
            let shift = &self.shifts[s];
            let duration = shift.duration_hours();
            for (v, vol) in self.volunteers.iter().enumerate() {
                let required = vol
                    .group
                    .as_ref()
                    .is_some_and(|g| shift.required_groups.contains_key(g));
                if !required
                    || !shift.allows(vol)
                    || shift.assigned.contains(&vol.id)
                    || self.would_overlap(v, shift)
                    || vol.assigned_hours + duration > vol.max_hours + HOURS_EPSILON
                {
                    continue;
                }
                pairs.push((v, s));
            }
        }
        trace!(
            "generated {} pair variables for {} shifts",
            pairs.len(),
            shift_subset.len()
        );
        let vars = problem.add_vector(variable().binary(), pairs.len());
        PairModel {
            problem,
            pairs,
            vars,
        }
    }

    fn solve_model(
        &self,
        model: PairModel,
        timeout: Duration,
    ) -> Result<Vec<(usize, usize)>, String> {
        let PairModel {
            problem,
            pairs,
            vars,
        } = model;

        // maximize the number of assigned (volunteer, shift) pairs
        let objective: Expression = vars.iter().copied().sum();
        let mut ilp = problem
            .maximise(objective)
            .using(default_solver)
            .set_option("threads", 1) // limit to 1 thread for reproducibility
            .set_option("random_seed", 1234) //set seed for reproducibility
            .set_option("time_limit", timeout.as_secs_f64());

        // coverage: per shift per group, stay within the remaining headcount
        let by_shift: HashMap<usize, Vec<(usize, Variable)>> = pairs
            .iter()
            .zip(&vars)
            .map(|(&(v, s), &var)| (s, (v, var)))
            .into_group_map();
        for (&s, members) in &by_shift {
            for (group, &count) in &self.shifts[s].required_groups {
                let remaining = count.saturating_sub(self.assigned_of_group(s, group));
                let of_group: Expression = members
                    .iter()
                    .filter(|(v, _)| {
                        self.volunteers[*v].group.as_deref() == Some(group.as_str())
                    })
                    .map(|(_, var)| *var)
                    .sum();
                ilp.add_constraint(constraint!(of_group <= remaining as f64));
            }
        }

        // capacity: scaled hours over chosen shifts within the remaining budget
        let by_volunteer: HashMap<usize, Vec<(usize, Variable)>> = pairs
            .iter()
            .zip(&vars)
            .map(|(&(v, s), &var)| (v, (s, var)))
            .into_group_map();
        for (&v, members) in &by_volunteer {
            let vol = &self.volunteers[v];
            if vol.max_hours.is_finite() {
                let load: Expression = members
                    .iter()
                    .map(|(s, var)| scaled(self.shifts[*s].duration_hours()) * *var)
                    .sum();
                let budget = scaled(vol.max_hours - vol.assigned_hours).max(0.0);
                ilp.add_constraint(constraint!(load <= budget));
            }
            // no double-booking within the chosen set
            for (i, &(a, var_a)) in members.iter().enumerate() {
                for &(b, var_b) in &members[i + 1..] {
                    let (sa, sb) = (&self.shifts[a], &self.shifts[b]);
                    if crate::data::overlaps(sa.start, sa.end, sb.start, sb.end) {
                        ilp.add_constraint(constraint!(var_a + var_b <= 1));
                    }
                }
            }
        }

        info!("starting ILP solve over {} pair variables", pairs.len());
        let solution = ilp
            .solve()
            .map_err(|e| format!("solver failed: {}", e))?;
        Ok(pairs
            .iter()
            .zip(&vars)
            .filter(|(_, var)| solution.value(**var) > 0.9)
            .map(|(pair, _)| *pair)
            .collect())
    }

    fn solve_subset(&self, subset: &[usize], timeout: Duration) -> Result<Vec<(usize, usize)>, String> {
        let model = self.build_model(subset);
        if model.pairs.is_empty() {
            // nothing eligible is not an error; deficits land in the report
            info!("no eligible pairs in subset of {} shifts", subset.len());
            return Ok(Vec::new());
        }
        self.solve_model(model, timeout)
    }

    /// Builds one model over every shift and delegates to the ILP solver,
    /// then re-derives entity state purely from the chosen variables.
    pub fn assign_exact(&mut self, timeout: Duration) -> Result<ScheduleOutcome, String> {
        self.reset_to_seeds();
        let all: Vec<usize> = (0..self.shifts.len()).collect();
        let chosen = self.solve_subset(&all, timeout)?;
        self.apply_chosen(chosen);
        Ok(self.outcome(self.unfilled_report()))
    }

    /// Chunked variant for large shift sets: shifts sorted by (start, id) and
    /// split into consecutive fixed-size chunks, each solved with its own
    /// budget against the commitments of earlier chunks. Bounds model size at
    /// the cost of global optimality.
    pub fn assign_exact_chunked(
        &mut self,
        chunk_size: usize,
        timeout_per_chunk: Duration,
    ) -> Result<ScheduleOutcome, String> {
        if chunk_size == 0 {
            return Err("chunk size must be positive".to_string());
        }
        self.reset_to_seeds();
        let order: Vec<usize> = (0..self.shifts.len())
            .sorted_by(|&a, &b| {
                self.shifts[a]
                    .start
                    .cmp(&self.shifts[b].start)
                    .then_with(|| self.shifts[a].id.cmp(&self.shifts[b].id))
            })
            .collect();
        let chunks: Vec<Vec<usize>> = order
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        info!(
            "chunked exact solve: {} shifts in {} chunks of up to {}",
            order.len(),
            chunks.len(),
            chunk_size
        );
        for chunk in chunks {
            let chosen = self.solve_subset(&chunk, timeout_per_chunk)?;
            self.apply_chosen(chosen);
        }
        Ok(self.outcome(self.unfilled_report()))
    }

    fn apply_chosen(&mut self, mut chosen: Vec<(usize, usize)>) {
        // deterministic write-back order regardless of solver internals
        chosen.sort();
        for (v, s) in chosen {
            self.commit(v, s);
        }
    }
}
