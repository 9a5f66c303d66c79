use crate::data::{
    duration_hours, overlaps, Assignment, GroupReport, ScheduleOutcome, Shift, Strategy,
    UnfilledSlot, Volunteer, VolunteerDetail, VolunteerSummary, HOURS_EPSILON,
};
use chrono::NaiveDateTime;
use itertools::Itertools;
use log::{info, trace};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// One committed interval for a volunteer, kept in assignment order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Commitment {
    pub(crate) shift: usize,
    pub(crate) start: NaiveDateTime,
    pub(crate) end: NaiveDateTime,
}

/// Assigns volunteers to shifts. Owns the per-volunteer commitment index
/// that greedy, backtracking, and exact paths all consult for conflicts.
///
/// An instance is built fresh per solve and must not be shared across
/// concurrent solves; entity state is mutated in place.
pub struct Scheduler {
    pub volunteers: Vec<Volunteer>,
    pub shifts: Vec<Shift>,
    pub(crate) volunteer_index: HashMap<String, usize>,
    pub(crate) shift_index: HashMap<String, usize>,
    pub(crate) commitments: Vec<Vec<Commitment>>,
    /// (shift, volunteer) pairs fixed by `prefill`; never undone by a solve.
    pub(crate) seeded: HashSet<(usize, usize)>,
}

impl Scheduler {
    /// Builds a scheduler over freshly-reset entities. Duplicate ids are
    /// rejected before any solve can run.
    pub fn new(mut volunteers: Vec<Volunteer>, mut shifts: Vec<Shift>) -> Result<Self, String> {
        let mut volunteer_index = HashMap::new();
        for (i, v) in volunteers.iter_mut().enumerate() {
            v.assigned_hours = 0.0;
            v.assigned_shifts.clear();
            if volunteer_index.insert(v.id.clone(), i).is_some() {
                return Err(format!("duplicate volunteer id {:?}", v.id));
            }
        }
        let mut shift_index = HashMap::new();
        for (i, s) in shifts.iter_mut().enumerate() {
            s.assigned.clear();
            if shift_index.insert(s.id.clone(), i).is_some() {
                return Err(format!("duplicate shift id {:?}", s.id));
            }
        }
        let commitments = vec![Vec::new(); volunteers.len()];
        Ok(Scheduler {
            volunteers,
            shifts,
            volunteer_index,
            shift_index,
            commitments,
            seeded: HashSet::new(),
        })
    }

    /// Marks already-committed assignments before a solve. Seeded pairs count
    /// toward headcount, overlap, and hour caps but are never altered by any
    /// strategy. Unknown ids are skipped.
    pub fn prefill(&mut self, assignments: &[Assignment]) {
        for asgn in assignments {
            let (Some(&v), Some(&s)) = (
                self.volunteer_index.get(&asgn.volunteer_id),
                self.shift_index.get(&asgn.shift_id),
            ) else {
                trace!(
                    "skipping seed ({}, {}): unknown id",
                    asgn.shift_id, asgn.volunteer_id
                );
                continue;
            };
            if !self.seeded.insert((s, v)) {
                continue;
            }
            self.commit(v, s);
        }
        if !self.seeded.is_empty() {
            info!("seeded {} existing assignments", self.seeded.len());
        }
    }

    pub(crate) fn would_overlap(&self, volunteer: usize, shift: &Shift) -> bool {
        self.commitments[volunteer]
            .iter()
            .any(|c| overlaps(c.start, c.end, shift.start, shift.end))
    }

    /// Commits one assignment, keeping entity state and the index in step.
    pub(crate) fn commit(&mut self, volunteer: usize, shift: usize) {
        let duration = self.shifts[shift].duration_hours();
        let vol = &mut self.volunteers[volunteer];
        vol.assigned_hours += duration;
        vol.assigned_shifts.push(self.shifts[shift].id.clone());
        self.shifts[shift].assigned.push(vol.id.clone());
        self.commitments[volunteer].push(Commitment {
            shift,
            start: self.shifts[shift].start,
            end: self.shifts[shift].end,
        });
    }

    /// Drops every non-seeded assignment, restoring the post-prefill state.
    pub(crate) fn reset_to_seeds(&mut self) {
        let seeded = &self.seeded;
        let volunteer_index = &self.volunteer_index;
        for (s, shift) in self.shifts.iter_mut().enumerate() {
            shift
                .assigned
                .retain(|vid| seeded.contains(&(s, volunteer_index[vid])));
        }
        let shift_index = &self.shift_index;
        for (v, vol) in self.volunteers.iter_mut().enumerate() {
            self.commitments[v].retain(|c| seeded.contains(&(c.shift, v)));
            vol.assigned_shifts
                .retain(|sid| seeded.contains(&(shift_index[sid], v)));
            vol.assigned_hours = self.commitments[v]
                .iter()
                .map(|c| duration_hours(c.start, c.end))
                .sum();
        }
    }

    /// Headcount of `group` already on `shift`.
    pub(crate) fn assigned_of_group(&self, shift: usize, group: &str) -> u32 {
        self.shifts[shift]
            .assigned
            .iter()
            .filter(|vid| {
                self.volunteers[self.volunteer_index[*vid]].group.as_deref() == Some(group)
            })
            .count() as u32
    }

    /// Single deterministic greedy pass. Iterates shifts in input order and
    /// required groups in key order, committing sorted candidates until each
    /// remaining headcount is met; shortfalls are recorded, not raised.
    pub fn assign(&mut self, strategy: Strategy) -> ScheduleOutcome {
        info!(
            "greedy pass ({:?}) over {} shifts, {} volunteers",
            strategy,
            self.shifts.len(),
            self.volunteers.len()
        );
        let mut unfilled = Vec::new();
        for s in 0..self.shifts.len() {
            let duration = self.shifts[s].duration_hours();
            let groups: Vec<(String, u32)> = self.shifts[s]
                .required_groups
                .iter()
                .map(|(g, c)| (g.clone(), *c))
                .collect();
            for (group, count) in groups {
                let needed = count.saturating_sub(self.assigned_of_group(s, &group));
                let mut candidates: Vec<usize> = (0..self.volunteers.len())
                    .filter(|&v| {
                        let vol = &self.volunteers[v];
                        vol.group.as_deref() == Some(group.as_str())
                            && self.shifts[s].allows(vol)
                            && !self.shifts[s].assigned.contains(&vol.id)
                            && !self.would_overlap(v, &self.shifts[s])
                            && vol.assigned_hours + duration <= vol.max_hours + HOURS_EPSILON
                    })
                    .collect();
                candidates.sort_by(|&a, &b| {
                    cmp_keys(
                        sort_key(strategy, &self.volunteers[a]),
                        sort_key(strategy, &self.volunteers[b]),
                    )
                });

                let mut placed = 0;
                for &v in &candidates {
                    if placed >= needed {
                        break;
                    }
                    self.commit(v, s);
                    placed += 1;
                }
                if placed < needed {
                    let deficit = needed - placed;
                    trace!(
                        "shift {} short {} of group {}",
                        self.shifts[s].id, deficit, group
                    );
                    unfilled.push(UnfilledSlot {
                        shift_id: self.shifts[s].id.clone(),
                        group,
                        deficit,
                    });
                }
            }
        }
        self.outcome(unfilled)
    }

    /// Deficit report over current entity state, uniform across strategies.
    pub(crate) fn unfilled_report(&self) -> Vec<UnfilledSlot> {
        let mut unfilled = Vec::new();
        for s in 0..self.shifts.len() {
            for (group, &count) in &self.shifts[s].required_groups {
                let deficit = count.saturating_sub(self.assigned_of_group(s, group));
                if deficit > 0 {
                    unfilled.push(UnfilledSlot {
                        shift_id: self.shifts[s].id.clone(),
                        group: group.clone(),
                        deficit,
                    });
                }
            }
        }
        unfilled
    }

    pub(crate) fn outcome(&self, unfilled: Vec<UnfilledSlot>) -> ScheduleOutcome {
        ScheduleOutcome {
            assigned_shifts: self
                .shifts
                .iter()
                .map(|s| (s.id.clone(), s.assigned.clone()))
                .collect(),
            unfilled_shifts: unfilled,
            volunteers: self
                .volunteers
                .iter()
                .map(|v| {
                    (
                        v.id.clone(),
                        VolunteerSummary {
                            assigned_hours: v.assigned_hours,
                            assigned_shifts: v.assigned_shifts.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Aggregates assigned hours per group. Pure projection of current state.
    pub fn report(&self) -> GroupReport {
        let mut group_totals = std::collections::BTreeMap::new();
        for v in &self.volunteers {
            *group_totals
                .entry(v.group.clone().unwrap_or_default())
                .or_insert(0.0) += v.assigned_hours;
        }
        GroupReport {
            group_totals,
            volunteer_details: self
                .volunteers
                .iter()
                .map(|v| {
                    (
                        v.id.clone(),
                        VolunteerDetail {
                            name: v.name.clone(),
                            group: v.group.clone(),
                            assigned_hours: v.assigned_hours,
                            assigned_shifts: v.assigned_shifts.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Population standard deviation of assigned hours. Lower is more even.
    pub fn fairness_score(&self) -> f64 {
        if self.volunteers.is_empty() {
            return 0.0;
        }
        let n = self.volunteers.len() as f64;
        let mean = self.volunteers.iter().map(|v| v.assigned_hours).sum::<f64>() / n;
        let variance = self
            .volunteers
            .iter()
            .map(|v| {
                let diff = v.assigned_hours - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;
        variance.sqrt()
    }

    /// Flat tabular export: one row per (shift, assigned volunteer), shifts
    /// ordered by (start, id).
    pub fn export_csv(&self) -> String {
        let mut out = String::from("shift_id,volunteer_id,volunteer_name,start,end,duration_hours\n");
        let ordered = self
            .shifts
            .iter()
            .sorted_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        for shift in ordered {
            for vid in &shift.assigned {
                let vol = &self.volunteers[self.volunteer_index[vid]];
                out.push_str(&format!(
                    "{},{},{},{},{},{:.2}\n",
                    csv_field(&shift.id),
                    csv_field(&vol.id),
                    csv_field(&vol.name),
                    crate::data::format_timestamp(shift.start),
                    crate::data::format_timestamp(shift.end),
                    shift.duration_hours(),
                ));
            }
        }
        out
    }
}

/// Strategy sort keys, ascending. All strategies favor the least-loaded
/// volunteer first; they differ in tie-breaks and capacity weighting.
fn sort_key(strategy: Strategy, v: &Volunteer) -> [f64; 3] {
    match strategy {
        Strategy::MinimizeUnfilled => [v.assigned_hours, v.assigned_shifts.len() as f64, -v.max_hours],
        Strategy::MaximizeFairness => [v.assigned_hours, v.assigned_shifts.len() as f64, 0.0],
        Strategy::MinimizeOvertime => {
            let used = if v.max_hours.is_finite() {
                v.assigned_hours / v.max_hours
            } else {
                0.0
            };
            [used, v.assigned_hours, v.assigned_shifts.len() as f64]
        }
    }
}

fn cmp_keys(a: [f64; 3], b: [f64; 3]) -> Ordering {
    a.iter()
        .zip(&b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
