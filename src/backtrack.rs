use crate::data::{overlaps, ScheduleOutcome, HOURS_EPSILON};
use crate::engine::Scheduler;
use chrono::NaiveDateTime;
use log::{info, trace};
use std::time::{Duration, Instant};

/// What to do with the in-flight partial assignment when the budget expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Unwind without scoring: if no complete leaf was reached, the result is
    /// the empty incumbent. Faithful to the original engine's behavior.
    #[default]
    DiscardPartial,
    /// Score the partial configuration at the moment the deadline is first
    /// observed and install it if it beats the incumbent.
    KeepBestPartial,
}

/// One required unit of (shift, group) capacity.
struct Slot {
    shift: usize,
    group: String,
}

/// Explicit search context threaded through the recursion: deadline and
/// incumbent live here, not in captured closures.
struct SearchContext {
    deadline: Instant,
    policy: TimeoutPolicy,
    deadline_hit: bool,
    best_score: f64,
    best: Vec<Option<usize>>,
}

/// Scratch assignment state for the search, with an explicit trail so every
/// undo is the exact inverse of the assign that produced it.
struct SearchState {
    hours: Vec<f64>,
    shift_counts: Vec<usize>,
    intervals: Vec<Vec<(NaiveDateTime, NaiveDateTime)>>,
    shift_members: Vec<Vec<usize>>,
    trail: Vec<TrailEntry>,
}

struct TrailEntry {
    shift: usize,
    volunteer: usize,
    hours: f64,
}

impl SearchState {
    fn capture(sched: &Scheduler) -> Self {
        SearchState {
            hours: sched.volunteers.iter().map(|v| v.assigned_hours).collect(),
            shift_counts: sched
                .volunteers
                .iter()
                .map(|v| v.assigned_shifts.len())
                .collect(),
            intervals: sched
                .commitments
                .iter()
                .map(|cs| cs.iter().map(|c| (c.start, c.end)).collect())
                .collect(),
            shift_members: sched
                .shifts
                .iter()
                .map(|s| {
                    s.assigned
                        .iter()
                        .map(|vid| sched.volunteer_index[vid])
                        .collect()
                })
                .collect(),
            trail: Vec::new(),
        }
    }

    fn push(&mut self, shift: usize, volunteer: usize, span: (NaiveDateTime, NaiveDateTime), hours: f64) {
        self.hours[volunteer] += hours;
        self.shift_counts[volunteer] += 1;
        self.intervals[volunteer].push(span);
        self.shift_members[shift].push(volunteer);
        self.trail.push(TrailEntry {
            shift,
            volunteer,
            hours,
        });
    }

    fn pop(&mut self) {
        let Some(entry) = self.trail.pop() else {
            return;
        };
        self.hours[entry.volunteer] -= entry.hours;
        self.shift_counts[entry.volunteer] -= 1;
        self.intervals[entry.volunteer].pop();
        self.shift_members[entry.shift].pop();
    }

    fn score(&self) -> f64 {
        let filled: usize = self.shift_members.iter().map(Vec::len).sum();
        let total_hours: f64 = self.hours.iter().sum();
        filled as f64 + 0.01 * total_hours
    }
}

impl SearchContext {
    fn try_install(&mut self, state: &SearchState, assignment: &[Option<usize>]) {
        let score = state.score();
        if score > self.best_score {
            self.best_score = score;
            self.best = assignment.to_vec();
        }
    }
}

impl Scheduler {
    /// Exhaustive time-boxed search over one slot per required unit, hardest
    /// shifts first. Returns the same result shape as the greedy pass; on a
    /// budget too small to reach any complete leaf the incumbent may be empty
    /// (see `TimeoutPolicy`).
    pub fn assign_optimal(&mut self, timeout: Duration, policy: TimeoutPolicy) -> ScheduleOutcome {
        self.reset_to_seeds();
        let slots = self.build_slots();
        info!(
            "backtracking over {} slots, budget {:?}, {:?}",
            slots.len(),
            timeout,
            policy
        );

        let mut ctx = SearchContext {
            deadline: Instant::now() + timeout,
            policy,
            deadline_hit: false,
            best_score: f64::NEG_INFINITY,
            best: vec![None; slots.len()],
        };
        let mut state = SearchState::capture(self);
        let mut assignment = vec![None; slots.len()];
        self.search(&mut ctx, &slots, &mut state, &mut assignment, 0);

        if ctx.deadline_hit {
            info!("budget expired, applying incumbent (score {})", ctx.best_score);
        }
        self.reset_to_seeds();
        let best = std::mem::take(&mut ctx.best);
        for (i, chosen) in best.into_iter().enumerate() {
            if let Some(v) = chosen {
                self.commit(v, slots[i].shift);
            }
        }
        let unfilled = self.unfilled_report();
        self.outcome(unfilled)
    }

    /// Flattens remaining headcount into slots, shifts ordered by descending
    /// total remaining requirement so the tightest shifts prune first.
    fn build_slots(&self) -> Vec<Slot> {
        let remaining_total = |s: usize| -> u32 {
            self.shifts[s]
                .required_groups
                .iter()
                .map(|(g, c)| c.saturating_sub(self.assigned_of_group(s, g)))
                .sum()
        };
        let mut order: Vec<usize> = (0..self.shifts.len()).collect();
        order.sort_by(|&a, &b| remaining_total(b).cmp(&remaining_total(a)).then(a.cmp(&b)));

        let mut slots = Vec::new();
        for s in order {
            for (group, &count) in &self.shifts[s].required_groups {
                let needed = count.saturating_sub(self.assigned_of_group(s, group));
                for _ in 0..needed {
                    slots.push(Slot {
                        shift: s,
                        group: group.clone(),
                    });
                }
            }
        }
        slots
    }

    fn search(
        &self,
        ctx: &mut SearchContext,
        slots: &[Slot],
        state: &mut SearchState,
        assignment: &mut Vec<Option<usize>>,
        i: usize,
    ) {
        // budget is only checked on entry; expiry unwinds the whole path
        if Instant::now() >= ctx.deadline {
            if !ctx.deadline_hit {
                ctx.deadline_hit = true;
                if ctx.policy == TimeoutPolicy::KeepBestPartial {
                    ctx.try_install(state, assignment);
                }
            }
            return;
        }
        if i == slots.len() {
            ctx.try_install(state, assignment);
            return;
        }

        let slot = &slots[i];
        let shift = &self.shifts[slot.shift];
        let duration = shift.duration_hours();
        let mut candidates: Vec<usize> = (0..self.volunteers.len())
            .filter(|&v| {
                let vol = &self.volunteers[v];
                vol.group.as_deref() == Some(slot.group.as_str())
                    && shift.allows(vol)
                    && !state.shift_members[slot.shift].contains(&v)
                    && !state.intervals[v]
                        .iter()
                        .any(|&(s, e)| overlaps(s, e, shift.start, shift.end))
                    && state.hours[v] + duration <= vol.max_hours + HOURS_EPSILON
            })
            .collect();
        candidates.sort_by(|&a, &b| {
            state.hours[a]
                .total_cmp(&state.hours[b])
                .then(state.shift_counts[a].cmp(&state.shift_counts[b]))
        });

        if candidates.is_empty() {
            // unfillable slot: skip it, the deficit surfaces in the report
            trace!("slot {} ({}) has no candidates", i, slot.group);
            self.search(ctx, slots, state, assignment, i + 1);
            return;
        }
        for v in candidates {
            state.push(slot.shift, v, (shift.start, shift.end), duration);
            assignment[i] = Some(v);
            self.search(ctx, slots, state, assignment, i + 1);
            assignment[i] = None;
            state.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Assignment, Strategy, UnfilledSlot};
    use crate::engine::testutil::{shift, volunteer};

    const GENEROUS: Duration = Duration::from_secs(5);

    #[test]
    fn zero_timeout_returns_well_formed_empty_result() {
        let mut sched = Scheduler::new(
            vec![volunteer("a", Some("X"), 8.0)],
            vec![shift("s1", (9, 0), (11, 0), &[("X", 1)])],
        )
        .unwrap();
        let out = sched.assign_optimal(Duration::ZERO, TimeoutPolicy::DiscardPartial);
        assert!(out.assigned_shifts["s1"].is_empty());
        assert_eq!(out.volunteers["a"].assigned_hours, 0.0);
        assert_eq!(
            out.unfilled_shifts,
            vec![UnfilledSlot {
                shift_id: "s1".into(),
                group: "X".into(),
                deficit: 1
            }]
        );
    }

    #[test]
    fn zero_timeout_keep_partial_is_also_well_formed() {
        let mut sched = Scheduler::new(
            vec![volunteer("a", Some("X"), 8.0)],
            vec![shift("s1", (9, 0), (11, 0), &[("X", 1)])],
        )
        .unwrap();
        let out = sched.assign_optimal(Duration::ZERO, TimeoutPolicy::KeepBestPartial);
        // deadline fires before anything is placed: empty is the best partial
        assert!(out.assigned_shifts["s1"].is_empty());
        assert_eq!(out.unfilled_shifts.len(), 1);
    }

    #[test]
    fn recovers_assignment_greedy_gives_up_on() {
        // minimize_unfilled puts the high-cap volunteer on s1 and starves s2;
        // the search swaps them and fills both
        let build = || {
            Scheduler::new(
                vec![volunteer("a", Some("X"), 4.0), volunteer("b", Some("X"), 2.0)],
                vec![
                    shift("s1", (9, 0), (11, 0), &[("X", 1)]),
                    shift("s2", (11, 0), (15, 0), &[("X", 1)]),
                ],
            )
            .unwrap()
        };
        let mut greedy = build();
        let greedy_out = greedy.assign(Strategy::MinimizeUnfilled);
        assert_eq!(greedy_out.unfilled_shifts.len(), 1);

        let mut searched = build();
        let out = searched.assign_optimal(GENEROUS, TimeoutPolicy::DiscardPartial);
        assert!(out.unfilled_shifts.is_empty());
        assert_eq!(out.assigned_shifts["s1"], vec!["b".to_string()]);
        assert_eq!(out.assigned_shifts["s2"], vec!["a".to_string()]);
    }

    #[test]
    fn unfillable_slot_is_skipped_not_fatal() {
        let mut sched = Scheduler::new(
            vec![volunteer("a", Some("X"), 8.0)],
            vec![shift("s1", (9, 0), (11, 0), &[("X", 1), ("Y", 2)])],
        )
        .unwrap();
        let out = sched.assign_optimal(GENEROUS, TimeoutPolicy::DiscardPartial);
        assert_eq!(out.assigned_shifts["s1"], vec!["a".to_string()]);
        assert_eq!(
            out.unfilled_shifts,
            vec![UnfilledSlot {
                shift_id: "s1".into(),
                group: "Y".into(),
                deficit: 2
            }]
        );
    }

    #[test]
    fn keep_partial_matches_full_search_when_budget_suffices() {
        let build = || {
            Scheduler::new(
                vec![volunteer("a", Some("X"), 4.0), volunteer("b", Some("X"), 2.0)],
                vec![
                    shift("s1", (9, 0), (11, 0), &[("X", 1)]),
                    shift("s2", (11, 0), (15, 0), &[("X", 1)]),
                ],
            )
            .unwrap()
        };
        let mut discard = build();
        let a = discard.assign_optimal(GENEROUS, TimeoutPolicy::DiscardPartial);
        let mut keep = build();
        let b = keep.assign_optimal(GENEROUS, TimeoutPolicy::KeepBestPartial);
        assert_eq!(a, b);
    }

    #[test]
    fn seeded_assignments_survive_the_search() {
        let mut sched = Scheduler::new(
            vec![volunteer("a", Some("X"), 8.0), volunteer("b", Some("X"), 8.0)],
            vec![
                shift("s1", (9, 0), (11, 0), &[("X", 1)]),
                shift("s2", (12, 0), (14, 0), &[("X", 1)]),
            ],
        )
        .unwrap();
        sched.prefill(&[Assignment {
            shift_id: "s1".into(),
            volunteer_id: "b".into(),
        }]);
        let out = sched.assign_optimal(GENEROUS, TimeoutPolicy::DiscardPartial);
        assert_eq!(out.assigned_shifts["s1"], vec!["b".to_string()]);
        assert!(out.unfilled_shifts.is_empty());
        // and with a zero budget the seed still stands
        let out = sched.assign_optimal(Duration::ZERO, TimeoutPolicy::DiscardPartial);
        assert_eq!(out.assigned_shifts["s1"], vec!["b".to_string()]);
        assert_eq!(out.volunteers["b"].assigned_hours, 2.0);
    }

    #[test]
    fn prefers_more_hours_between_complete_solutions() {
        // both volunteers fit either shift alone; only one can take the long
        // one without overlap, and total hours decide the tie
        let mut sched = Scheduler::new(
            vec![volunteer("a", Some("X"), 8.0), volunteer("b", Some("X"), 8.0)],
            vec![
                shift("s1", (9, 0), (11, 0), &[("X", 1)]),
                shift("s2", (9, 0), (13, 0), &[("X", 1)]),
            ],
        )
        .unwrap();
        let out = sched.assign_optimal(GENEROUS, TimeoutPolicy::DiscardPartial);
        assert!(out.unfilled_shifts.is_empty());
        let total: f64 = out.volunteers.values().map(|v| v.assigned_hours).sum();
        assert_eq!(total, 6.0);
    }
}
