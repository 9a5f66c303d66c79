use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

// Type aliases for clarity
pub type VolunteerId = String;
pub type ShiftId = String;
pub type GroupName = String;

/// Comparison slack for floating-point hour accounting.
pub const HOURS_EPSILON: f64 = 1e-9;

/// Wire format for shift timestamps, e.g. `2025-12-01T09:00`.
pub const TIME_FMT: &str = "%Y-%m-%dT%H:%M";

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, TIME_FMT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| format!("invalid timestamp {s:?}: {e}"))
}

pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIME_FMT).to_string()
}

pub fn duration_hours(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    (end - start).num_seconds() as f64 / 3600.0
}

/// Half-open interval overlap: touching intervals do not conflict.
pub fn overlaps(
    a_start: NaiveDateTime,
    a_end: NaiveDateTime,
    b_start: NaiveDateTime,
    b_end: NaiveDateTime,
) -> bool {
    !(a_end <= b_start || b_end <= a_start)
}

/// Candidate orderings for the greedy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fill as many slots as possible, preferring high-capacity volunteers.
    #[default]
    MinimizeUnfilled,
    /// Distribute hours evenly by always taking the least-loaded volunteer.
    MaximizeFairness,
    /// Prefer volunteers with the most remaining capacity relative to their cap.
    MinimizeOvertime,
}

impl Strategy {
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "minimize_unfilled" => Ok(Strategy::MinimizeUnfilled),
            "maximize_fairness" => Ok(Strategy::MaximizeFairness),
            "minimize_overtime" => Ok(Strategy::MinimizeOvertime),
            other => Err(format!("unknown strategy {other:?}")),
        }
    }
}

fn unbounded_hours() -> f64 {
    f64::INFINITY
}

/// A schedulable person. Omitting `maxHours` on the wire means unbounded.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volunteer {
    pub id: VolunteerId,
    pub name: String,
    #[serde(default)]
    pub group: Option<GroupName>,
    #[serde(default = "unbounded_hours", skip_serializing)]
    pub max_hours: f64,
    #[serde(default)]
    pub assigned_hours: f64,
    #[serde(default)]
    pub assigned_shifts: Vec<ShiftId>,
}

/// A time-bounded work unit with per-group headcount requirements.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: ShiftId,
    #[serde(with = "wire_time")]
    pub start: NaiveDateTime,
    #[serde(with = "wire_time")]
    pub end: NaiveDateTime,
    #[serde(default)]
    pub required_groups: BTreeMap<GroupName, u32>,
    #[serde(default)]
    pub allowed_groups: Option<HashSet<GroupName>>,
    #[serde(default)]
    pub excluded_groups: Option<HashSet<GroupName>>,
    #[serde(default)]
    pub assigned: Vec<VolunteerId>,
}

impl Shift {
    pub fn duration_hours(&self) -> f64 {
        duration_hours(self.start, self.end)
    }

    /// Group-eligibility gate, independent of `required_groups`.
    ///
    /// An empty allowed/excluded set imposes no restriction. A group-less
    /// volunteer never passes a non-empty allowed set.
    pub fn allows(&self, volunteer: &Volunteer) -> bool {
        if let Some(allowed) = &self.allowed_groups {
            if !allowed.is_empty() {
                match &volunteer.group {
                    Some(g) if allowed.contains(g) => {}
                    _ => return false,
                }
            }
        }
        if let Some(excluded) = &self.excluded_groups {
            if let Some(g) = &volunteer.group {
                if excluded.contains(g) {
                    return false;
                }
            }
        }
        true
    }
}

mod wire_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// A committed (shift, volunteer) pairing, used to seed a solve.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub shift_id: ShiftId,
    pub volunteer_id: VolunteerId,
}

/// One unmet unit of (shift, group) capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnfilledSlot {
    pub shift_id: ShiftId,
    pub group: GroupName,
    pub deficit: u32,
}

impl fmt::Display for UnfilledSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} needs {} more {}", self.shift_id, self.deficit, self.group)
    }
}

/// The complete input for a solve.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub volunteers: Vec<Volunteer>,
    pub shifts: Vec<Shift>,
    #[serde(default)]
    pub current_assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolunteerSummary {
    pub assigned_hours: f64,
    pub assigned_shifts: Vec<ShiftId>,
}

/// Result shape shared by all solve strategies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutcome {
    pub assigned_shifts: BTreeMap<ShiftId, Vec<VolunteerId>>,
    pub unfilled_shifts: Vec<UnfilledSlot>,
    pub volunteers: BTreeMap<VolunteerId, VolunteerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolunteerDetail {
    pub name: String,
    pub group: Option<GroupName>,
    pub assigned_hours: f64,
    pub assigned_shifts: Vec<ShiftId>,
}

/// Aggregate hour totals per group; group-less volunteers land in the
/// empty-string bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub group_totals: BTreeMap<GroupName, f64>,
    pub volunteer_details: BTreeMap<VolunteerId, VolunteerDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn volunteer(group: Option<&str>) -> Volunteer {
        Volunteer {
            id: "v1".into(),
            name: "Alice".into(),
            group: group.map(Into::into),
            max_hours: f64::INFINITY,
            assigned_hours: 0.0,
            assigned_shifts: Vec::new(),
        }
    }

    fn shift() -> Shift {
        Shift {
            id: "s1".into(),
            start: ts(9, 0),
            end: ts(11, 0),
            required_groups: BTreeMap::new(),
            allowed_groups: None,
            excluded_groups: None,
            assigned: Vec::new(),
        }
    }

    #[test]
    fn overlap_is_strict_on_touching_intervals() {
        assert!(overlaps(ts(9, 0), ts(11, 0), ts(10, 0), ts(12, 0)));
        assert!(overlaps(ts(10, 0), ts(12, 0), ts(9, 0), ts(11, 0)));
        assert!(!overlaps(ts(9, 0), ts(10, 0), ts(10, 0), ts(11, 0)));
        assert!(!overlaps(ts(10, 0), ts(11, 0), ts(9, 0), ts(10, 0)));
        assert!(overlaps(ts(9, 0), ts(12, 0), ts(10, 0), ts(11, 0)));
    }

    #[test]
    fn duration_is_in_hours() {
        assert_eq!(duration_hours(ts(9, 0), ts(11, 30)), 2.5);
    }

    #[test]
    fn parse_timestamp_accepts_minutes_and_seconds() {
        assert_eq!(parse_timestamp("2025-12-01T09:00").unwrap(), ts(9, 0));
        assert_eq!(parse_timestamp("2025-12-01T09:00:00").unwrap(), ts(9, 0));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn allows_checks_allowed_set() {
        let mut s = shift();
        s.allowed_groups = Some(["X".to_string()].into());
        assert!(s.allows(&volunteer(Some("X"))));
        assert!(!s.allows(&volunteer(Some("Y"))));
        assert!(!s.allows(&volunteer(None)));
    }

    #[test]
    fn allows_checks_excluded_set() {
        let mut s = shift();
        s.excluded_groups = Some(["X".to_string()].into());
        assert!(!s.allows(&volunteer(Some("X"))));
        assert!(s.allows(&volunteer(Some("Y"))));
        assert!(s.allows(&volunteer(None)));
    }

    #[test]
    fn empty_group_sets_do_not_restrict() {
        let mut s = shift();
        s.allowed_groups = Some(HashSet::new());
        s.excluded_groups = Some(HashSet::new());
        assert!(s.allows(&volunteer(Some("X"))));
        assert!(s.allows(&volunteer(None)));
    }

    #[test]
    fn strategy_parse_rejects_unknown_names() {
        assert_eq!(Strategy::parse("maximize_fairness").unwrap(), Strategy::MaximizeFairness);
        assert!(Strategy::parse("minimize_regret").is_err());
    }

    #[test]
    fn shift_deserializes_wire_timestamps() {
        let s: Shift = serde_json::from_str(
            r#"{"id":"s1","start":"2025-12-01T09:00","end":"2025-12-01T11:00","requiredGroups":{"X":1}}"#,
        )
        .unwrap();
        assert_eq!(s.start, ts(9, 0));
        assert_eq!(s.duration_hours(), 2.0);
        assert_eq!(s.required_groups["X"], 1);
    }

    #[test]
    fn volunteer_defaults_to_unbounded_hours() {
        let v: Volunteer = serde_json::from_str(r#"{"id":"v1","name":"Alice"}"#).unwrap();
        assert!(v.max_hours.is_infinite());
        assert!(v.group.is_none());
    }
}
