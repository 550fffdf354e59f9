use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::models::scoring::ScoringInfo;
use crate::models::ModelError;

const MSECS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(crate) enum LatePolicyKind {
    #[default]
    #[serde(rename = "")]
    Empty,
    #[serde(rename = "baseline")]
    Baseline,
    #[serde(rename = "constant-penalty")]
    ConstantPenalty,
    #[serde(rename = "percentage-penalty")]
    PercentagePenalty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LatePolicy {
    #[serde(rename = "type", default)]
    pub(crate) kind: LatePolicyKind,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub(crate) penalty: f64,
    #[serde(rename = "reject-after-days", default, skip_serializing_if = "is_zero_i64")]
    pub(crate) reject_after_days: i64,
    #[serde(rename = "grace-mins", default, skip_serializing_if = "is_zero_i64")]
    pub(crate) grace_mins: i64,
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

impl LatePolicy {
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        if self.reject_after_days < 0 {
            return Err(ModelError::InvalidLatePolicy(format!(
                "reject-after-days is negative ({})",
                self.reject_after_days
            )));
        }

        if self.grace_mins < 0 {
            return Err(ModelError::InvalidLatePolicy(format!(
                "grace-mins is negative ({})",
                self.grace_mins
            )));
        }

        match self.kind {
            LatePolicyKind::Empty | LatePolicyKind::Baseline => Ok(()),
            LatePolicyKind::ConstantPenalty if self.penalty <= 0.0 => {
                Err(ModelError::InvalidLatePolicy(format!(
                    "constant-penalty needs a positive penalty, found {}",
                    self.penalty
                )))
            }
            LatePolicyKind::PercentagePenalty if self.penalty <= 0.0 || self.penalty > 1.0 => {
                Err(ModelError::InvalidLatePolicy(format!(
                    "percentage-penalty needs a penalty in (0, 1], found {}",
                    self.penalty
                )))
            }
            _ => Ok(()),
        }
    }

    /// Adjust `score` on every entry. Users not in `enrolled` are rejected.
    pub(crate) fn apply(
        &self,
        scores: &mut BTreeMap<String, ScoringInfo>,
        enrolled: &BTreeSet<String>,
        due_date: Option<Timestamp>,
        max_points: f64,
    ) -> Result<(), ModelError> {
        for info in scores.values_mut() {
            info.score = info.raw_score;
        }

        if self.kind == LatePolicyKind::Empty {
            return Ok(());
        }

        let Some(due_date) = due_date else {
            return Err(ModelError::InvalidLatePolicy(String::from(
                "assignment has a late policy but no due date",
            )));
        };

        for (email, info) in scores.iter_mut() {
            info.num_days_late = days_late(due_date, info.submission_time, self.grace_mins);

            if !enrolled.contains(email) {
                tracing::warn!(user = %email, "Cannot find user, rejecting their score");
                info.reject = true;
                continue;
            }

            if self.reject_after_days > 0 && info.num_days_late > self.reject_after_days {
                info.reject = true;
            }
        }

        let per_day = match self.kind {
            LatePolicyKind::ConstantPenalty => self.penalty,
            LatePolicyKind::PercentagePenalty => self.penalty * max_points,
            _ => return Ok(()),
        };

        for info in scores.values_mut().filter(|info| info.num_days_late > 0) {
            info.score = (info.raw_score - per_day * info.num_days_late as f64).max(0.0);
        }

        Ok(())
    }
}

/// Whole days (rounded up) between the graced due date and the submission.
pub(crate) fn days_late(due_date: Timestamp, submission_time: Timestamp, grace_mins: i64) -> i64 {
    let adjusted = due_date.add_msecs(grace_mins * 60 * 1000);
    if adjusted >= submission_time {
        return 0;
    }

    let delta = (submission_time.to_msecs() - adjusted.to_msecs()) as f64;
    (delta / MSECS_PER_DAY).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn score(submitted: i64, raw: f64) -> ScoringInfo {
        ScoringInfo {
            submission_time: Timestamp::from_msecs(submitted),
            raw_score: raw,
            ..ScoringInfo::default()
        }
    }

    fn enrolled(emails: &[&str]) -> BTreeSet<String> {
        emails.iter().map(|email| email.to_string()).collect()
    }

    #[test]
    fn days_late_rounds_up_after_grace() {
        let due = Timestamp::from_msecs(10 * DAY);
        assert_eq!(days_late(due, Timestamp::from_msecs(10 * DAY), 0), 0);
        assert_eq!(days_late(due, Timestamp::from_msecs(10 * DAY + 1), 0), 1);
        assert_eq!(days_late(due, Timestamp::from_msecs(10 * DAY + 60_000), 5), 0);
        assert_eq!(days_late(due, Timestamp::from_msecs(12 * DAY + 1), 0), 3);
    }

    #[test]
    fn validation() {
        let mut policy = LatePolicy { kind: LatePolicyKind::PercentagePenalty, ..LatePolicy::default() };
        assert!(policy.validate().is_err());
        policy.penalty = 0.5;
        assert!(policy.validate().is_ok());
        policy.penalty = 1.5;
        assert!(policy.validate().is_err());

        let policy = LatePolicy { grace_mins: -1, ..LatePolicy::default() };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn constant_penalty_applies_per_day() {
        let policy = LatePolicy {
            kind: LatePolicyKind::ConstantPenalty,
            penalty: 1.0,
            reject_after_days: 3,
            ..LatePolicy::default()
        };

        let mut scores = BTreeMap::from([
            (String::from("ontime@test.com"), score(DAY, 10.0)),
            (String::from("late@test.com"), score(2 * DAY + 1, 10.0)),
            (String::from("verylate@test.com"), score(10 * DAY, 10.0)),
            (String::from("stranger@test.com"), score(DAY, 10.0)),
        ]);
        let users = enrolled(&["ontime@test.com", "late@test.com", "verylate@test.com"]);

        policy
            .apply(&mut scores, &users, Some(Timestamp::from_msecs(DAY)), 10.0)
            .expect("apply");

        assert_eq!(scores["ontime@test.com"].score, 10.0);
        assert_eq!(scores["late@test.com"].score, 8.0);
        assert!(scores["verylate@test.com"].reject);
        assert!(scores["stranger@test.com"].reject);
    }

    #[test]
    fn percentage_penalty_never_goes_negative() {
        let policy = LatePolicy {
            kind: LatePolicyKind::PercentagePenalty,
            penalty: 0.5,
            ..LatePolicy::default()
        };
        let mut scores = BTreeMap::from([(String::from("a@test.com"), score(4 * DAY, 3.0))]);

        policy
            .apply(&mut scores, &enrolled(&["a@test.com"]), Some(Timestamp::zero()), 4.0)
            .expect("apply");

        assert_eq!(scores["a@test.com"].num_days_late, 4);
        assert_eq!(scores["a@test.com"].score, 0.0);
    }

    #[test]
    fn empty_policy_keeps_raw_scores() {
        let mut scores = BTreeMap::from([(String::from("a@test.com"), score(4 * DAY, 3.0))]);
        LatePolicy::default().apply(&mut scores, &BTreeSet::new(), None, 4.0).expect("apply");
        assert_eq!(scores["a@test.com"].score, 3.0);
        assert!(!scores["a@test.com"].reject);
    }
}
