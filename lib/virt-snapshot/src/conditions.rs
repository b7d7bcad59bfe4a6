// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status condition bookkeeping shared by snapshots and restores.

use snapshot_api_types::snapshot::{Condition, ConditionStatus, ConditionType};
use snapshot_api_types::Time;

pub fn progressing(status: ConditionStatus, reason: &str, now: &Time) -> Condition {
    new_condition(ConditionType::Progressing, status, reason, now)
}

pub fn ready(status: ConditionStatus, reason: &str, now: &Time) -> Condition {
    new_condition(ConditionType::Ready, status, reason, now)
}

pub fn failure(status: ConditionStatus, reason: &str, now: &Time) -> Condition {
    new_condition(ConditionType::Failure, status, reason, now)
}

fn new_condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    now: &Time,
) -> Condition {
    Condition {
        type_,
        status,
        last_probe_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
        reason: Some(reason.to_string()),
        message: None,
    }
}

/// Records `c` in `conditions`.
///
/// An existing condition of the same type is only replaced when its status
/// changes, or, with `include_reason`, when its reason changes. Otherwise
/// the old one (and its timestamps) is kept, so recomputing an unchanged
/// state leaves the list untouched.
pub fn update_condition(
    conditions: &mut Vec<Condition>,
    c: Condition,
    include_reason: bool,
) {
    match conditions.iter_mut().find(|existing| existing.type_ == c.type_) {
        Some(existing) => {
            if existing.status != c.status
                || (include_reason && existing.reason != c.reason)
            {
                *existing = c;
            }
        }
        None => conditions.push(c),
    }
}

/// Returns the condition of type `type_`, if present.
pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
