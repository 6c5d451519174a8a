//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, Phase};

pub const CONDITION_TYPE_READY: &str = "Ready";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips; reason, message
/// and generation are always refreshed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Upsert the single Ready condition for `phase`
pub fn set_ready_condition(
    conditions: &mut Vec<Condition>,
    phase: Phase,
    message: &str,
    observed_generation: Option<i64>,
) {
    let status = if phase == Phase::Ready {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    // Older writers may have left duplicates behind
    let mut seen = false;
    conditions.retain(|c| {
        if c.type_ != CONDITION_TYPE_READY {
            return true;
        }
        !std::mem::replace(&mut seen, true)
    });
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        status,
        &phase.to_string(),
        message,
        observed_generation,
    );
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: &str, time: &str) -> Condition {
        Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: status.to_string(),
            last_transition_time: time.to_string(),
            reason: "Configuring".to_string(),
            message: "Setting up required database extensions".to_string(),
            observed_generation: None,
        }
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_ready_condition(&mut conditions, Phase::Ready, "Database configuration synchronized", Some(3));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_eq!(conditions[0].reason, "Ready");
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn test_transition_time_moves_on_flip() {
        let mut conditions = vec![ready(CONDITION_STATUS_FALSE, "2024-01-01T00:00:00Z")];

        set_ready_condition(&mut conditions, Phase::Ready, "Database configuration synchronized", None);

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_transition_time_kept_without_flip() {
        let mut conditions = vec![ready(CONDITION_STATUS_FALSE, "2024-01-01T00:00:00Z")];

        set_ready_condition(&mut conditions, Phase::Error, "Failed to get database URL: boom", None);

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "Error");
        assert_eq!(conditions[0].message, "Failed to get database URL: boom");
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_READY));
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut conditions = vec![
            ready(CONDITION_STATUS_FALSE, "2024-01-01T00:00:00Z"),
            ready(CONDITION_STATUS_TRUE, "2024-02-01T00:00:00Z"),
        ];

        set_ready_condition(&mut conditions, Phase::Configuring, "waiting", None);

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            find_condition(&conditions, CONDITION_TYPE_READY).unwrap().last_transition_time,
            "2024-01-01T00:00:00Z"
        );
    }
}
