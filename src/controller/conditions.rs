//! # Condition Sets
//!
//! A [`ConditionSet`] declares which dependent conditions make up a
//! resource's readiness. A [`ConditionManager`] applies that declaration to
//! one resource's status, recomputing the happy (Ready) condition after
//! every change.
//!
//! Aggregation, evaluated over Error-severity dependents in declaration order:
//!
//! 1. any dependent False ⇒ Ready False, reason/message copied from it
//! 2. else any dependent Unknown or missing ⇒ Ready Unknown, likewise
//! 3. else Ready True with reason and message cleared
//!
//! Warning and Info dependents are recorded but never affect Ready.

use crate::crd::condition::now;
use crate::crd::{Condition, ConditionSeverity, ConditionStatus, Status, CONDITION_READY};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

/// Errors raised while declaring a condition set
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionSetError {
    #[error("condition type must not be empty")]
    EmptyType,
    #[error("condition type {0:?} is declared more than once")]
    Duplicate(String),
    #[error("happy condition {0:?} cannot also be a dependent")]
    HappyIsDependent(String),
}

/// Immutable declaration of a resource's conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionSet {
    happy: String,
    dependents: Vec<String>,
}

impl ConditionSet {
    /// Declare a condition set with an explicit happy type
    pub fn new<I, S>(happy: &str, dependents: I) -> Result<Self, ConditionSetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if happy.is_empty() {
            return Err(ConditionSetError::EmptyType);
        }
        let mut seen = HashSet::new();
        let mut declared = Vec::new();
        for dependent in dependents {
            let dependent = dependent.into();
            if dependent.is_empty() {
                return Err(ConditionSetError::EmptyType);
            }
            if dependent == happy {
                return Err(ConditionSetError::HappyIsDependent(dependent));
            }
            if !seen.insert(dependent.clone()) {
                return Err(ConditionSetError::Duplicate(dependent));
            }
            declared.push(dependent);
        }
        Ok(Self {
            happy: happy.to_string(),
            dependents: declared,
        })
    }

    /// Declare a condition set whose happy type is `Ready`
    pub fn living<I, S>(dependents: I) -> Result<Self, ConditionSetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CONDITION_READY, dependents)
    }

    #[must_use]
    pub fn happy(&self) -> &str {
        &self.happy
    }

    #[must_use]
    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    /// Bind this set to one resource's status
    pub fn manage<'a>(&'a self, status: &'a mut Status) -> ConditionManager<'a> {
        ConditionManager { set: self, status }
    }

    /// Read-only view; never mutates the status
    #[must_use]
    pub fn is_happy(&self, status: &Status) -> bool {
        status
            .get_condition(&self.happy)
            .is_some_and(Condition::is_true)
    }

    fn is_dependent(&self, type_: &str) -> bool {
        self.dependents.iter().any(|d| d == type_)
    }
}

/// Mutating view of one status through a [`ConditionSet`]
#[derive(Debug)]
pub struct ConditionManager<'a> {
    set: &'a ConditionSet,
    status: &'a mut Status,
}

impl ConditionManager<'_> {
    /// Ensure every declared condition exists, defaulting to Unknown
    ///
    /// Existing conditions are left untouched.
    pub fn initialize_conditions(&mut self) {
        let missing: Vec<String> = self
            .set
            .dependents
            .iter()
            .chain(std::iter::once(&self.set.happy))
            .filter(|t| self.status.get_condition(t).is_none())
            .cloned()
            .collect();
        for type_ in missing {
            self.status
                .conditions
                .push(Condition::new(type_, ConditionStatus::Unknown));
        }
        self.recompute_happy();
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.mark(type_, ConditionStatus::True, ConditionSeverity::Error, "", "");
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, message: &str) {
        self.mark(type_, ConditionStatus::False, ConditionSeverity::Error, reason, message);
    }

    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: &str) {
        self.mark(type_, ConditionStatus::Unknown, ConditionSeverity::Error, reason, message);
    }

    /// Mark a condition False with a non-default severity
    ///
    /// With `Warning` or `Info` the condition is surfaced without blocking
    /// Ready.
    pub fn mark_false_with_severity(
        &mut self,
        type_: &str,
        severity: ConditionSeverity,
        reason: &str,
        message: &str,
    ) {
        self.mark(type_, ConditionStatus::False, severity, reason, message);
    }

    #[must_use]
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.status.get_condition(type_)
    }

    #[must_use]
    pub fn is_happy(&self) -> bool {
        self.set.is_happy(self.status)
    }

    fn mark(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        severity: ConditionSeverity,
        reason: &str,
        message: &str,
    ) {
        if type_ == self.set.happy {
            warn!(
                condition = type_,
                "Ignoring direct write to the happy condition; it is computed from dependents"
            );
            return;
        }
        debug_assert!(
            self.set.is_dependent(type_),
            "condition {type_:?} is not declared by the condition set"
        );
        if !self.set.is_dependent(type_) {
            warn!(condition = type_, "Ignoring write to a condition the set does not declare");
            return;
        }
        upsert(self.status, type_, status, severity, reason, message);
        self.recompute_happy();
    }

    fn recompute_happy(&mut self) {
        let mut unknown: Option<(String, String)> = None;
        for dependent in &self.set.dependents {
            match self.status.get_condition(dependent) {
                Some(c) if !c.severity.is_error() => {}
                Some(c) if c.is_false() => {
                    let reason = c.reason.clone().unwrap_or_default();
                    let message = c.message.clone().unwrap_or_default();
                    self.set_happy(ConditionStatus::False, &reason, &message);
                    return;
                }
                Some(c) if c.is_unknown() => {
                    if unknown.is_none() {
                        unknown = Some((
                            c.reason.clone().unwrap_or_default(),
                            c.message.clone().unwrap_or_default(),
                        ));
                    }
                }
                Some(_) => {}
                None => {
                    if unknown.is_none() {
                        unknown = Some((String::new(), String::new()));
                    }
                }
            }
        }
        match unknown {
            Some((reason, message)) => self.set_happy(ConditionStatus::Unknown, &reason, &message),
            None => self.set_happy(ConditionStatus::True, "", ""),
        }
    }

    fn set_happy(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        let happy = self.set.happy.clone();
        upsert(
            self.status,
            &happy,
            status,
            ConditionSeverity::Error,
            reason,
            message,
        );
    }

    /// Whether the status carries a condition outside the declared set,
    /// for example one written by an older controller version
    #[must_use]
    pub fn has_undeclared(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.type_ != self.set.happy && !self.set.is_dependent(&c.type_))
    }
}

/// Insert or update a condition, keeping one entry per type
///
/// The transition time only moves when the status changes.
fn upsert(
    status: &mut Status,
    type_: &str,
    value: ConditionStatus,
    severity: ConditionSeverity,
    reason: &str,
    message: &str,
) {
    let updated = Condition::new(type_, value)
        .with_severity(severity)
        .with_reason(reason, message);
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let last_transition_time = if existing.status == value {
                existing.last_transition_time.or_else(|| Some(now()))
            } else {
                updated.last_transition_time
            };
            *existing = Condition {
                last_transition_time,
                ..updated
            };
        }
        None => status.conditions.push(updated),
    }
    status.conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_set() -> ConditionSet {
        ConditionSet::living(["BuildCacheReady", "BuildSucceeded", "ImageResolved"]).unwrap()
    }

    fn ready(status: &Status) -> &Condition {
        status.get_condition(CONDITION_READY).unwrap()
    }

    #[test]
    fn test_construction_rejects_malformed_sets() {
        assert_eq!(
            ConditionSet::living(["A", "A"]).unwrap_err(),
            ConditionSetError::Duplicate("A".to_string())
        );
        assert_eq!(
            ConditionSet::living(["Ready"]).unwrap_err(),
            ConditionSetError::HappyIsDependent("Ready".to_string())
        );
        assert_eq!(
            ConditionSet::living([""]).unwrap_err(),
            ConditionSetError::EmptyType
        );
        assert_eq!(
            ConditionSet::new("", ["A"]).unwrap_err(),
            ConditionSetError::EmptyType
        );
    }

    #[test]
    fn test_initialize_conditions_adds_every_type_as_unknown() {
        let set = function_set();
        let mut status = Status::default();
        set.manage(&mut status).initialize_conditions();

        assert_eq!(status.conditions.len(), 4);
        assert!(status.conditions.iter().all(Condition::is_unknown));
    }

    #[test]
    fn test_initialize_conditions_keeps_existing_values() {
        let set = function_set();
        let mut status = Status::default();
        set.manage(&mut status).mark_true("ImageResolved");
        set.manage(&mut status).initialize_conditions();

        assert!(status.get_condition("ImageResolved").unwrap().is_true());
        assert_eq!(status.conditions.len(), 4);
    }

    #[test]
    fn test_ready_true_only_when_all_dependents_true() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_true("BuildCacheReady");
        manager.mark_true("BuildSucceeded");
        assert!(!manager.is_happy());
        manager.mark_true("ImageResolved");
        assert!(manager.is_happy());

        let ready = ready(&status);
        assert!(ready.reason.is_none());
        assert!(ready.message.is_none());
    }

    #[test]
    fn test_false_dependent_wins_over_unknown() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_unknown("BuildCacheReady", "Pending", "volume claim is not yet bound");
        manager.mark_false("ImageResolved", "ImageInvalid", "bad reference");

        let ready = ready(&status);
        assert!(ready.is_false());
        assert_eq!(ready.reason.as_deref(), Some("ImageInvalid"));
        assert_eq!(ready.message.as_deref(), Some("bad reference"));
    }

    #[test]
    fn test_first_unknown_dependent_in_declaration_order_wins() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_unknown("BuildSucceeded", "Building", "build running");
        manager.mark_unknown("BuildCacheReady", "Pending", "volume claim is not yet bound");

        let ready = ready(&status);
        assert!(ready.is_unknown());
        assert_eq!(ready.reason.as_deref(), Some("Pending"));
    }

    #[test]
    fn test_warning_dependent_does_not_block_ready() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_false_with_severity(
            "BuildCacheReady",
            ConditionSeverity::Warning,
            "NotOwned",
            "There is an existing PersistentVolumeClaim \"square-build-cache\" that the Function does not own.",
        );
        manager.mark_true("BuildSucceeded");
        manager.mark_true("ImageResolved");

        assert!(manager.is_happy());
        let cache = status.get_condition("BuildCacheReady").unwrap();
        assert!(cache.is_false());
        assert_eq!(cache.severity, ConditionSeverity::Warning);
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let set = function_set();
        let mut status = Status::default();
        set.manage(&mut status).mark_false("ImageResolved", "ImageInvalid", "first");

        let stamp = chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        status
            .conditions
            .iter_mut()
            .for_each(|c| c.last_transition_time = Some(stamp));

        set.manage(&mut status).mark_false("ImageResolved", "ImageInvalid", "second");
        let condition = status.get_condition("ImageResolved").unwrap();
        assert_eq!(condition.message.as_deref(), Some("second"));
        assert_eq!(condition.last_transition_time, Some(stamp));

        set.manage(&mut status).mark_true("ImageResolved");
        let condition = status.get_condition("ImageResolved").unwrap();
        assert_ne!(condition.last_transition_time, Some(stamp));
    }

    #[test]
    fn test_direct_write_to_ready_is_ignored() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_true(CONDITION_READY);
        assert!(!manager.is_happy());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is not declared by the condition set")]
    fn test_marking_undeclared_condition_panics_in_debug() {
        let set = ConditionSet::living(["ImageResolved"]).unwrap();
        let mut status = Status::default();
        set.manage(&mut status).mark_false("Extra", "Whatever", "not part of the set");
    }

    #[test]
    fn test_stale_undeclared_condition_is_detected_but_ignored() {
        let set = ConditionSet::living(["ImageResolved"]).unwrap();
        let mut status = Status::default();
        status
            .conditions
            .push(Condition::new("Extra", ConditionStatus::False).with_reason("Whatever", "left behind"));
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_true("ImageResolved");

        assert!(manager.is_happy());
        assert!(manager.has_undeclared());
    }

    #[test]
    fn test_one_condition_per_type() {
        let set = function_set();
        let mut status = Status::default();
        let mut manager = set.manage(&mut status);
        manager.initialize_conditions();
        manager.mark_true("ImageResolved");
        manager.mark_false("ImageResolved", "ImageInvalid", "again");
        manager.mark_unknown("ImageResolved", "", "");

        let count = status
            .conditions
            .iter()
            .filter(|c| c.type_ == "ImageResolved")
            .count();
        assert_eq!(count, 1);
    }
}
