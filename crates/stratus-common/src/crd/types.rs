//! Status building blocks shared by every Stratus resource kind

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is satisfied
    True,
    /// Condition is not satisfied
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The closed set of condition types one resource kind reports.
///
/// Each kind declares an enum with one variant per convergence stage plus
/// a terminal `Ready` variant. The enum's `Ord` is the display order.
pub trait ConditionType:
    Copy
    + Debug
    + Ord
    + Eq
    + Hash
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + JsonSchema
    + 'static
{
    /// The terminal condition, true once every stage has completed
    const READY: Self;

    /// Name written to the `type` field
    fn as_str(&self) -> &'static str;
}

/// A single condition on a resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct Condition<T: ConditionType> {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: T,
    /// Status of the condition
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
}

/// Finite map from condition type to condition.
///
/// Serialized as the conventional list of conditions, ordered by type.
/// Writes replace status, reason and message together; the transition time
/// only moves when the status actually changes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(from = "Vec<Condition<T>>", into = "Vec<Condition<T>>", bound = "")]
pub struct Conditions<T: ConditionType>(BTreeMap<T, Condition<T>>);

impl<T: ConditionType> Default for Conditions<T> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T: ConditionType> From<Vec<Condition<T>>> for Conditions<T> {
    fn from(list: Vec<Condition<T>>) -> Self {
        Self(list.into_iter().map(|c| (c.type_, c)).collect())
    }
}

impl<T: ConditionType> From<Conditions<T>> for Vec<Condition<T>> {
    fn from(conditions: Conditions<T>) -> Self {
        conditions.0.into_values().collect()
    }
}

impl<T: ConditionType> JsonSchema for Conditions<T> {
    fn schema_name() -> String {
        format!("Conditions_for_{}", T::schema_name())
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        <Vec<Condition<T>>>::json_schema(gen)
    }
}

impl<T: ConditionType> Conditions<T> {
    pub fn get(&self, type_: T) -> Option<&Condition<T>> {
        self.0.get(&type_)
    }

    pub fn is_true(&self, type_: T) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// When the condition last became false, if it is currently false
    pub fn false_since(&self, type_: T) -> Option<DateTime<Utc>> {
        self.get(type_)
            .filter(|c| c.status == ConditionStatus::False)
            .map(|c| c.last_transition_time)
    }

    /// Write a condition
    pub fn set(
        &mut self,
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.0.get(&type_) {
            Some(existing) if existing.status == status => existing.last_transition_time,
            _ => now,
        };
        self.0.insert(
            type_,
            Condition {
                type_,
                status,
                reason: reason.into(),
                message: message.into(),
                last_transition_time,
            },
        );
    }

    pub fn set_true(&mut self, type_: T, reason: impl Into<String>, now: DateTime<Utc>) {
        self.set(type_, ConditionStatus::True, reason, "", now);
    }

    pub fn set_false(
        &mut self,
        type_: T,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.set(type_, ConditionStatus::False, reason, message, now);
    }

    /// Forget a condition so its stage runs again
    pub fn remove(&mut self, type_: T) -> Option<Condition<T>> {
        self.0.remove(&type_)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition<T>> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Progress fields embedded in every Stratus status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct ReconcileState<T: ConditionType> {
    /// True once the terminal Ready condition is true
    #[serde(default)]
    pub ready: bool,

    /// Machine-readable reason of a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Human-readable description of a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Per-stage conditions
    #[serde(default)]
    pub conditions: Conditions<T>,
}

impl<T: ConditionType> Default for ReconcileState<T> {
    fn default() -> Self {
        Self {
            ready: false,
            failure_reason: None,
            failure_message: None,
            conditions: Conditions::default(),
        }
    }
}

impl<T: ConditionType> ReconcileState<T> {
    pub fn clear_failure(&mut self) {
        self.failure_reason = None;
        self.failure_message = None;
    }

    pub fn set_failure(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.failure_message = Some(message.into());
    }

    pub fn has_failed(&self) -> bool {
        self.failure_reason.is_some()
    }
}

/// Reference to a Secret holding cloud API credentials
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the Secret
    pub name: String,
    /// Namespace of the Secret; defaults to the referencing object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Namespace to look the secret up in
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Reference to another Stratus object in the same or another namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object; defaults to the referencing object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}
