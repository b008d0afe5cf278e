//! Execution-time inputs: parameter values, row selection, lock mode and
//! enabled filters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ParamValue, Value};

/// Pessimistic lock requested for the selected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    None,
    Upgrade,
    UpgradeNoWait,
}

/// Pagination bounds for a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowSelection {
    pub first_result: Option<u64>,
    pub max_results: Option<u64>,
}

impl RowSelection {
    pub fn is_empty(&self) -> bool {
        self.first_result.unwrap_or(0) == 0 && self.max_results.is_none()
    }

    /// Apply the bounds to already materialized rows.
    pub fn apply<T>(&self, rows: Vec<T>) -> Vec<T> {
        let skip = self.first_result.unwrap_or(0) as usize;
        let take = self.max_results.map(|m| m as usize).unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }
}

/// Values bound for one execution.
///
/// # Example
///
/// ```rust
/// use oql::params::QueryParameters;
///
/// let params = QueryParameters::new()
///     .with("minAge", 18)
///     .with("names", vec!["Ann", "Bob"])
///     .max_results(10);
/// assert_eq!(params.named_names(), vec!["minAge", "names"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    named: BTreeMap<String, ParamValue>,
    ordinal: BTreeMap<u32, ParamValue>,
    selection: RowSelection,
    lock_mode: LockMode,
}

impl QueryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a named parameter (`:name`).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Bind an ordinal parameter (`?position`).
    pub fn with_ordinal(mut self, position: u32, value: impl Into<ParamValue>) -> Self {
        self.set_ordinal(position, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.named.insert(name.into(), value.into());
    }

    pub fn set_ordinal(&mut self, position: u32, value: impl Into<ParamValue>) {
        self.ordinal.insert(position, value.into());
    }

    pub fn first_result(mut self, first: u64) -> Self {
        self.selection.first_result = Some(first);
        self
    }

    pub fn max_results(mut self, max: u64) -> Self {
        self.selection.max_results = Some(max);
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn named(&self, name: &str) -> Option<&ParamValue> {
        self.named.get(name)
    }

    pub fn ordinal(&self, position: u32) -> Option<&ParamValue> {
        self.ordinal.get(&position)
    }

    pub fn named_values(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn ordinal_values(&self) -> impl Iterator<Item = (u32, &ParamValue)> {
        self.ordinal.iter().map(|(k, v)| (*k, v))
    }

    pub fn named_names(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }

    pub fn selection(&self) -> RowSelection {
        self.selection
    }

    pub fn get_lock_mode(&self) -> LockMode {
        self.lock_mode
    }
}

/// One enabled filter with its parameter values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnabledFilter {
    pub name: String,
    pub parameters: BTreeMap<String, Value>,
}

impl EnabledFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// The filters a translator was created with, by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnabledFilters {
    filters: BTreeMap<String, EnabledFilter>,
}

impl EnabledFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: EnabledFilter) -> Self {
        self.enable(filter);
        self
    }

    pub fn enable(&mut self, filter: EnabledFilter) {
        self.filters.insert(filter.name.clone(), filter);
    }

    pub fn get(&self, name: &str) -> Option<&EnabledFilter> {
        self.filters.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let params = QueryParameters::new()
            .with("name", "Ann")
            .with_ordinal(1, 42)
            .first_result(5)
            .lock_mode(LockMode::Upgrade);

        assert_eq!(params.named("name"), Some(&ParamValue::Single("Ann".into())));
        assert_eq!(params.ordinal(1), Some(&ParamValue::Single(Value::Int(42))));
        assert_eq!(params.ordinal(2), None);
        assert_eq!(params.selection().first_result, Some(5));
        assert_eq!(params.get_lock_mode(), LockMode::Upgrade);
    }

    #[test]
    fn test_selection_apply() {
        let selection = RowSelection {
            first_result: Some(1),
            max_results: Some(2),
        };
        assert_eq!(selection.apply(vec![1, 2, 3, 4]), vec![2, 3]);
        assert!(RowSelection::default().is_empty());
        assert!(!selection.is_empty());
    }

    #[test]
    fn test_enabled_filters() {
        let filters = EnabledFilters::new()
            .with(EnabledFilter::new("adults").with_parameter("minAge", 18));
        assert!(filters.is_enabled("adults"));
        assert_eq!(
            filters.get("adults").unwrap().parameters.get("minAge"),
            Some(&Value::Int(18))
        );
        assert_eq!(filters.names(), vec!["adults".to_string()]);
    }
}
