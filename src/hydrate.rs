//! Turning result rows into typed values.
//!
//! Columns are read by position following the plan's
//! [`ResultLayout`](crate::plan::ResultLayout). Rows of a plan with a collection fetch are
//! merged per owner: the first row of each owner keeps its position and
//! fetched elements are deduplicated by identifier.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use sqlx::any::AnyRow;
use sqlx_core::any::AnyTypeInfoKind;
use sqlx::{Column, Row, ValueRef};

use crate::error::{ExecutionError, OqlError};
use crate::plan::{
    CompiledPlan, DynamicResultType, EntityLayout, FetchLayout, FetchOwner, PropertyLayout,
    ReturnLayout,
};
use crate::types::{SemanticType, Value};

/// A loaded entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityInstance {
    pub entity: String,
    pub id: Value,
    pub properties: BTreeMap<String, ResultValue>,
    /// Collections populated by fetch joins.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, Vec<EntityInstance>>,
}

impl EntityInstance {
    pub fn get(&self, property: &str) -> Option<&ResultValue> {
        self.properties.get(property)
    }

    pub fn collection(&self, property: &str) -> Option<&[EntityInstance]> {
        self.collections.get(property).map(Vec::as_slice)
    }
}

/// One returned value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Scalar(Value),
    Component {
        component: String,
        fields: BTreeMap<String, Value>,
    },
    /// An entity known only by its identifier.
    Reference { entity: String, id: Value },
    Entity(EntityInstance),
}

impl ResultValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ResultValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityInstance> {
        match self {
            ResultValue::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    /// Identifier of an entity or reference.
    pub fn id(&self) -> Option<&Value> {
        match self {
            ResultValue::Entity(entity) => Some(&entity.id),
            ResultValue::Reference { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// The result of a `select new ...` query.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicInstance {
    pub kind: DynamicResultType,
    pub values: Vec<(Option<String>, ResultValue)>,
}

impl DynamicInstance {
    /// Value by alias, or by position for unaliased map entries.
    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.values
            .iter()
            .enumerate()
            .find(|(i, (alias, _))| match alias {
                Some(alias) => alias == key,
                None => i.to_string() == key,
            })
            .map(|(_, (_, value))| value)
    }
}

impl Serialize for DynamicInstance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.kind {
            DynamicResultType::List => {
                let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
                for (_, value) in &self.values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            DynamicResultType::Map | DynamicResultType::Named(_) => {
                let mut map = serializer.serialize_map(Some(self.values.len()))?;
                for (i, (alias, value)) in self.values.iter().enumerate() {
                    match alias {
                        Some(alias) => map.serialize_entry(alias, value)?,
                        None => map.serialize_entry(&i.to_string(), value)?,
                    }
                }
                map.end()
            }
        }
    }
}

/// One result of a select.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Single(ResultValue),
    Tuple(Vec<ResultValue>),
    Dynamic(DynamicInstance),
}

impl QueryResult {
    pub fn as_single(&self) -> Option<&ResultValue> {
        match self {
            QueryResult::Single(value) => Some(value),
            _ => None,
        }
    }

    /// Value at `index`, whatever the shape.
    pub fn get(&self, index: usize) -> Option<&ResultValue> {
        match self {
            QueryResult::Single(value) if index == 0 => Some(value),
            QueryResult::Single(_) => None,
            QueryResult::Tuple(values) => values.get(index),
            QueryResult::Dynamic(instance) => instance.values.get(index).map(|(_, v)| v),
        }
    }
}

/// Reads rows according to a plan's layout.
pub(crate) struct Hydrator<'p> {
    plan: &'p CompiledPlan,
}

impl<'p> Hydrator<'p> {
    pub fn new(plan: &'p CompiledPlan) -> Self {
        Self { plan }
    }

    pub fn row(&self, row: &AnyRow) -> Result<QueryResult, OqlError> {
        let values = self.row_values(row)?;
        Ok(self.shape(values))
    }

    /// Hydrate a full result, merging rows of collection fetches.
    pub fn rows(&self, rows: &[AnyRow]) -> Result<Vec<QueryResult>, OqlError> {
        if !self.plan.contains_collection_fetch() {
            return rows.iter().map(|row| self.row(row)).collect();
        }

        let mut merged: Vec<Vec<ResultValue>> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let values = self.row_values(row)?;
            let key = values.iter().map(identity).collect::<Vec<_>>().join("|");
            match seen.get(&key) {
                Some(index) => {
                    for (existing, value) in merged[*index].iter_mut().zip(values) {
                        merge_value(existing, value);
                    }
                }
                None => {
                    seen.insert(key, merged.len());
                    merged.push(values);
                }
            }
        }
        Ok(merged.into_iter().map(|values| self.shape(values)).collect())
    }

    fn row_values(&self, row: &AnyRow) -> Result<Vec<ResultValue>, OqlError> {
        let layout = self.plan.layout();
        let mut values = layout
            .returns
            .iter()
            .map(|ret| read_return(row, ret))
            .collect::<Result<Vec<_>, _>>()?;
        if layout.fetches.is_empty() {
            return Ok(values);
        }

        let mut fetched = layout
            .fetches
            .iter()
            .map(|fetch| read_entity(row, &fetch.layout, fetch.first_column))
            .collect::<Result<Vec<_>, _>>()?;
        // Children come after their parents, so attach back to front.
        for (k, fetch) in layout.fetches.iter().enumerate().rev() {
            let instance = fetched[k].take();
            match fetch.owner {
                FetchOwner::Fetch(parent) => {
                    if let Some(owner) = fetched[parent].as_mut() {
                        attach(owner, fetch, instance);
                    }
                }
                FetchOwner::Return(index) => {
                    if let Some(ResultValue::Entity(owner)) = values.get_mut(index) {
                        attach(owner, fetch, instance);
                    }
                }
            }
        }
        Ok(values)
    }

    fn shape(&self, mut values: Vec<ResultValue>) -> QueryResult {
        if let Some(kind) = self.plan.dynamic_result_type() {
            let aliases = self.plan.return_aliases().iter().cloned();
            return QueryResult::Dynamic(DynamicInstance {
                kind: kind.clone(),
                values: aliases.zip(values).collect(),
            });
        }
        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return QueryResult::Single(value);
            }
        }
        QueryResult::Tuple(values)
    }
}

fn attach(owner: &mut EntityInstance, fetch: &FetchLayout, instance: Option<EntityInstance>) {
    if fetch.collection {
        owner
            .collections
            .entry(fetch.property.clone())
            .or_default()
            .extend(instance);
    } else if let Some(instance) = instance {
        owner
            .properties
            .insert(fetch.property.clone(), ResultValue::Entity(instance));
    }
}

fn identity(value: &ResultValue) -> String {
    match value {
        ResultValue::Entity(entity) => format!("{}#{:?}", entity.entity, entity.id),
        ResultValue::Reference { entity, id } => format!("{}#{:?}", entity, id),
        other => format!("{:?}", other),
    }
}

fn merge_value(existing: &mut ResultValue, value: ResultValue) {
    if let (ResultValue::Entity(existing), ResultValue::Entity(value)) = (existing, value) {
        merge_instance(existing, value);
    }
}

fn merge_instance(existing: &mut EntityInstance, instance: EntityInstance) {
    for (name, elements) in instance.collections {
        let current = existing.collections.entry(name).or_default();
        for element in elements {
            match current.iter_mut().find(|e| e.id == element.id) {
                Some(found) => merge_instance(found, element),
                None => current.push(element),
            }
        }
    }
    for (name, value) in instance.properties {
        if let (Some(ResultValue::Entity(old)), ResultValue::Entity(new)) =
            (existing.properties.get_mut(&name), value)
        {
            if old.id == new.id {
                merge_instance(old, new);
            }
        }
    }
}

fn read_return(row: &AnyRow, layout: &ReturnLayout) -> Result<ResultValue, OqlError> {
    match layout {
        ReturnLayout::Scalar {
            semantic_type,
            column,
        } => Ok(ResultValue::Scalar(decode(row, *column, semantic_type)?)),
        ReturnLayout::Component {
            component,
            fields,
            first_column,
        } => read_component(row, component, fields, *first_column),
        ReturnLayout::Entity {
            layout,
            first_column,
        } => Ok(match read_entity(row, layout, *first_column)? {
            Some(instance) => ResultValue::Entity(instance),
            None => ResultValue::Scalar(Value::Null),
        }),
        ReturnLayout::Reference {
            entity,
            id_type,
            column,
        } => read_reference(row, entity, id_type, *column),
    }
}

/// `None` when the identifier column is null, as for an unmatched outer join.
fn read_entity(
    row: &AnyRow,
    layout: &EntityLayout,
    first_column: usize,
) -> Result<Option<EntityInstance>, OqlError> {
    let id = decode(row, first_column, &layout.id_type)?;
    if id.is_null() {
        return Ok(None);
    }

    let mut properties = BTreeMap::new();
    let mut column = first_column + 1;
    for property in &layout.properties {
        let (name, value) = match property {
            PropertyLayout::Basic {
                name,
                semantic_type,
            } => (name, ResultValue::Scalar(decode(row, column, semantic_type)?)),
            PropertyLayout::Component {
                name,
                component,
                fields,
            } => (name, read_component(row, component, fields, column)?),
            PropertyLayout::Reference {
                name,
                entity,
                id_type,
            } => (name, read_reference(row, entity, id_type, column)?),
        };
        properties.insert(name.clone(), value);
        column += property.width();
    }

    Ok(Some(EntityInstance {
        entity: layout.entity.clone(),
        id,
        properties,
        collections: BTreeMap::new(),
    }))
}

fn read_component(
    row: &AnyRow,
    component: &str,
    fields: &[(String, SemanticType)],
    first_column: usize,
) -> Result<ResultValue, OqlError> {
    let mut values = BTreeMap::new();
    for (offset, (name, semantic_type)) in fields.iter().enumerate() {
        values.insert(name.clone(), decode(row, first_column + offset, semantic_type)?);
    }
    if values.values().all(Value::is_null) {
        return Ok(ResultValue::Scalar(Value::Null));
    }
    Ok(ResultValue::Component {
        component: component.to_string(),
        fields: values,
    })
}

fn read_reference(
    row: &AnyRow,
    entity: &str,
    id_type: &SemanticType,
    column: usize,
) -> Result<ResultValue, OqlError> {
    let id = decode(row, column, id_type)?;
    if id.is_null() {
        return Ok(ResultValue::Scalar(Value::Null));
    }
    Ok(ResultValue::Reference {
        entity: entity.to_string(),
        id,
    })
}

fn column_name(row: &AnyRow, index: usize) -> String {
    row.columns()
        .get(index)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| index.to_string())
}

/// Read one column as the given type, tolerating the representations
/// drivers commonly use (integers for booleans, text for timestamps).
pub(crate) fn decode(row: &AnyRow, index: usize, semantic_type: &SemanticType) -> Result<Value, OqlError> {
    let hydration = |source: sqlx::Error| ExecutionError::Hydration {
        column: column_name(row, index),
        source,
    };

    // The Any driver reports nulls through the value's type, not `is_null`.
    let raw = row.try_get_raw(index).map_err(hydration)?;
    if raw.is_null() || raw.type_info().kind() == AnyTypeInfoKind::Null {
        return Ok(Value::Null);
    }

    let value = match semantic_type {
        SemanticType::Boolean => row
            .try_get::<bool, _>(index)
            .or_else(|_| row.try_get::<i64, _>(index).map(|n| n != 0))
            .map(Value::Bool),
        SemanticType::Integer | SemanticType::Entity(_) | SemanticType::Component(_) => row
            .try_get::<i64, _>(index)
            .or_else(|_| row.try_get::<i32, _>(index).map(i64::from))
            .map(Value::Int)
            .or_else(|_| row.try_get::<String, _>(index).map(Value::String)),
        SemanticType::Double => row
            .try_get::<f64, _>(index)
            .or_else(|_| row.try_get::<i64, _>(index).map(|n| n as f64))
            .map(Value::Float),
        SemanticType::String => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .or_else(|_| row.try_get::<i64, _>(index).map(|n| Value::String(n.to_string()))),
        SemanticType::Timestamp => {
            return match row.try_get::<String, _>(index) {
                Ok(text) => parse_timestamp(&text).map(Value::Timestamp).ok_or_else(|| {
                    ExecutionError::Conversion {
                        column: column_name(row, index),
                        message: format!("'{}' is not a timestamp", text),
                    }
                    .into()
                }),
                Err(_) => {
                    let seconds = row.try_get::<i64, _>(index).map_err(hydration)?;
                    DateTime::from_timestamp(seconds, 0)
                        .map(|t| Value::Timestamp(t.naive_utc()))
                        .ok_or_else(|| {
                            ExecutionError::Conversion {
                                column: column_name(row, index),
                                message: format!("{} is out of range", seconds),
                            }
                            .into()
                        })
                }
            };
        }
    };
    value.map_err(|e| hydration(e).into())
}

pub(crate) fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: i64, collections: Vec<(&str, Vec<EntityInstance>)>) -> EntityInstance {
        EntityInstance {
            entity: "Person".into(),
            id: Value::Int(id),
            properties: BTreeMap::new(),
            collections: collections
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn test_merge_deduplicates_elements() {
        let mut existing = instance(1, vec![("orders", vec![instance(10, vec![])])]);
        merge_instance(
            &mut existing,
            instance(1, vec![("orders", vec![instance(10, vec![]), instance(11, vec![])])]),
        );
        let ids: Vec<_> = existing.collections["orders"].iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, vec![Value::Int(10), Value::Int(11)]);
    }

    #[test]
    fn test_merge_nested_collections() {
        let mut existing = instance(
            1,
            vec![("orders", vec![instance(10, vec![("lines", vec![instance(100, vec![])])])])],
        );
        merge_instance(
            &mut existing,
            instance(
                1,
                vec![("orders", vec![instance(10, vec![("lines", vec![instance(101, vec![])])])])],
            ),
        );
        assert_eq!(existing.collections["orders"][0].collections["lines"].len(), 2);
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2024-03-01 10:20:30").is_some());
        assert!(parse_timestamp("2024-03-01T10:20:30.5").is_some());
        assert_eq!(
            parse_timestamp("2024-03-01"),
            NaiveDate::from_ymd_opt(2024, 3, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_dynamic_lookup_and_json() {
        let instance = DynamicInstance {
            kind: DynamicResultType::Map,
            values: vec![
                (Some("name".into()), ResultValue::Scalar(Value::from("Ann"))),
                (None, ResultValue::Scalar(Value::Int(3))),
            ],
        };
        assert_eq!(instance.get("1"), Some(&ResultValue::Scalar(Value::Int(3))));
        assert_eq!(
            serde_json::to_value(&instance).unwrap(),
            serde_json::json!({"name": "Ann", "1": 3})
        );
    }

    #[test]
    fn test_identity_keys() {
        let a = ResultValue::Entity(instance(1, vec![]));
        let b = ResultValue::Entity(instance(1, vec![("orders", vec![instance(2, vec![])])]));
        assert_eq!(identity(&a), identity(&b));
    }
}
