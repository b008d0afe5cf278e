//! Entity mapping model.
//!
//! The [`MappingResolver`] trait is the translator's only view of the domain
//! model: it turns entity names into tables, properties into columns and
//! associations into join structure. [`Metamodel`] is the in-memory
//! implementation, built programmatically or loaded from TOML.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{MappingError, OqlError};
use crate::types::SemanticType;

/// Resolves entity names against the mapping model.
pub trait MappingResolver: Send + Sync {
    /// Look up an entity by name.
    fn entity(&self, name: &str) -> Result<&EntityMapping, MappingError>;

    /// Names of all mapped entities.
    fn entity_names(&self) -> Vec<&str>;
}

/// A mapped entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub name: String,
    pub table: String,
    pub identifier: IdentifierMapping,
    pub properties: Vec<PropertyMapping>,
    pub filters: Vec<FilterMapping>,
}

/// The single-column identifier of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierMapping {
    pub name: String,
    pub column: String,
    pub semantic_type: SemanticType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMapping {
    pub name: String,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Basic {
        column: String,
        semantic_type: SemanticType,
    },
    Component {
        component: String,
        fields: Vec<ComponentField>,
    },
    ManyToOne {
        target: String,
        column: String,
    },
    /// Key column lives in the target table.
    OneToMany {
        target: String,
        key_column: String,
    },
    ManyToMany {
        target: String,
        table: String,
        key_column: String,
        element_column: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentField {
    pub name: String,
    pub column: String,
    pub semantic_type: SemanticType,
}

/// A named SQL predicate that can be enabled per translator.
///
/// `{alias}` in the condition is replaced with the entity's table alias and
/// `:name` references one of `parameters`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMapping {
    pub name: String,
    pub condition: String,
    pub parameters: BTreeMap<String, SemanticType>,
}

impl EntityMapping {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        identifier: IdentifierMapping,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identifier,
            properties: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_filter(mut self, filter: FilterMapping) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn identifier(&self) -> &IdentifierMapping {
        &self.identifier
    }

    pub fn property(&self, name: &str) -> Result<&PropertyMapping, MappingError> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| MappingError::unknown_property(&self.name, name))
    }

    pub fn has_property(&self, name: &str) -> bool {
        name == self.identifier.name || self.properties.iter().any(|p| p.name == name)
    }

    pub fn filter(&self, name: &str) -> Option<&FilterMapping> {
        self.filters.iter().find(|f| f.name == name)
    }

    /// Unqualified entity name, lower-cased and truncated, used as a table alias stem.
    pub fn alias_stem(&self) -> String {
        let simple = self.name.rsplit('.').next().unwrap_or(&self.name);
        simple
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(10)
            .collect::<String>()
            .to_lowercase()
    }
}

impl IdentifierMapping {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        semantic_type: SemanticType,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            semantic_type,
        }
    }
}

impl PropertyMapping {
    pub fn basic(
        name: impl Into<String>,
        column: impl Into<String>,
        semantic_type: SemanticType,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Basic {
                column: column.into(),
                semantic_type,
            },
        }
    }

    pub fn component(
        name: impl Into<String>,
        component: impl Into<String>,
        fields: Vec<ComponentField>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Component {
                component: component.into(),
                fields,
            },
        }
    }

    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::ManyToOne {
                target: target.into(),
                column: column.into(),
            },
        }
    }

    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::OneToMany {
                target: target.into(),
                key_column: key_column.into(),
            },
        }
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::ManyToMany {
                target: target.into(),
                table: table.into(),
                key_column: key_column.into(),
                element_column: element_column.into(),
            },
        }
    }
}

impl PropertyKind {
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. }
        )
    }

    /// Target entity of an association.
    pub fn target(&self) -> Option<&str> {
        match self {
            PropertyKind::ManyToOne { target, .. }
            | PropertyKind::OneToMany { target, .. }
            | PropertyKind::ManyToMany { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl ComponentField {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        semantic_type: SemanticType,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            semantic_type,
        }
    }
}

impl FilterMapping {
    pub fn new(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, semantic_type: SemanticType) -> Self {
        self.parameters.insert(name.into(), semantic_type);
        self
    }
}

/// In-memory mapping model.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: BTreeMap<String, EntityMapping>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityMapping) -> Self {
        self.add_entity(entity);
        self
    }

    pub fn add_entity(&mut self, entity: EntityMapping) {
        self.entities.insert(entity.name.clone(), entity);
    }

    /// Check that every association points at a mapped entity and that
    /// property names are unique.
    pub fn validate(&self) -> Result<(), MappingError> {
        for entity in self.entities.values() {
            let mut seen = vec![entity.identifier.name.as_str()];
            for property in &entity.properties {
                if seen.contains(&property.name.as_str()) {
                    return Err(MappingError::invalid(
                        &entity.name,
                        format!("duplicate property '{}'", property.name),
                    ));
                }
                seen.push(property.name.as_str());

                if let Some(target) = property.kind.target() {
                    if !self.entities.contains_key(target) {
                        return Err(MappingError::invalid(
                            &entity.name,
                            format!(
                                "association '{}' targets unknown entity '{}'",
                                property.name, target
                            ),
                        ));
                    }
                }
                if let PropertyKind::Component { fields, .. } = &property.kind {
                    if fields.is_empty() {
                        return Err(MappingError::invalid(
                            &entity.name,
                            format!("component '{}' has no fields", property.name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Load and validate a mapping from TOML text.
    pub fn from_toml_str(input: &str) -> Result<Self, OqlError> {
        let file: MappingFile = toml::from_str(input)
            .map_err(|e| OqlError::Config(format!("invalid mapping file: {}", e)))?;

        let mut model = Metamodel::new();
        for entity in file.entities {
            model.add_entity(entity.into_mapping()?);
        }
        model.validate()?;
        Ok(model)
    }

    /// Load and validate a mapping from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OqlError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

impl MappingResolver for Metamodel {
    fn entity(&self, name: &str) -> Result<&EntityMapping, MappingError> {
        if let Some(entity) = self.entities.get(name) {
            return Ok(entity);
        }
        // Qualified names resolve by their last segment.
        let simple = name.rsplit('.').next().unwrap_or(name);
        self.entities
            .get(simple)
            .ok_or_else(|| MappingError::UnknownEntity {
                entity: name.to_string(),
            })
    }

    fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default, rename = "entity")]
    entities: Vec<EntityConfig>,
}

#[derive(Debug, Deserialize)]
struct EntityConfig {
    name: String,
    table: Option<String>,
    id: IdConfig,
    #[serde(default, rename = "property")]
    properties: Vec<PropertyConfig>,
    #[serde(default, rename = "filter")]
    filters: Vec<FilterConfig>,
}

#[derive(Debug, Deserialize)]
struct IdConfig {
    name: String,
    column: Option<String>,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct PropertyConfig {
    name: String,
    column: Option<String>,
    #[serde(rename = "type")]
    type_name: Option<String>,
    component: Option<String>,
    fields: Option<Vec<FieldConfig>>,
    many_to_one: Option<String>,
    one_to_many: Option<String>,
    many_to_many: Option<String>,
    table: Option<String>,
    key_column: Option<String>,
    element_column: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FieldConfig {
    name: String,
    column: Option<String>,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct FilterConfig {
    name: String,
    condition: String,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

fn semantic_type(entity: &str, type_name: &str) -> Result<SemanticType, MappingError> {
    SemanticType::from_name(type_name)
        .ok_or_else(|| MappingError::invalid(entity, format!("unknown type '{}'", type_name)))
}

fn required<'a>(
    entity: &str,
    property: &str,
    key: &str,
    value: &'a Option<String>,
) -> Result<&'a str, MappingError> {
    value.as_deref().ok_or_else(|| {
        MappingError::invalid(entity, format!("property '{}' is missing '{}'", property, key))
    })
}

impl EntityConfig {
    fn into_mapping(self) -> Result<EntityMapping, MappingError> {
        let name = self.name;
        let table = self.table.unwrap_or_else(|| name.to_lowercase());
        let identifier = IdentifierMapping::new(
            &self.id.name,
            self.id.column.as_deref().unwrap_or(&self.id.name),
            semantic_type(&name, &self.id.type_name)?,
        );

        let mut entity = EntityMapping::new(&name, table, identifier);
        for property in self.properties {
            entity.properties.push(property.into_mapping(&name)?);
        }
        for filter in self.filters {
            let mut mapping = FilterMapping::new(filter.name, filter.condition);
            for (param, type_name) in filter.parameters {
                mapping = mapping.with_parameter(param, semantic_type(&name, &type_name)?);
            }
            entity.filters.push(mapping);
        }
        Ok(entity)
    }
}

impl PropertyConfig {
    fn into_mapping(self, entity: &str) -> Result<PropertyMapping, MappingError> {
        let name = self.name.as_str();
        let column = self.column.clone().unwrap_or_else(|| name.to_string());

        let kind = if let Some(target) = &self.many_to_one {
            PropertyKind::ManyToOne {
                target: target.clone(),
                column,
            }
        } else if let Some(target) = &self.one_to_many {
            PropertyKind::OneToMany {
                target: target.clone(),
                key_column: required(entity, name, "key_column", &self.key_column)?.to_string(),
            }
        } else if let Some(target) = &self.many_to_many {
            PropertyKind::ManyToMany {
                target: target.clone(),
                table: required(entity, name, "table", &self.table)?.to_string(),
                key_column: required(entity, name, "key_column", &self.key_column)?.to_string(),
                element_column: required(entity, name, "element_column", &self.element_column)?
                    .to_string(),
            }
        } else if let Some(component) = &self.component {
            let mut fields = Vec::new();
            for field in self.fields.iter().flatten() {
                fields.push(ComponentField::new(
                    &field.name,
                    field.column.as_deref().unwrap_or(&field.name),
                    semantic_type(entity, &field.type_name)?,
                ));
            }
            PropertyKind::Component {
                component: component.clone(),
                fields,
            }
        } else {
            let type_name = required(entity, name, "type", &self.type_name)?;
            PropertyKind::Basic {
                column,
                semantic_type: semantic_type(entity, type_name)?,
            }
        };

        Ok(PropertyMapping {
            name: self.name,
            kind,
        })
    }
}

/// The domain model shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn sample_metamodel() -> Metamodel {
    use SemanticType::*;

    let person = EntityMapping::new("Person", "person", IdentifierMapping::new("id", "id", Integer))
        .with_property(PropertyMapping::basic("name", "name", String))
        .with_property(PropertyMapping::basic("age", "age", Integer))
        .with_property(PropertyMapping::component(
            "address",
            "Address",
            vec![
                ComponentField::new("street", "street", String),
                ComponentField::new("city", "city", String),
            ],
        ))
        .with_property(PropertyMapping::many_to_one("employer", "Company", "employer_id"))
        .with_property(PropertyMapping::one_to_many("orders", "Order", "person_id"))
        .with_property(PropertyMapping::many_to_many(
            "tags",
            "Tag",
            "person_tag",
            "person_id",
            "tag_id",
        ))
        .with_filter(
            FilterMapping::new("adults", "{alias}.age >= :minAge").with_parameter("minAge", Integer),
        );

    let company = EntityMapping::new("Company", "company", IdentifierMapping::new("id", "id", Integer))
        .with_property(PropertyMapping::basic("name", "name", String));

    let order = EntityMapping::new("Order", "orders", IdentifierMapping::new("id", "id", Integer))
        .with_property(PropertyMapping::basic("total", "total", Double))
        .with_property(PropertyMapping::basic("paid", "paid", Boolean))
        .with_property(PropertyMapping::many_to_one("customer", "Person", "person_id"));

    let tag = EntityMapping::new("Tag", "tag", IdentifierMapping::new("id", "id", Integer))
        .with_property(PropertyMapping::basic("label", "label", String));

    Metamodel::new()
        .with_entity(person)
        .with_entity(company)
        .with_entity(order)
        .with_entity(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAPPING: &str = r#"
        [[entity]]
        name = "Person"
        table = "person"
        id = { name = "id", type = "integer" }

        [[entity.property]]
        name = "name"
        type = "string"

        [[entity.property]]
        name = "employer"
        many_to_one = "Company"
        column = "employer_id"

        [[entity.property]]
        name = "address"
        component = "Address"
        fields = [{ name = "city", type = "string" }]

        [[entity.filter]]
        name = "named"
        condition = "{alias}.name = :name"
        parameters = { name = "string" }

        [[entity]]
        name = "Company"
        id = { name = "id", column = "company_id", type = "long" }
    "#;

    #[test]
    fn test_load_from_toml() {
        let model = Metamodel::from_toml_str(MAPPING).unwrap();
        assert_eq!(model.entity_names(), vec!["Company", "Person"]);

        let person = model.entity("Person").unwrap();
        assert_eq!(person.table, "person");
        assert_eq!(
            person.property("employer").unwrap().kind,
            PropertyKind::ManyToOne {
                target: "Company".into(),
                column: "employer_id".into()
            }
        );
        assert_eq!(
            person.filter("named").unwrap().parameters.get("name"),
            Some(&SemanticType::String)
        );

        let company = model.entity("Company").unwrap();
        assert_eq!(company.table, "company");
        assert_eq!(company.identifier().column, "company_id");
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let input = r#"
            [[entity]]
            name = "Person"
            id = { name = "id", type = "integer" }

            [[entity.property]]
            name = "employer"
            many_to_one = "Company"
        "#;
        let err = Metamodel::from_toml_str(input).unwrap_err();
        assert!(matches!(err, OqlError::Mapping(MappingError::Invalid { .. })));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let input = r#"
            [[entity]]
            name = "Person"
            id = { name = "id", type = "uuid" }
        "#;
        assert!(Metamodel::from_toml_str(input).is_err());
    }

    #[test]
    fn test_lookup_errors() {
        let model = sample_metamodel();
        assert_eq!(
            model.entity("Nobody").unwrap_err(),
            MappingError::UnknownEntity {
                entity: "Nobody".into()
            }
        );
        assert!(model.entity("com.acme.Person").is_ok());
        assert_eq!(
            model.entity("Person").unwrap().property("salary").unwrap_err(),
            MappingError::unknown_property("Person", "salary")
        );
    }

    #[test]
    fn test_alias_stem() {
        let model = sample_metamodel();
        assert_eq!(model.entity("Person").unwrap().alias_stem(), "person");
    }
}
