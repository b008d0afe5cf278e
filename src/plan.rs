//! The compiled, immutable form of a query.
//!
//! A [`CompiledPlan`] holds the generated SQL together with everything needed
//! to bind parameters and hydrate rows without looking at the query text or
//! the mapping model again.

use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::fmt;

use serde::Serialize;

use crate::dialect::SqlGenerator;
use crate::error::BindingError;
use crate::params::QueryParameters;
use crate::types::{ParamValue, SemanticType};

/// What a plan does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanKind {
    Select { contains_collection_fetch: bool },
    Manipulation(ManipulationKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManipulationKind {
    Update,
    Delete,
}

impl PlanKind {
    pub fn name(&self) -> &'static str {
        match self {
            PlanKind::Select { .. } => "select",
            PlanKind::Manipulation(ManipulationKind::Update) => "update",
            PlanKind::Manipulation(ManipulationKind::Delete) => "delete",
        }
    }
}

/// Result shape requested with `select new ...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DynamicResultType {
    Map,
    List,
    Named(String),
}

/// Piece of a generated statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlFragment {
    Text(String),
    /// Index into [`CompiledPlan::parameter_bindings`].
    Placeholder(usize),
}

/// One generated SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlStatement {
    fragments: Vec<SqlFragment>,
    sql: String,
}

impl SqlStatement {
    pub(crate) fn new(fragments: Vec<SqlFragment>, generator: &dyn SqlGenerator) -> Self {
        let mut statement = Self {
            fragments,
            sql: String::new(),
        };
        statement.sql = statement.render(generator, |_| 1);
        statement
    }

    /// The statement text with one placeholder per binding.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Binding indexes used by this statement, in placeholder order.
    pub fn bindings(&self) -> impl Iterator<Item = usize> + '_ {
        self.fragments.iter().filter_map(|f| match f {
            SqlFragment::Placeholder(index) => Some(*index),
            SqlFragment::Text(_) => None,
        })
    }

    /// Render the statement, emitting `arity(binding)` comma separated
    /// placeholders for each binding.
    pub(crate) fn render(
        &self,
        generator: &dyn SqlGenerator,
        arity: impl Fn(usize) -> usize,
    ) -> String {
        let mut sql = String::new();
        let mut next = 1;
        for fragment in &self.fragments {
            match fragment {
                SqlFragment::Text(text) => sql.push_str(text),
                SqlFragment::Placeholder(index) => {
                    let placeholders: Vec<String> = (0..arity(*index).max(1))
                        .map(|_| {
                            let p = generator.placeholder(next);
                            next += 1;
                            p
                        })
                        .collect();
                    sql.push_str(&placeholders.join(", "));
                }
            }
        }
        sql
    }
}

/// Where a placeholder's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParameterSource {
    Named(String),
    Ordinal(u32),
    /// Created by compilation, e.g. an enabled filter's parameter.
    Synthesized { filter: String, parameter: String },
}

impl fmt::Display for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSource::Named(name) => write!(f, ":{}", name),
            ParameterSource::Ordinal(position) => write!(f, "?{}", position),
            ParameterSource::Synthesized { filter, parameter } => {
                write!(f, "{}.{}", filter, parameter)
            }
        }
    }
}

/// One placeholder of the generated SQL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterBinding {
    pub source: ParameterSource,
    pub semantic_type: SemanticType,
    /// Sits in an `in (...)` list and accepts multiple values.
    pub expandable: bool,
    /// Index of the statement containing the placeholder.
    pub statement: usize,
}

/// Description of one query parameter, aggregated over its occurrences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    /// Indexes into the plan's parameter bindings.
    pub positions: Vec<usize>,
    pub semantic_type: SemanticType,
    pub expandable: bool,
}

/// Query parameter names and ordinals mapped to their placeholders.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParameterTranslations {
    pub named: BTreeMap<String, ParameterInfo>,
    pub ordinal: BTreeMap<u32, ParameterInfo>,
    #[serde(skip)]
    query: String,
}

impl ParameterTranslations {
    pub(crate) fn from_bindings(query: &str, bindings: &[ParameterBinding]) -> Self {
        let mut translations = Self {
            query: query.to_string(),
            ..Self::default()
        };
        for (index, binding) in bindings.iter().enumerate() {
            match &binding.source {
                ParameterSource::Named(name) => {
                    register(translations.named.entry(name.clone()), index, binding)
                }
                ParameterSource::Ordinal(position) => {
                    register(translations.ordinal.entry(*position), index, binding)
                }
                ParameterSource::Synthesized { .. } => {}
            }
        }
        translations
    }

    pub fn named_names(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }

    /// Check supplied values against the parameters the query declares.
    pub fn validate(&self, params: &QueryParameters) -> Result<(), BindingError> {
        for (name, _) in params.named_values() {
            if !self.named.contains_key(name) {
                return Err(BindingError::UnknownNamed {
                    name: name.to_string(),
                });
            }
        }
        for (position, _) in params.ordinal_values() {
            if !self.ordinal.contains_key(&position) {
                return Err(BindingError::UnknownOrdinal {
                    position,
                    query: self.query.clone(),
                });
            }
        }
        for name in self.named.keys() {
            if params.named(name).is_none() {
                return Err(BindingError::MissingNamed {
                    name: name.clone(),
                    query: self.query.clone(),
                });
            }
        }
        for position in self.ordinal.keys() {
            if params.ordinal(*position).is_none() {
                return Err(BindingError::MissingOrdinal {
                    position: *position,
                    query: self.query.clone(),
                });
            }
        }

        let supplied = params
            .named_values()
            .map(|(name, value)| (ParameterSource::Named(name.to_string()), &self.named[name], value))
            .chain(params.ordinal_values().map(|(position, value)| {
                (ParameterSource::Ordinal(position), &self.ordinal[&position], value)
            }));
        for (source, info, value) in supplied {
            if let ParamValue::List(values) = value {
                if !info.expandable {
                    return Err(BindingError::UnexpectedList {
                        parameter: source.to_string(),
                    });
                }
                if values.is_empty() {
                    return Err(BindingError::EmptyList {
                        parameter: source.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn register<K: Ord>(
    entry: btree_map::Entry<'_, K, ParameterInfo>,
    index: usize,
    binding: &ParameterBinding,
) {
    let info = entry.or_insert_with(|| ParameterInfo {
        positions: Vec::new(),
        semantic_type: binding.semantic_type.clone(),
        expandable: true,
    });
    info.positions.push(index);
    info.expandable &= binding.expandable;
}

/// How the columns of one row turn into results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultLayout {
    pub returns: Vec<ReturnLayout>,
    /// Parents always precede their children.
    pub fetches: Vec<FetchLayout>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnLayout {
    Scalar {
        semantic_type: SemanticType,
        column: usize,
    },
    Component {
        component: String,
        fields: Vec<(String, SemanticType)>,
        first_column: usize,
    },
    Entity {
        layout: EntityLayout,
        first_column: usize,
    },
    /// Identifier only, for shallow plans.
    Reference {
        entity: String,
        id_type: SemanticType,
        column: usize,
    },
}

/// Columns of a fully selected entity: the identifier, then each property.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityLayout {
    pub entity: String,
    pub id_type: SemanticType,
    pub properties: Vec<PropertyLayout>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyLayout {
    Basic {
        name: String,
        semantic_type: SemanticType,
    },
    Component {
        name: String,
        component: String,
        fields: Vec<(String, SemanticType)>,
    },
    /// Many-to-one foreign key.
    Reference {
        name: String,
        entity: String,
        id_type: SemanticType,
    },
}

impl PropertyLayout {
    pub fn width(&self) -> usize {
        match self {
            PropertyLayout::Component { fields, .. } => fields.len(),
            _ => 1,
        }
    }
}

impl EntityLayout {
    pub fn width(&self) -> usize {
        1 + self.properties.iter().map(PropertyLayout::width).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOwner {
    Return(usize),
    Fetch(usize),
}

/// An association populated by a `join fetch`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchLayout {
    pub owner: FetchOwner,
    pub property: String,
    pub collection: bool,
    pub layout: EntityLayout,
    pub first_column: usize,
}

/// The result of compiling one query.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPlan {
    pub(crate) query_identifier: String,
    pub(crate) query_string: String,
    pub(crate) enabled_filters: Vec<String>,
    pub(crate) shallow: bool,
    pub(crate) kind: PlanKind,
    pub(crate) query_spaces: BTreeSet<String>,
    pub(crate) statements: Vec<SqlStatement>,
    pub(crate) parameter_bindings: Vec<ParameterBinding>,
    pub(crate) parameter_translations: ParameterTranslations,
    pub(crate) return_types: Vec<SemanticType>,
    pub(crate) return_aliases: Vec<Option<String>>,
    pub(crate) column_names: Vec<Vec<String>>,
    pub(crate) dynamic_result_type: Option<DynamicResultType>,
    #[serde(skip)]
    pub(crate) layout: ResultLayout,
}

impl CompiledPlan {
    pub fn query_identifier(&self) -> &str {
        &self.query_identifier
    }

    /// The query text as given, before substitution.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn enabled_filters(&self) -> &[String] {
        &self.enabled_filters
    }

    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn is_manipulation(&self) -> bool {
        matches!(self.kind, PlanKind::Manipulation(_))
    }

    pub fn contains_collection_fetch(&self) -> bool {
        matches!(
            self.kind,
            PlanKind::Select {
                contains_collection_fetch: true
            }
        )
    }

    /// Tables read or written by the plan.
    pub fn query_spaces(&self) -> &BTreeSet<String> {
        &self.query_spaces
    }

    /// The primary (last) statement.
    pub fn sql(&self) -> &str {
        self.statements.last().map(SqlStatement::sql).unwrap_or_default()
    }

    pub fn statements(&self) -> &[SqlStatement] {
        &self.statements
    }

    pub fn sql_statements(&self) -> Vec<&str> {
        self.statements.iter().map(SqlStatement::sql).collect()
    }

    pub fn parameter_bindings(&self) -> &[ParameterBinding] {
        &self.parameter_bindings
    }

    pub fn parameter_translations(&self) -> &ParameterTranslations {
        &self.parameter_translations
    }

    pub fn return_types(&self) -> &[SemanticType] {
        &self.return_types
    }

    pub fn return_aliases(&self) -> &[Option<String>] {
        &self.return_aliases
    }

    pub fn column_names(&self) -> &[Vec<String>] {
        &self.column_names
    }

    pub fn dynamic_result_type(&self) -> Option<&DynamicResultType> {
        self.dynamic_result_type.as_ref()
    }

    pub(crate) fn layout(&self) -> &ResultLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    fn binding(source: ParameterSource, expandable: bool) -> ParameterBinding {
        ParameterBinding {
            source,
            semantic_type: SemanticType::Integer,
            expandable,
            statement: 0,
        }
    }

    #[test]
    fn test_render_expands_placeholders() {
        let statement = SqlStatement::new(
            vec![
                SqlFragment::Text("select x from t where a = ".into()),
                SqlFragment::Placeholder(0),
                SqlFragment::Text(" and b in (".into()),
                SqlFragment::Placeholder(1),
                SqlFragment::Text(")".into()),
            ],
            Dialect::Postgres.generator().as_ref(),
        );
        assert_eq!(statement.sql(), "select x from t where a = $1 and b in ($2)");

        let generator = Dialect::Postgres.generator();
        let expanded = statement.render(generator.as_ref(), |i| if i == 1 { 3 } else { 1 });
        assert_eq!(expanded, "select x from t where a = $1 and b in ($2, $3, $4)");
        assert_eq!(statement.bindings().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_translations_group_positions() {
        let bindings = vec![
            binding(ParameterSource::Named("a".into()), false),
            binding(ParameterSource::Ordinal(1), true),
            binding(ParameterSource::Named("a".into()), false),
            binding(
                ParameterSource::Synthesized {
                    filter: "f".into(),
                    parameter: "p".into(),
                },
                false,
            ),
        ];
        let translations = ParameterTranslations::from_bindings("q", &bindings);
        assert_eq!(translations.named["a"].positions, vec![0, 2]);
        assert!(translations.ordinal[&1].expandable);
        assert_eq!(translations.named_names(), vec!["a"]);
    }

    #[test]
    fn test_validate_order() {
        let bindings = vec![
            binding(ParameterSource::Named("a".into()), false),
            binding(ParameterSource::Ordinal(1), true),
        ];
        let translations = ParameterTranslations::from_bindings("q", &bindings);

        let unknown = QueryParameters::new().with("zzz", 1).with_ordinal(7, 1);
        assert!(matches!(
            translations.validate(&unknown),
            Err(BindingError::UnknownNamed { name }) if name == "zzz"
        ));

        let unknown_ordinal = QueryParameters::new().with_ordinal(7, 1);
        assert!(matches!(
            translations.validate(&unknown_ordinal),
            Err(BindingError::UnknownOrdinal { position: 7, .. })
        ));

        let missing = QueryParameters::new();
        assert!(matches!(
            translations.validate(&missing),
            Err(BindingError::MissingNamed { name, .. }) if name == "a"
        ));

        let missing_ordinal = QueryParameters::new().with("a", 1);
        assert!(matches!(
            translations.validate(&missing_ordinal),
            Err(BindingError::MissingOrdinal { position: 1, .. })
        ));

        let list = QueryParameters::new().with("a", vec![1, 2]).with_ordinal(1, 1);
        assert!(matches!(
            translations.validate(&list),
            Err(BindingError::UnexpectedList { .. })
        ));

        let empty = QueryParameters::new()
            .with("a", 1)
            .with_ordinal(1, Vec::<i64>::new());
        assert!(matches!(
            translations.validate(&empty),
            Err(BindingError::EmptyList { .. })
        ));

        let ok = QueryParameters::new().with("a", 1).with_ordinal(1, vec![1, 2]);
        assert!(translations.validate(&ok).is_ok());
    }
}
