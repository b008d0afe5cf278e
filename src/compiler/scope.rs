//! From-clause elements, table aliases and path resolution.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{Lowering, PendingParam, SqlBuffer};
use crate::ast::JoinKind;
use crate::error::{MappingError, OqlError};
use crate::mapping::PropertyKind;
use crate::plan::ParameterSource;
use crate::types::SemanticType;

static FILTER_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":[A-Za-z_][A-Za-z0-9_]*").expect("filter parameter pattern is valid")
});

/// A table taking part in the statement.
#[derive(Debug)]
pub(super) struct FromElement {
    pub entity: String,
    pub table: String,
    /// `None` in bulk statements, where columns stay unqualified.
    pub sql_alias: Option<String>,
    pub origin: Origin,
}

#[derive(Debug)]
pub(super) enum Origin {
    Root,
    Join {
        parent: usize,
        property: String,
        kind: JoinKind,
        /// Join table of a many-to-many association and its alias.
        link: Option<(String, String)>,
        condition: Option<SqlBuffer>,
    },
}

#[derive(Debug, Default)]
pub(super) struct Scope {
    pub elements: Vec<FromElement>,
    pub roots: Vec<usize>,
    pub bulk: bool,
    aliases: BTreeMap<String, usize>,
    implicit: BTreeMap<(usize, String), usize>,
    counter: usize,
}

impl Scope {
    pub fn next_alias(&mut self, stem: &str) -> String {
        let alias = format!("{}{}_", stem, self.counter);
        self.counter += 1;
        alias
    }

    pub fn element(&self, index: usize) -> &FromElement {
        &self.elements[index]
    }

    fn root_of(&self, mut index: usize) -> usize {
        while let Origin::Join { parent, .. } = self.elements[index].origin {
            index = parent;
        }
        index
    }
}

/// What a property path denotes.
#[derive(Debug, Clone)]
pub(super) enum Resolved {
    Column {
        sql: String,
        semantic_type: SemanticType,
    },
    Component {
        component: String,
        columns: Vec<String>,
        fields: Vec<(String, SemanticType)>,
    },
    Entity(usize),
    /// A many-to-one that has not been joined: only its foreign key is known.
    Reference {
        owner: usize,
        property: String,
        target: String,
        fk_sql: String,
    },
    Collection {
        owner: usize,
        property: String,
    },
}

fn table_stem(table: &str) -> String {
    table
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(10)
        .collect::<String>()
        .to_lowercase()
}

impl Lowering<'_> {
    pub(super) fn add_root(&mut self, entity: &str, alias: Option<&str>) -> Result<usize, OqlError> {
        let mapping = self.entity(entity)?;
        let sql_alias = if self.scope.bulk {
            None
        } else {
            Some(self.scope.next_alias(&mapping.alias_stem()))
        };
        self.query_spaces.insert(mapping.table.clone());

        let index = self.push_element(
            FromElement {
                entity: mapping.name.clone(),
                table: mapping.table.clone(),
                sql_alias,
                origin: Origin::Root,
            },
            alias,
        )?;
        self.scope.roots.push(index);
        Ok(index)
    }

    pub(super) fn add_join(
        &mut self,
        parent: usize,
        property: &str,
        kind: JoinKind,
        alias: Option<&str>,
    ) -> Result<usize, OqlError> {
        let owner = self.entity(&self.scope.element(parent).entity)?;
        let association = owner.property(property)?;
        let target = association
            .kind
            .target()
            .ok_or_else(|| MappingError::NotAnAssociation {
                entity: owner.name.clone(),
                property: property.to_string(),
            })?;
        let target = self.entity(target)?;

        let link = match &association.kind {
            PropertyKind::ManyToMany { table, .. } => {
                self.query_spaces.insert(table.clone());
                Some((table.clone(), self.scope.next_alias(&table_stem(table))))
            }
            _ => None,
        };
        let sql_alias = Some(self.scope.next_alias(&target.alias_stem()));
        self.query_spaces.insert(target.table.clone());

        self.push_element(
            FromElement {
                entity: target.name.clone(),
                table: target.table.clone(),
                sql_alias,
                origin: Origin::Join {
                    parent,
                    property: property.to_string(),
                    kind,
                    link,
                    condition: None,
                },
            },
            alias,
        )
    }

    fn push_element(&mut self, element: FromElement, alias: Option<&str>) -> Result<usize, OqlError> {
        let index = self.scope.elements.len();
        if let Some(alias) = alias {
            if self.scope.aliases.contains_key(alias) {
                return Err(self.invalid(format!("alias '{}' is already defined", alias)));
            }
            self.scope.aliases.insert(alias.to_string(), index);
        }
        self.scope.elements.push(element);
        Ok(index)
    }

    /// Join a many-to-one dereferenced in an expression, reusing earlier
    /// implicit joins of the same association.
    pub(super) fn implicit_join(
        &mut self,
        owner: usize,
        property: &str,
        path: &[String],
    ) -> Result<usize, OqlError> {
        if self.scope.bulk {
            return Err(self.invalid(format!(
                "implicit join not allowed in bulk manipulation [{}]",
                path.join(".")
            )));
        }
        let key = (owner, property.to_string());
        if let Some(index) = self.scope.implicit.get(&key) {
            return Ok(*index);
        }
        let index = self.add_join(owner, property, JoinKind::Inner, None)?;
        self.scope.implicit.insert(key, index);
        Ok(index)
    }

    /// Column reference as it appears in the statement.
    pub(super) fn qualify(&self, element: usize, column: &str) -> String {
        match &self.scope.element(element).sql_alias {
            Some(alias) => format!("{}.{}", alias, column),
            None => column.to_string(),
        }
    }

    /// Column reference usable from inside a subquery.
    pub(super) fn qualify_outer(&self, element: usize, column: &str) -> String {
        let element = self.scope.element(element);
        let qualifier = element.sql_alias.as_deref().unwrap_or(&element.table);
        format!("{}.{}", qualifier, column)
    }

    fn sole_root(&self, path: &[String]) -> Result<usize, OqlError> {
        match self.scope.roots.as_slice() {
            [root] => Ok(*root),
            _ => Err(self.invalid(format!("Could not resolve path '{}'", path.join(".")))),
        }
    }

    /// Resolve a dotted path; a leading alias selects its element, otherwise
    /// the path starts at the only root.
    pub(super) fn resolve_path(&mut self, path: &[String]) -> Result<Resolved, OqlError> {
        let (start, rest) = match path.first().and_then(|first| self.scope.aliases.get(first)) {
            Some(element) => (*element, &path[1..]),
            None => (self.sole_root(path)?, path),
        };

        let mut current = Resolved::Entity(start);
        for segment in rest {
            current = match current {
                Resolved::Entity(element) => self.resolve_property(element, segment)?,
                Resolved::Reference {
                    owner,
                    property,
                    target,
                    fk_sql,
                } => {
                    let target = self.entity(&target)?;
                    if *segment == target.identifier.name {
                        Resolved::Column {
                            sql: fk_sql,
                            semantic_type: target.identifier.semantic_type.clone(),
                        }
                    } else {
                        let joined = self.implicit_join(owner, &property, path)?;
                        self.resolve_property(joined, segment)?
                    }
                }
                Resolved::Component {
                    component,
                    columns,
                    fields,
                } => {
                    let index = fields
                        .iter()
                        .position(|(name, _)| name == segment)
                        .ok_or_else(|| MappingError::unknown_property(&component, segment))?;
                    Resolved::Column {
                        sql: columns[index].clone(),
                        semantic_type: fields[index].1.clone(),
                    }
                }
                Resolved::Collection { .. } => {
                    return Err(self.invalid(format!(
                        "illegal attempt to dereference collection [{}]",
                        path.join(".")
                    )));
                }
                Resolved::Column { .. } => {
                    return Err(self.invalid(format!(
                        "cannot dereference scalar property [{}]",
                        path.join(".")
                    )));
                }
            };
        }
        Ok(current)
    }

    fn resolve_property(&mut self, element: usize, name: &str) -> Result<Resolved, OqlError> {
        let mapping = self.entity(&self.scope.element(element).entity)?;
        if name == mapping.identifier.name {
            return Ok(Resolved::Column {
                sql: self.qualify(element, &mapping.identifier.column),
                semantic_type: mapping.identifier.semantic_type.clone(),
            });
        }

        let property = mapping.property(name)?;
        Ok(match &property.kind {
            PropertyKind::Basic {
                column,
                semantic_type,
            } => Resolved::Column {
                sql: self.qualify(element, column),
                semantic_type: semantic_type.clone(),
            },
            PropertyKind::Component { component, fields } => Resolved::Component {
                component: component.clone(),
                columns: fields.iter().map(|f| self.qualify(element, &f.column)).collect(),
                fields: fields
                    .iter()
                    .map(|f| (f.name.clone(), f.semantic_type.clone()))
                    .collect(),
            },
            PropertyKind::ManyToOne { target, column } => Resolved::Reference {
                owner: element,
                property: name.to_string(),
                target: target.clone(),
                fk_sql: self.qualify(element, column),
            },
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. } => {
                Resolved::Collection {
                    owner: element,
                    property: name.to_string(),
                }
            }
        })
    }

    /// Owner element and property name of an explicit join path.
    pub(super) fn join_owner(&mut self, path: &[String]) -> Result<(usize, String), OqlError> {
        let Some((property, prefix)) = path.split_last() else {
            return Err(self.invalid("empty join path"));
        };
        if prefix.is_empty() {
            return Ok((self.sole_root(path)?, property.clone()));
        }
        match self.resolve_path(prefix)? {
            Resolved::Entity(element) => Ok((element, property.clone())),
            Resolved::Reference {
                owner, property: reference, ..
            } => Ok((self.implicit_join(owner, &reference, prefix)?, property.clone())),
            _ => Err(self.invalid(format!(
                "join path [{}] does not start at an entity",
                path.join(".")
            ))),
        }
    }

    /// Attach a rendered `with` condition to a join.
    pub(super) fn add_join_condition(&mut self, element: usize, extra: SqlBuffer) {
        if let Origin::Join { condition, .. } = &mut self.scope.elements[element].origin {
            match condition {
                Some(existing) => {
                    existing.push_str(" and ");
                    existing.append(extra);
                }
                None => *condition = Some(extra),
            }
        }
    }

    /// Render the enabled filters defined on the element's entity.
    pub(super) fn filter_condition(&mut self, element: usize) -> Result<Option<SqlBuffer>, OqlError> {
        let mapping = self.entity(&self.scope.element(element).entity)?;
        let qualifier = {
            let element = self.scope.element(element);
            element.sql_alias.clone().unwrap_or_else(|| element.table.clone())
        };

        let mut conditions = Vec::new();
        for filter in mapping.filters.iter().filter(|f| self.filters.is_enabled(&f.name)) {
            let text = filter.condition.replace("{alias}", &qualifier);
            let mut buffer = SqlBuffer::new();
            let mut last = 0;
            for found in FILTER_PARAM.find_iter(&text) {
                let name = &found.as_str()[1..];
                let semantic_type = filter.parameters.get(name).ok_or_else(|| {
                    MappingError::invalid(
                        &mapping.name,
                        format!("filter '{}' uses undeclared parameter '{}'", filter.name, name),
                    )
                })?;
                buffer.push_str(&text[last..found.start()]);
                buffer.push_param(PendingParam {
                    source: ParameterSource::Synthesized {
                        filter: filter.name.clone(),
                        parameter: name.to_string(),
                    },
                    semantic_type: semantic_type.clone(),
                    expandable: false,
                });
                last = found.end();
            }
            buffer.push_str(&text[last..]);
            conditions.push(buffer);
        }

        Ok(if conditions.is_empty() {
            None
        } else {
            Some(SqlBuffer::join(conditions, " and "))
        })
    }

    /// Render the from clause, each root followed by its joins.
    pub(super) fn from_clause(&mut self) -> Result<SqlBuffer, OqlError> {
        let mut ranges = Vec::new();
        for root in self.scope.roots.clone() {
            let element = self.scope.element(root);
            let mut range = SqlBuffer::text(match &element.sql_alias {
                Some(alias) => format!("{} {}", element.table, alias),
                None => element.table.clone(),
            });
            for index in 0..self.scope.elements.len() {
                if index != root && self.scope.root_of(index) == root {
                    range.append(self.join_sql(index)?);
                }
            }
            ranges.push(range);
        }
        Ok(SqlBuffer::join(ranges, ", "))
    }

    fn join_sql(&mut self, index: usize) -> Result<SqlBuffer, OqlError> {
        let element = &self.scope.elements[index];
        let Origin::Join {
            parent,
            property,
            kind,
            link,
            ..
        } = &element.origin
        else {
            return Ok(SqlBuffer::new());
        };
        let keyword = match kind {
            JoinKind::Inner => " inner join ",
            JoinKind::Left => " left outer join ",
        };

        let owner = self.entity(&self.scope.element(*parent).entity)?;
        let target = self.entity(&element.entity)?;
        let alias = element.sql_alias.clone().unwrap_or_else(|| element.table.clone());
        let owner_id = self.qualify(*parent, &owner.identifier.column);

        let sql = match (&owner.property(property)?.kind, link) {
            (PropertyKind::ManyToOne { column, .. }, _) => format!(
                "{}{} {} on {} = {}.{}",
                keyword,
                element.table,
                alias,
                self.qualify(*parent, column),
                alias,
                target.identifier.column
            ),
            (PropertyKind::OneToMany { key_column, .. }, _) => format!(
                "{}{} {} on {} = {}.{}",
                keyword, element.table, alias, owner_id, alias, key_column
            ),
            (
                PropertyKind::ManyToMany {
                    key_column,
                    element_column,
                    ..
                },
                Some((link_table, link_alias)),
            ) => format!(
                "{kw}{lt} {la} on {owner_id} = {la}.{key}{kw}{table} {alias} on {la}.{elem} = {alias}.{id}",
                kw = keyword,
                lt = link_table,
                la = link_alias,
                owner_id = owner_id,
                key = key_column,
                table = element.table,
                alias = alias,
                elem = element_column,
                id = target.identifier.column
            ),
            _ => {
                return Err(MappingError::NotAnAssociation {
                    entity: owner.name.clone(),
                    property: property.clone(),
                }
                .into());
            }
        };

        let mut buffer = SqlBuffer::text(sql);
        if let Origin::Join {
            condition: Some(condition),
            ..
        } = &mut self.scope.elements[index].origin
        {
            buffer.push_str(" and ");
            buffer.append(std::mem::take(condition));
        }
        Ok(buffer)
    }
}
