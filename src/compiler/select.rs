//! Lowering of select statements.

use std::collections::BTreeMap;

use tracing::debug;

use super::scope::Resolved;
use super::{Lowered, Lowering, SelectShape, SqlBuffer};
use crate::ast::{Expr, InstantiationTarget, Projection, SelectItem, SelectStatement, SortOrder};
use crate::error::OqlError;
use crate::mapping::PropertyKind;
use crate::plan::{
    DynamicResultType, EntityLayout, FetchLayout, FetchOwner, PlanKind, PropertyLayout,
    ReturnLayout,
};
use crate::types::SemanticType;

/// One selected value before rendering.
enum SelectTarget<'s> {
    Element(usize),
    Expr(&'s Expr),
}

/// Columns and layout of one selected value.
struct Selected {
    columns: Vec<SqlBuffer>,
    layout: ReturnLayout,
    semantic_type: SemanticType,
    /// Set when a full entity of this element is selected.
    element: Option<usize>,
}

impl Lowering<'_> {
    pub(super) fn lower_select(&mut self, stmt: &SelectStatement) -> Result<Lowered, OqlError> {
        // Elements joined with `fetch`, in declaration order.
        let mut fetch_joins = Vec::new();
        // Entities of the implicit projection.
        let mut implicit = Vec::new();

        for range in &stmt.from {
            let root = self.add_root(&range.entity, range.alias.as_deref())?;
            implicit.push(root);

            for join in &range.joins {
                let (owner, property) = self.join_owner(&join.path)?;
                let element = self.add_join(owner, &property, join.kind, join.alias.as_deref())?;
                if let Some(condition) = &join.condition {
                    let rendered = self.expr(condition, Some(&SemanticType::Boolean))?;
                    self.add_join_condition(element, rendered.sql);
                }

                if join.fetch && self.shallow {
                    debug!(path = %join.path.join("."), "fetch join degraded in shallow query");
                    implicit.push(element);
                } else if join.fetch {
                    fetch_joins.push((element, owner, property));
                } else {
                    implicit.push(element);
                }
            }
        }

        let (distinct, targets, aliases, dynamic_result_type) = match &stmt.select {
            None => (
                false,
                implicit.into_iter().map(SelectTarget::Element).collect::<Vec<_>>(),
                Vec::new(),
                None,
            ),
            Some(clause) => {
                let (items, dynamic) = match &clause.projection {
                    Projection::Items(items) => (items, None),
                    Projection::New { target, items } => (
                        items,
                        Some(match target {
                            InstantiationTarget::Map => DynamicResultType::Map,
                            InstantiationTarget::List => DynamicResultType::List,
                            InstantiationTarget::Named(name) => DynamicResultType::Named(name.clone()),
                        }),
                    ),
                };
                (
                    clause.distinct,
                    items.iter().map(|i: &SelectItem| SelectTarget::Expr(&i.expr)).collect(),
                    items.iter().map(|i| i.alias.clone()).collect(),
                    dynamic,
                )
            }
        };

        let mut shape = SelectShape {
            dynamic_result_type,
            ..SelectShape::default()
        };
        let mut select_list = Vec::new();
        let mut next_column = 0;
        let mut selected_elements = BTreeMap::new();

        for (i, target) in targets.iter().enumerate() {
            let selected = self.select_target(target, next_column)?;
            let labels: Vec<String> = (0..selected.columns.len())
                .map(|j| format!("col_{}_{}_", i, j))
                .collect();
            for (column, label) in selected.columns.into_iter().zip(&labels) {
                let mut item = column;
                item.push_str(&format!(" as {}", label));
                select_list.push(item);
            }
            next_column += labels.len();
            if let Some(element) = selected.element {
                selected_elements.entry(element).or_insert(i);
            }

            shape.return_types.push(selected.semantic_type);
            shape
                .return_aliases
                .push(aliases.get(i).cloned().flatten());
            shape.column_names.push(labels);
            shape.layout.returns.push(selected.layout);
        }

        let mut contains_collection_fetch = false;
        let mut fetched_elements = BTreeMap::new();
        for (k, (element, owner_element, property)) in fetch_joins.into_iter().enumerate() {
            let owner = match (
                selected_elements.get(&owner_element),
                fetched_elements.get(&owner_element),
            ) {
                (Some(i), _) => FetchOwner::Return(*i),
                (None, Some(f)) => FetchOwner::Fetch(*f),
                (None, None) => {
                    return Err(self.invalid(
                        "query specified join fetching, but the owner of the fetched association was not present in the select list",
                    ));
                }
            };
            let owner_entity = self.entity(&self.scope.element(owner_element).entity)?;
            let collection = owner_entity.property(&property)?.kind.is_collection();
            contains_collection_fetch |= collection;

            let (columns, layout) = self.entity_columns(element)?;
            let width = layout.width();
            for (j, column) in columns.into_iter().enumerate() {
                let mut item = SqlBuffer::text(column);
                item.push_str(&format!(" as fetch_{}_{}_", k, j));
                select_list.push(item);
            }
            shape.layout.fetches.push(FetchLayout {
                owner,
                property,
                collection,
                layout,
                first_column: next_column,
            });
            next_column += width;
            fetched_elements.insert(element, k);
        }

        let where_clause = match &stmt.where_clause {
            Some(condition) => Some(self.expr(condition, Some(&SemanticType::Boolean))?.sql),
            None => None,
        };
        let group_by = stmt
            .group_by
            .iter()
            .map(|e| Ok(self.expr(e, None)?.sql))
            .collect::<Result<Vec<_>, OqlError>>()?;
        let having = match &stmt.having {
            Some(condition) => Some(self.expr(condition, Some(&SemanticType::Boolean))?.sql),
            None => None,
        };
        let mut order_by = Vec::new();
        for item in &stmt.order_by {
            let mut rendered = self.expr(&item.expr, None)?.sql;
            if item.order == SortOrder::Desc {
                rendered.push_str(" desc");
            }
            order_by.push(rendered);
        }

        let where_clause = self.apply_filters(where_clause)?;
        let from = self.from_clause()?;

        let mut sql = SqlBuffer::text(if distinct { "select distinct " } else { "select " });
        sql.append(SqlBuffer::join(select_list, ", "));
        sql.push_str(" from ");
        sql.append(from);
        if let Some(condition) = where_clause {
            sql.push_str(" where ");
            sql.append(condition);
        }
        if !group_by.is_empty() {
            sql.push_str(" group by ");
            sql.append(SqlBuffer::join(group_by, ", "));
        }
        if let Some(condition) = having {
            sql.push_str(" having ");
            sql.append(condition);
        }
        if !order_by.is_empty() {
            sql.push_str(" order by ");
            sql.append(SqlBuffer::join(order_by, ", "));
        }

        Ok(Lowered {
            kind: PlanKind::Select {
                contains_collection_fetch,
            },
            statements: vec![sql],
            query_spaces: std::mem::take(&mut self.query_spaces),
            shape,
        })
    }

    /// Add enabled filters: root filters restrict the where clause, join
    /// filters extend the join condition.
    fn apply_filters(&mut self, where_clause: Option<SqlBuffer>) -> Result<Option<SqlBuffer>, OqlError> {
        let mut root_filters = Vec::new();
        for element in 0..self.scope.elements.len() {
            let Some(condition) = self.filter_condition(element)? else {
                continue;
            };
            if self.scope.roots.contains(&element) {
                root_filters.push(condition);
            } else {
                self.add_join_condition(element, condition);
            }
        }
        if root_filters.is_empty() {
            return Ok(where_clause);
        }

        let mut combined = SqlBuffer::new();
        if let Some(user) = where_clause {
            combined.push_str("(");
            combined.append(user);
            combined.push_str(") and ");
        }
        combined.append(SqlBuffer::join(root_filters, " and "));
        Ok(Some(combined))
    }

    fn select_target(&mut self, target: &SelectTarget<'_>, first_column: usize) -> Result<Selected, OqlError> {
        let expr = match target {
            SelectTarget::Element(element) => return self.select_entity(*element, first_column),
            SelectTarget::Expr(expr) => *expr,
        };

        let Expr::Path(path) = expr else {
            let (sql, semantic_type) = self.typed_expr(expr)?;
            return Ok(scalar(sql, semantic_type, first_column));
        };

        match self.resolve_path(path)? {
            Resolved::Column { sql, semantic_type } => {
                Ok(scalar(SqlBuffer::text(sql), semantic_type, first_column))
            }
            Resolved::Entity(element) => self.select_entity(element, first_column),
            Resolved::Reference {
                owner,
                property,
                target,
                fk_sql,
            } => {
                if self.shallow {
                    let id_type = self.entity(&target)?.identifier.semantic_type.clone();
                    return Ok(Selected {
                        columns: vec![SqlBuffer::text(fk_sql)],
                        layout: ReturnLayout::Reference {
                            entity: target.clone(),
                            id_type,
                            column: first_column,
                        },
                        semantic_type: SemanticType::Entity(target),
                        element: None,
                    });
                }
                let joined = self.implicit_join(owner, &property, path)?;
                self.select_entity(joined, first_column)
            }
            Resolved::Component {
                component,
                columns,
                fields,
            } => Ok(Selected {
                columns: columns.into_iter().map(SqlBuffer::text).collect(),
                layout: ReturnLayout::Component {
                    component: component.clone(),
                    fields,
                    first_column,
                },
                semantic_type: SemanticType::Component(component),
                element: None,
            }),
            Resolved::Collection { .. } => Err(self.invalid(format!(
                "illegal attempt to dereference collection [{}]",
                path.join(".")
            ))),
        }
    }

    fn select_entity(&mut self, element: usize, first_column: usize) -> Result<Selected, OqlError> {
        let entity = self.scope.element(element).entity.clone();
        if self.shallow {
            let mapping = self.entity(&entity)?;
            return Ok(Selected {
                columns: vec![SqlBuffer::text(
                    self.qualify(element, &mapping.identifier.column),
                )],
                layout: ReturnLayout::Reference {
                    entity: entity.clone(),
                    id_type: mapping.identifier.semantic_type.clone(),
                    column: first_column,
                },
                semantic_type: SemanticType::Entity(entity),
                element: None,
            });
        }

        let (columns, layout) = self.entity_columns(element)?;
        Ok(Selected {
            columns: columns.into_iter().map(SqlBuffer::text).collect(),
            layout: ReturnLayout::Entity {
                layout,
                first_column,
            },
            semantic_type: SemanticType::Entity(entity),
            element: Some(element),
        })
    }

    /// Identifier and property columns of an element.
    fn entity_columns(&self, element: usize) -> Result<(Vec<String>, EntityLayout), OqlError> {
        let mapping = self.entity(&self.scope.element(element).entity)?;
        let mut columns = vec![self.qualify(element, &mapping.identifier.column)];
        let mut properties = Vec::new();

        for property in &mapping.properties {
            match &property.kind {
                PropertyKind::Basic {
                    column,
                    semantic_type,
                } => {
                    columns.push(self.qualify(element, column));
                    properties.push(PropertyLayout::Basic {
                        name: property.name.clone(),
                        semantic_type: semantic_type.clone(),
                    });
                }
                PropertyKind::Component { component, fields } => {
                    columns.extend(fields.iter().map(|f| self.qualify(element, &f.column)));
                    properties.push(PropertyLayout::Component {
                        name: property.name.clone(),
                        component: component.clone(),
                        fields: fields
                            .iter()
                            .map(|f| (f.name.clone(), f.semantic_type.clone()))
                            .collect(),
                    });
                }
                PropertyKind::ManyToOne { target, column } => {
                    columns.push(self.qualify(element, column));
                    properties.push(PropertyLayout::Reference {
                        name: property.name.clone(),
                        entity: target.clone(),
                        id_type: self.entity(target)?.identifier.semantic_type.clone(),
                    });
                }
                PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. } => {}
            }
        }

        Ok((
            columns,
            EntityLayout {
                entity: mapping.name.clone(),
                id_type: mapping.identifier.semantic_type.clone(),
                properties,
            },
        ))
    }
}

fn scalar(sql: SqlBuffer, semantic_type: SemanticType, column: usize) -> Selected {
    Selected {
        columns: vec![sql],
        layout: ReturnLayout::Scalar {
            semantic_type: semantic_type.clone(),
            column,
        },
        semantic_type,
        element: None,
    }
}
