//! End-to-end tests against an in-memory SQLite database.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::TryStreamExt;
use oql::prelude::*;
use pretty_assertions::assert_eq;
use sqlx::{AnyConnection, Connection, Row};

const MAPPING: &str = include_str!("fixtures/mapping.toml");

const SCHEMA: &[&str] = &[
    "create table company (id integer primary key, name text not null)",
    "create table person (id integer primary key, name text not null, age integer, \
     street text, city text, employer_id integer)",
    "create table orders (id integer primary key, total real, paid integer, person_id integer)",
    "create table tag (id integer primary key, label text)",
    "create table person_tag (person_id integer, tag_id integer)",
    "insert into company values (1, 'Acme'), (2, 'Globex')",
    "insert into person values \
     (1, 'Ann', 34, 'Main St', 'Springfield', 1), \
     (2, 'Bob', 17, null, null, null), \
     (3, 'Cy', 52, 'Elm St', 'Shelbyville', 2), \
     (4, 'Dee', 25, 'Oak St', 'Springfield', 1)",
    "insert into orders values (10, 99.5, 1, 1), (11, 20.0, 0, 1), (12, 5.0, 1, 3)",
    "insert into tag values (1, 'vip'), (2, 'new')",
    "insert into person_tag values (1, 1), (1, 2), (3, 1)",
];

async fn connect() -> OqlResult<AnyConnection> {
    sqlx::any::install_default_drivers();
    let mut conn = AnyConnection::connect("sqlite::memory:")
        .await
        .map_err(|e| ExecutionError::statement("connect", e))?;
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut conn)
            .await
            .map_err(|e| ExecutionError::statement(*statement, e))?;
    }
    Ok(conn)
}

fn factory() -> TranslatorFactory {
    let model = Metamodel::from_toml_str(MAPPING).expect("fixture mapping is valid");
    TranslatorFactory::new(Arc::new(model), Dialect::Sqlite)
}

fn compiled(query: &str) -> Translator {
    compiled_with(query, EnabledFilters::new(), false)
}

fn compiled_with(query: &str, filters: EnabledFilters, shallow: bool) -> Translator {
    let mut translator = factory().create_translator("test", query, filters);
    translator
        .compile(&BTreeMap::new(), shallow)
        .expect("query compiles");
    translator
}

fn strings(results: &[QueryResult]) -> Vec<String> {
    results
        .iter()
        .map(|r| match r {
            QueryResult::Single(ResultValue::Scalar(Value::String(s))) => s.clone(),
            other => panic!("expected a string, got {:?}", other),
        })
        .collect()
}

#[tokio::test]
async fn test_list_with_named_parameter() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator =
        compiled("select p.name from Person p where p.age >= :minAge order by p.name");

    let results = translator
        .list(&mut conn, &QueryParameters::new().with("minAge", 18))
        .await?;
    assert_eq!(strings(&results), vec!["Ann", "Cy", "Dee"]);
    Ok(())
}

#[tokio::test]
async fn test_missing_parameter_fails_before_execution() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("from Person p where p.age >= :minAge");

    let err = translator
        .list(&mut conn, &QueryParameters::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OqlError::Binding(BindingError::MissingNamed { ref name, .. }) if name == "minAge"
    ));
    Ok(())
}

#[tokio::test]
async fn test_unknown_parameter_is_rejected() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("from Person p where p.age >= :minAge");

    let params = QueryParameters::new().with("minAge", 18).with("maxAge", 60);
    let err = translator.list(&mut conn, &params).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Named parameter does not appear in Query: maxAge"
    );
    Ok(())
}

#[tokio::test]
async fn test_entity_hydration() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("from Person p where p.id in (:ids) order by p.id");

    let results = translator
        .list(&mut conn, &QueryParameters::new().with("ids", vec![1, 2]))
        .await?;
    assert_eq!(results.len(), 2);

    let ann = results[0].as_single().and_then(ResultValue::as_entity).unwrap();
    assert_eq!(ann.id, Value::Int(1));
    assert_eq!(ann.get("name"), Some(&ResultValue::Scalar(Value::from("Ann"))));
    assert_eq!(
        ann.get("employer"),
        Some(&ResultValue::Reference {
            entity: "Company".into(),
            id: Value::Int(1)
        })
    );
    match ann.get("address") {
        Some(ResultValue::Component { component, fields }) => {
            assert_eq!(component, "Address");
            assert_eq!(fields["city"], Value::from("Springfield"));
        }
        other => panic!("expected address component, got {:?}", other),
    }

    let bob = results[1].as_single().and_then(ResultValue::as_entity).unwrap();
    assert_eq!(bob.get("address"), Some(&ResultValue::Scalar(Value::Null)));
    assert_eq!(bob.get("employer"), Some(&ResultValue::Scalar(Value::Null)));
    Ok(())
}

#[tokio::test]
async fn test_collection_fetch_merges_rows() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator =
        compiled("select p from Person p left join fetch p.orders o order by p.id, o.id");
    assert!(translator.plan()?.contains_collection_fetch());

    let results = translator.list(&mut conn, &QueryParameters::new()).await?;
    let people: Vec<&EntityInstance> = results
        .iter()
        .filter_map(|r| r.as_single().and_then(ResultValue::as_entity))
        .collect();
    assert_eq!(people.len(), 4);

    let order_ids = |person: &EntityInstance| -> Vec<Value> {
        person
            .collection("orders")
            .unwrap_or_default()
            .iter()
            .map(|o| o.id.clone())
            .collect()
    };
    assert_eq!(order_ids(people[0]), vec![Value::Int(10), Value::Int(11)]);
    assert_eq!(order_ids(people[1]), Vec::<Value>::new());
    assert_eq!(order_ids(people[2]), vec![Value::Int(12)]);

    let first = &people[0].collection("orders").unwrap()[0];
    assert_eq!(first.get("paid"), Some(&ResultValue::Scalar(Value::Bool(true))));
    assert_eq!(first.get("total"), Some(&ResultValue::Scalar(Value::Float(99.5))));
    Ok(())
}

#[tokio::test]
async fn test_collection_fetch_paginates_in_memory() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator =
        compiled("select p from Person p left join fetch p.orders o order by p.id, o.id");

    let results = translator
        .list(&mut conn, &QueryParameters::new().max_results(1))
        .await?;
    assert_eq!(results.len(), 1);
    let ann = results[0].as_single().and_then(ResultValue::as_entity).unwrap();
    assert_eq!(ann.collection("orders").map(<[_]>::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_fetch_cannot_be_scrolled() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("from Person p join fetch p.orders o");

    let err = translator
        .scroll(&mut conn, &QueryParameters::new())
        .await
        .err()
        .unwrap();
    assert_eq!(
        err.to_string(),
        "fetch may not be used with scroll() or iterate()"
    );
    assert!(translator
        .iterate(&mut conn, &QueryParameters::new())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_execute_update_and_wrong_mode() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("delete Person p where p.age < :cutoff");
    assert_eq!(translator.plan()?.sql_statements().len(), 2);

    let affected = translator
        .execute_update(&mut conn, &QueryParameters::new().with("cutoff", 10))
        .await?;
    assert_eq!(affected, 0);

    let err = translator
        .list(&mut conn, &QueryParameters::new().with("cutoff", 10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OqlError::Query(QueryError::WrongMode { operation: "list", .. })
    ));

    let select = compiled("from Person");
    assert!(select
        .execute_update(&mut conn, &QueryParameters::new())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_delete_cleans_up_join_table() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("delete Person p where p.id = :id");

    let affected = translator
        .execute_update(&mut conn, &QueryParameters::new().with("id", 1))
        .await?;
    assert_eq!(affected, 1);

    let row = sqlx::query("select count(*) from person_tag")
        .fetch_one(&mut conn)
        .await
        .map_err(|e| ExecutionError::statement("count", e))?;
    assert_eq!(row.get::<i64, _>(0), 1);
    Ok(())
}

#[tokio::test]
async fn test_bulk_update() -> OqlResult<()> {
    let mut conn = connect().await?;
    let update = compiled("update Person set age = age + 1 where name = :name");
    let affected = update
        .execute_update(&mut conn, &QueryParameters::new().with("name", "Bob"))
        .await?;
    assert_eq!(affected, 1);

    let age = compiled("select p.age from Person p where p.name = 'Bob'");
    let results = age.list(&mut conn, &QueryParameters::new()).await?;
    assert_eq!(
        results,
        vec![QueryResult::Single(ResultValue::Scalar(Value::Int(18)))]
    );
    Ok(())
}

#[tokio::test]
async fn test_list_parameter_expansion_and_pagination() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("select p.name from Person p where p.id in (:ids) order by p.name");

    let params = QueryParameters::new().with("ids", vec![1, 3, 4]);
    let results = translator.list(&mut conn, &params).await?;
    assert_eq!(strings(&results), vec!["Ann", "Cy", "Dee"]);

    let page = translator
        .list(&mut conn, &params.clone().first_result(1).max_results(1))
        .await?;
    assert_eq!(strings(&page), vec!["Cy"]);

    // The plan itself keeps a single placeholder.
    assert!(translator.plan()?.sql().contains("in (?)"));
    Ok(())
}

#[tokio::test]
async fn test_enabled_filter_restricts_results() -> OqlResult<()> {
    let mut conn = connect().await?;
    let filters =
        EnabledFilters::new().with(EnabledFilter::new("adults").with_parameter("minAge", 30));
    let translator = compiled_with("select p.name from Person p order by p.name", filters, false);

    let results = translator.list(&mut conn, &QueryParameters::new()).await?;
    assert_eq!(strings(&results), vec!["Ann", "Cy"]);
    assert_eq!(translator.plan()?.enabled_filters(), ["adults".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_iterate_streams_rows() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("select p.name, p.age from Person p order by p.id");

    let results: Vec<QueryResult> = translator
        .iterate(&mut conn, &QueryParameters::new())
        .await?
        .try_collect()
        .await?;
    assert_eq!(results.len(), 4);
    assert_eq!(
        results[1],
        QueryResult::Tuple(vec![
            ResultValue::Scalar(Value::from("Bob")),
            ResultValue::Scalar(Value::Int(17)),
        ])
    );
    Ok(())
}

#[tokio::test]
async fn test_scroll_navigation() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("select p.name from Person p order by p.id");
    let mut cursor = translator.scroll(&mut conn, &QueryParameters::new()).await?;

    let name = |cursor: &ScrollableResults<'_>| -> Option<String> {
        match cursor.get()? {
            QueryResult::Single(ResultValue::Scalar(Value::String(s))) => Some(s.clone()),
            _ => None,
        }
    };

    assert_eq!(cursor.get(), None);
    assert!(cursor.next().await?);
    assert!(cursor.is_first());
    assert_eq!(name(&cursor).as_deref(), Some("Ann"));

    assert!(cursor.last().await?);
    assert_eq!(cursor.row_number(), Some(3));
    assert_eq!(name(&cursor).as_deref(), Some("Dee"));
    assert!(cursor.is_last().await?);

    assert!(cursor.previous().await?);
    assert_eq!(name(&cursor).as_deref(), Some("Cy"));

    assert!(cursor.set_row_number(-4).await?);
    assert_eq!(name(&cursor).as_deref(), Some("Ann"));

    assert!(cursor.scroll(1).await?);
    assert_eq!(name(&cursor).as_deref(), Some("Bob"));

    assert!(!cursor.set_row_number(10).await?);
    assert_eq!(cursor.get(), None);

    cursor.after_last().await?;
    assert!(cursor.previous().await?);
    assert_eq!(name(&cursor).as_deref(), Some("Dee"));

    cursor.before_first();
    assert!(!cursor.previous().await?);
    cursor.close();
    assert!(!cursor.next().await?);
    Ok(())
}

#[tokio::test]
async fn test_dynamic_map_and_aggregates() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator =
        compiled("select new map(p.name as name, p.age as age) from Person p where p.id = 1");
    let results = translator.list(&mut conn, &QueryParameters::new()).await?;
    match &results[0] {
        QueryResult::Dynamic(instance) => {
            assert_eq!(instance.get("name"), Some(&ResultValue::Scalar(Value::from("Ann"))));
            assert_eq!(instance.get("age"), Some(&ResultValue::Scalar(Value::Int(34))));
        }
        other => panic!("expected a map, got {:?}", other),
    }

    let stats = compiled("select count(*), avg(p.age) from Person p");
    let results = stats.list(&mut conn, &QueryParameters::new()).await?;
    assert_eq!(
        results,
        vec![QueryResult::Tuple(vec![
            ResultValue::Scalar(Value::Int(4)),
            ResultValue::Scalar(Value::Float(32.0)),
        ])]
    );
    Ok(())
}

#[tokio::test]
async fn test_joins_and_path_expressions() -> OqlResult<()> {
    let mut conn = connect().await?;

    let tags = compiled(
        "select t.label from Person p join p.tags t where p.name = :name order by t.label",
    );
    let results = tags
        .list(&mut conn, &QueryParameters::new().with("name", "Ann"))
        .await?;
    assert_eq!(strings(&results), vec!["new", "vip"]);

    let employees =
        compiled("select p.name from Person p where p.employer.name = :company order by p.name");
    let results = employees
        .list(&mut conn, &QueryParameters::new().with("company", "Acme"))
        .await?;
    assert_eq!(strings(&results), vec!["Ann", "Dee"]);

    let without_orders = compiled("select p.name from Person p where p.orders is empty order by p.name");
    let results = without_orders.list(&mut conn, &QueryParameters::new()).await?;
    assert_eq!(strings(&results), vec!["Bob", "Dee"]);
    Ok(())
}

#[tokio::test]
async fn test_ordinal_parameters() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("select p.name from Person p where p.age > ?1 and p.age < ?2 order by p.name");

    let params = QueryParameters::new().with_ordinal(1, 20).with_ordinal(2, 40);
    let results = translator.list(&mut conn, &params).await?;
    assert_eq!(strings(&results), vec!["Ann", "Dee"]);

    let err = translator
        .list(&mut conn, &QueryParameters::new().with_ordinal(1, 20))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OqlError::Binding(BindingError::MissingOrdinal { position: 2, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_shallow_returns_references() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled_with("from Person p order by p.id", EnabledFilters::new(), true);

    let results = translator
        .list(&mut conn, &QueryParameters::new().max_results(2))
        .await?;
    assert_eq!(
        results,
        vec![
            QueryResult::Single(ResultValue::Reference {
                entity: "Person".into(),
                id: Value::Int(1)
            }),
            QueryResult::Single(ResultValue::Reference {
                entity: "Person".into(),
                id: Value::Int(2)
            }),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_translators_share_sql() -> OqlResult<()> {
    let query = "select p.name from Person p where p.age >= :minAge";
    let a = compiled(query);
    let b = compiled(query);
    assert_eq!(a.plan()?.sql(), b.plan()?.sql());
    assert_eq!(
        a.plan()?.parameter_translations().named_names(),
        vec!["minAge"]
    );
    Ok(())
}

#[tokio::test]
async fn test_null_columns_hydrate_as_null() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator =
        compiled("select p.address.city, p.address, p.age from Person p where p.name = 'Bob'");

    let results = translator.list(&mut conn, &QueryParameters::new()).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get(0), Some(&ResultValue::Scalar(Value::Null)));
    assert_eq!(results[0].get(1), Some(&ResultValue::Scalar(Value::Null)));
    assert_eq!(results[0].get(2), Some(&ResultValue::Scalar(Value::Int(17))));
    Ok(())
}

#[tokio::test]
async fn test_manipulation_cannot_be_iterated_or_scrolled() -> OqlResult<()> {
    let mut conn = connect().await?;
    let translator = compiled("delete Person p where p.age < :cutoff");
    let params = QueryParameters::new().with("cutoff", 10);

    let err = translator.iterate(&mut conn, &params).await.err().unwrap();
    assert!(matches!(
        err,
        OqlError::Query(QueryError::WrongMode { operation: "iterate", .. })
    ));

    let err = translator.scroll(&mut conn, &params).await.err().unwrap();
    assert!(matches!(
        err,
        OqlError::Query(QueryError::WrongMode { operation: "scroll", .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_translator_reusable_after_failed_call() -> OqlResult<()> {
    let translator = compiled("select p.name from Person p where p.age >= :minAge order by p.name");
    let params = QueryParameters::new().with("minAge", 50);

    let mut conn = connect().await?;
    assert!(translator.list(&mut conn, &QueryParameters::new()).await.is_err());

    let mut empty = AnyConnection::connect("sqlite::memory:")
        .await
        .map_err(|e| ExecutionError::statement("connect", e))?;
    let err = translator.list(&mut empty, &params).await.unwrap_err();
    assert!(matches!(err, OqlError::Execution(_)));

    let results = translator.list(&mut conn, &params).await?;
    assert_eq!(strings(&results), vec!["Cy"]);
    Ok(())
}
