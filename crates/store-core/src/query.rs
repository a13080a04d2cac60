//! Query engine: chained predicate filtering over collection snapshots.
//!
//! Queries are stateless builders with value semantics; `filter` and `limit`
//! return a new `Query` and never mutate the receiver. Evaluation is an eager
//! linear scan of the collection snapshot - no index is built or maintained.
//!
//! `limit` caps the result *after* filtering, taking the first n matches in
//! the collection's insertion order. It implies no sort order.

use crate::document::{Document, Fields};
use crate::store::Database;

use serde_json::Value;
use std::cmp::Ordering;

/// Predicate operators.
///
/// Ordering operators compare numbers numerically and strings
/// lexicographically; mixed or non-comparable types never match.
/// `Contains` is an array membership test on an ordered-sequence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone)]
struct Predicate {
    field: String,
    op: Operator,
    value: Value,
}

impl Predicate {
    fn matches(&self, fields: &Fields) -> bool {
        let value = fields.get(&self.field);
        match self.op {
            Operator::Eq => value == Some(&self.value),
            // A missing field is never equal to anything, so Ne matches it.
            Operator::Ne => value != Some(&self.value),
            Operator::Contains => value
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(&self.value)),
            Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => value
                .and_then(|v| compare(v, &self.value))
                .is_some_and(|ord| match self.op {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    Operator::Le => ord != Ordering::Greater,
                    _ => unreachable!(),
                }),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn evaluate(docs: Vec<Document>, predicates: &[Predicate], limit: Option<usize>) -> Vec<Document> {
    let filtered = docs
        .into_iter()
        .filter(|doc| predicates.iter().all(|p| p.matches(&doc.fields)));
    match limit {
        Some(n) => filtered.take(n).collect(),
        None => filtered.collect(),
    }
}

/// A query over one collection.
#[derive(Clone)]
pub struct Query {
    db: Database,
    collection: String,
    predicates: Vec<Predicate>,
    limit: Option<usize>,
}

impl Query {
    pub(crate) fn new(db: Database, collection: String) -> Self {
        Self {
            db,
            collection,
            predicates: Vec::new(),
            limit: None,
        }
    }

    /// Append a predicate, returning a new query.
    pub fn filter(&self, field: &str, op: Operator, value: Value) -> Query {
        let mut query = self.clone();
        query.predicates.push(Predicate {
            field: field.to_string(),
            op,
            value,
        });
        query
    }

    /// Cap the result length after filtering, returning a new query.
    pub fn limit(&self, n: usize) -> Query {
        let mut query = self.clone();
        query.limit = Some(n);
        query
    }

    /// Evaluate eagerly against the current collection snapshot.
    pub fn get(&self) -> Vec<Document> {
        let docs = self.db.collection(&self.collection).get();
        evaluate(docs, &self.predicates, self.limit)
    }
}

/// Field injected into group-query results naming the owning parent.
pub const PARENT_ID: &str = "parentId";

/// A query over every sub-collection sharing one name.
///
/// Sub-collections live under `{parent}_{parentId}_{name}`; a group query
/// unions all collections with a matching trailing segment and injects the
/// owning parent's id into each result under `parentId`, so collaborators
/// can reconstruct ownership.
#[derive(Clone)]
pub struct GroupQuery {
    db: Database,
    name: String,
    predicates: Vec<Predicate>,
    limit: Option<usize>,
}

impl GroupQuery {
    pub(crate) fn new(db: Database, name: String) -> Self {
        Self {
            db,
            name,
            predicates: Vec::new(),
            limit: None,
        }
    }

    /// Append a predicate, returning a new query.
    pub fn filter(&self, field: &str, op: Operator, value: Value) -> GroupQuery {
        let mut query = self.clone();
        query.predicates.push(Predicate {
            field: field.to_string(),
            op,
            value,
        });
        query
    }

    /// Cap the result length after filtering, returning a new query.
    pub fn limit(&self, n: usize) -> GroupQuery {
        let mut query = self.clone();
        query.limit = Some(n);
        query
    }

    /// Evaluate against every matching sub-collection, in collection
    /// insertion order.
    pub fn get(&self) -> Vec<Document> {
        let docs = self.db.read_state(|state| {
            let mut docs = Vec::new();
            for (coll_name, coll) in state {
                let Some(parent_id) = parse_group_member(coll_name, &self.name) else {
                    continue;
                };
                for (id, fields) in coll {
                    let mut fields = fields.clone();
                    fields.insert(PARENT_ID.to_string(), Value::String(parent_id.to_string()));
                    docs.push(Document {
                        id: id.clone(),
                        fields,
                    });
                }
            }
            docs
        });
        evaluate(docs, &self.predicates, self.limit)
    }
}

/// Match `{parent}_{parentId}_{name}` and extract the parent id.
///
/// Parent collection names may themselves contain underscores; generated
/// document ids do not, so the id is the last segment before the suffix.
/// A caller-chosen parent id containing `_` is misattributed (only its last
/// segment is recovered), which is why `DocumentHandle::collection` rules
/// such ids out.
fn parse_group_member<'a>(collection: &'a str, name: &str) -> Option<&'a str> {
    let stem = collection.strip_suffix(name)?.strip_suffix('_')?;
    let (parent, parent_id) = stem.rsplit_once('_')?;
    (!parent.is_empty() && !parent_id.is_empty()).then_some(parent_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use serde_json::json;
    use std::sync::Arc;

    fn fields(value: serde_json::Value) -> Fields {
        serde_json::from_value(value).unwrap()
    }

    async fn db_with_numbers() -> Database {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let coll = db.collection("items");
        for (id, x) in [("a", 3), ("b", 8), ("c", 6), ("d", 1), ("e", 9)] {
            coll.doc(id).set(fields(json!({"x": x}))).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_filter_preserves_insertion_order() {
        let db = db_with_numbers().await;
        let results = db.collection("items").filter("x", Operator::Gt, json!(5)).get();
        let ids: Vec<&str> = results.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "e"]);
    }

    #[tokio::test]
    async fn test_limit_applies_after_filter() {
        let db = db_with_numbers().await;
        let results = db
            .collection("items")
            .filter("x", Operator::Gt, json!(5))
            .limit(2)
            .get();
        // First two members of the filtered set, not of the raw collection
        let ids: Vec<&str> = results.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_chaining_does_not_mutate_prior_query() {
        let db = db_with_numbers().await;
        let base = db.collection("items").filter("x", Operator::Gt, json!(5));
        let narrowed = base.filter("x", Operator::Lt, json!(9));

        assert_eq!(base.get().len(), 3);
        assert_eq!(narrowed.get().len(), 2);
    }

    #[tokio::test]
    async fn test_comparison_operators() {
        let db = db_with_numbers().await;
        let coll = db.collection("items");

        assert_eq!(coll.filter("x", Operator::Eq, json!(6)).get().len(), 1);
        assert_eq!(coll.filter("x", Operator::Ne, json!(6)).get().len(), 4);
        assert_eq!(coll.filter("x", Operator::Ge, json!(6)).get().len(), 3);
        assert_eq!(coll.filter("x", Operator::Lt, json!(6)).get().len(), 2);
        assert_eq!(coll.filter("x", Operator::Le, json!(6)).get().len(), 3);
    }

    #[tokio::test]
    async fn test_string_comparison_is_lexicographic() {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let coll = db.collection("items");
        coll.doc("a").set(fields(json!({"name": "apple"}))).await.unwrap();
        coll.doc("b").set(fields(json!({"name": "mango"}))).await.unwrap();

        let results = coll.filter("name", Operator::Gt, json!("banana")).get();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");
    }

    #[tokio::test]
    async fn test_mixed_types_never_match_ordering() {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let coll = db.collection("items");
        coll.doc("a").set(fields(json!({"x": "7"}))).await.unwrap();

        assert!(coll.filter("x", Operator::Gt, json!(5)).get().is_empty());
    }

    #[tokio::test]
    async fn test_missing_field_semantics() {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let coll = db.collection("items");
        coll.doc("a").set(fields(json!({"y": 1}))).await.unwrap();

        assert!(coll.filter("x", Operator::Eq, json!(1)).get().is_empty());
        assert!(coll.filter("x", Operator::Gt, json!(0)).get().is_empty());
        // A missing field is not equal to anything, so Ne matches
        assert_eq!(coll.filter("x", Operator::Ne, json!(1)).get().len(), 1);
    }

    #[tokio::test]
    async fn test_contains() {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let coll = db.collection("items");
        coll.doc("a")
            .set(fields(json!({"tags": ["red", "blue"]})))
            .await
            .unwrap();
        coll.doc("b")
            .set(fields(json!({"tags": ["green"]})))
            .await
            .unwrap();
        coll.doc("c").set(fields(json!({"tags": "red"}))).await.unwrap();

        let results = coll.filter("tags", Operator::Contains, json!("red")).get();
        // Only array fields match; the scalar on "c" does not
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn test_group_query_injects_parent_id() {
        let db = Database::open(Arc::new(InMemoryPersistence::new())).await;
        let students = db.collection("students");
        students
            .doc("s1")
            .collection("measures")
            .doc("m1")
            .set(fields(json!({"kind": "warning"})))
            .await
            .unwrap();
        students
            .doc("s2")
            .collection("measures")
            .doc("m2")
            .set(fields(json!({"kind": "praise"})))
            .await
            .unwrap();
        // Unrelated collection is not part of the group
        db.collection("measures")
            .doc("m3")
            .set(fields(json!({"kind": "warning"})))
            .await
            .unwrap();

        let results = db.collection_group("measures").get();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].field(PARENT_ID), Some(&json!("s1")));
        assert_eq!(results[1].field(PARENT_ID), Some(&json!("s2")));

        let warnings = db
            .collection_group("measures")
            .filter("kind", Operator::Eq, json!("warning"))
            .get();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, "m1");
    }

    #[test]
    fn test_parse_group_member() {
        assert_eq!(parse_group_member("students_s1_measures", "measures"), Some("s1"));
        // Parent names may contain underscores
        assert_eq!(
            parse_group_member("class_rooms_r9_measures", "measures"),
            Some("r9")
        );
        assert_eq!(parse_group_member("measures", "measures"), None);
        assert_eq!(parse_group_member("students_s1_other", "measures"), None);
        // Underscored parent ids lose everything before their last segment,
        // hence the no-underscore rule on sub-collection parent ids
        assert_eq!(
            parse_group_member("students_s_1_measures", "measures"),
            Some("1")
        );
    }
}
