//! Filter matching and mutation evaluation over JSON documents.
//!
//! Supports the query subset the changeset format accepts: field equality on
//! dotted paths, `$eq $ne $gt $gte $lt $lte $in $nin $exists`, top-level
//! `$and`/`$or`, and the mutation operators `$set $unset $inc $push $pull`
//! (`$push` takes `$each`, `$pull` takes a condition document).
//! `$currentDate` and the `{"$now": true}` placeholder are resolved by
//! [`resolve_apply_time`] before an operation reaches a store.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::changeset::{Document, Operation};

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("invalid operand for {operator}: {message}")]
    InvalidOperand { operator: String, message: String },
}

fn invalid(operator: &str, message: impl Into<String>) -> DocumentError {
    DocumentError::InvalidOperand {
        operator: operator.to_string(),
        message: message.into(),
    }
}

/// Look up a dotted path such as `address.city`.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = doc;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

fn remove_path(doc: &mut Document, path: &str) -> bool {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return false;
    };
    let mut current = doc;
    for part in parts {
        match current.get_mut(part) {
            Some(Value::Object(map)) => current = map,
            _ => return false,
        }
    }
    current.remove(last).is_some()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Equality with array-membership semantics: `{tags: "x"}` matches `tags: ["x"]`.
fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|item| values_equal(item, expected)),
        Some(value) => values_equal(value, expected),
        None => expected.is_null(),
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

fn is_operator_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn operand_array<'a>(operator: &str, operand: &'a Value) -> Result<&'a Vec<Value>, DocumentError> {
    operand
        .as_array()
        .ok_or_else(|| invalid(operator, "expected an array"))
}

fn match_condition(field: Option<&Value>, operator: &str, operand: &Value) -> Result<bool, DocumentError> {
    let ordered = |accept: fn(Ordering) -> bool| -> bool {
        match field {
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| compare(item, operand).is_some_and(accept)),
            Some(value) => compare(value, operand).is_some_and(accept),
            None => false,
        }
    };

    let matched = match operator {
        "$eq" => field_equals(field, operand),
        "$ne" => !field_equals(field, operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => operand_array(operator, operand)?
            .iter()
            .any(|candidate| field_equals(field, candidate)),
        "$nin" => !operand_array(operator, operand)?
            .iter()
            .any(|candidate| field_equals(field, candidate)),
        "$exists" => {
            let wanted = operand
                .as_bool()
                .ok_or_else(|| invalid(operator, "expected a boolean"))?;
            field.is_some() == wanted
        }
        other => return Err(DocumentError::UnknownOperator(other.to_string())),
    };
    Ok(matched)
}

/// Whether `doc` satisfies `filter`. An empty filter matches every document.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, DocumentError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in operand_array(key, condition)? {
                    let clause = clause.as_object().ok_or_else(|| invalid(key, "expected objects"))?;
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in operand_array(key, condition)? {
                    let clause = clause.as_object().ok_or_else(|| invalid(key, "expected objects"))?;
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            other if other.starts_with('$') => return Err(DocumentError::UnknownOperator(other.to_string())),
            path => {
                let field = get_path(doc, path);
                if is_operator_object(condition) {
                    let mut all = true;
                    for (operator, operand) in condition.as_object().into_iter().flatten() {
                        if !match_condition(field, operator, operand)? {
                            all = false;
                            break;
                        }
                    }
                    all
                } else {
                    field_equals(field, condition)
                }
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn add_numbers(current: Option<&Value>, delta: &Value) -> Result<Value, DocumentError> {
    let Value::Number(delta_num) = delta else {
        return Err(invalid("$inc", "expected a number"));
    };
    let current_num = match current {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n),
        Some(_) => return Err(invalid("$inc", "target field is not a number")),
    };

    if let (Some(a), Some(b)) = (current_num.map_or(Some(0), Number::as_i64), delta_num.as_i64())
        && let Some(sum) = a.checked_add(b)
    {
        return Ok(Value::from(sum));
    }

    let sum = current_num.and_then(Number::as_f64).unwrap_or(0.0) + delta_num.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| invalid("$inc", "result is not a finite number"))
}

fn operator_fields<'a>(operator: &str, operand: &'a Value) -> Result<&'a Document, DocumentError> {
    operand
        .as_object()
        .ok_or_else(|| invalid(operator, "expected an object of fields"))
}

/// `{"$each": [...]}` pushes every element, anything else pushes itself.
fn push_values(value: &Value) -> Result<Vec<Value>, DocumentError> {
    match value {
        Value::Object(map) if map.contains_key("$each") => {
            if map.len() > 1 {
                return Err(invalid("$push", "only $each is supported as a modifier"));
            }
            Ok(operand_array("$each", &map["$each"])?.clone())
        }
        other => Ok(vec![other.clone()]),
    }
}

/// `$pull` removes elements equal to the condition, or, for a condition
/// document, elements matching it the way a filter matches a document.
fn pull_matches(item: &Value, condition: &Value) -> Result<bool, DocumentError> {
    match condition {
        Value::Object(_) if is_operator_object(condition) => {
            let field = Some(item);
            for (operator, operand) in condition.as_object().into_iter().flatten() {
                if !match_condition(field, operator, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Object(filter) => match item {
            Value::Object(element) => matches(element, filter),
            _ => Ok(false),
        },
        _ => Ok(values_equal(item, condition)),
    }
}

/// Apply a mutation in place. Returns whether the document changed.
pub fn apply_mutation(doc: &mut Document, mutation: &Document) -> Result<bool, DocumentError> {
    if mutation.is_empty() || mutation.keys().any(|key| !key.starts_with('$')) {
        return Err(invalid("mutation", "expected only update operators such as $set"));
    }

    let before = doc.clone();
    for (operator, operand) in mutation {
        let fields = operator_fields(operator, operand)?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let next = add_numbers(get_path(doc, path), delta)?;
                    set_path(doc, path, next);
                }
            }
            "$push" => {
                for (path, value) in fields {
                    let pushed = push_values(value)?;
                    match get_path(doc, path).cloned() {
                        None | Some(Value::Null) => set_path(doc, path, Value::Array(pushed)),
                        Some(Value::Array(mut items)) => {
                            items.extend(pushed);
                            set_path(doc, path, Value::Array(items));
                        }
                        Some(_) => return Err(invalid(operator, format!("field {path} is not an array"))),
                    }
                }
            }
            "$pull" => {
                for (path, condition) in fields {
                    if let Some(Value::Array(items)) = get_path(doc, path).cloned() {
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items {
                            if !pull_matches(&item, condition)? {
                                kept.push(item);
                            }
                        }
                        set_path(doc, path, Value::Array(kept));
                    }
                }
            }
            other => return Err(DocumentError::UnknownOperator(other.to_string())),
        }
    }
    Ok(*doc != before)
}

/// Document inserted by an upsert that matched nothing: the filter's
/// equality fields with the mutation applied on top.
pub fn upsert_seed(filter: &Document, mutation: &Document) -> Result<Document, DocumentError> {
    let mut seed = Document::new();
    for (path, condition) in filter {
        if path.starts_with('$') {
            continue;
        }
        if let Value::Object(map) = condition
            && is_operator_object(condition)
        {
            if let Some(value) = map.get("$eq") {
                set_path(&mut seed, path, value.clone());
            }
            continue;
        }
        set_path(&mut seed, path, condition.clone());
    }
    apply_mutation(&mut seed, mutation)?;
    Ok(seed)
}

fn is_now_placeholder(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.get("$now") == Some(&Value::Bool(true)))
}

fn resolve_now(value: &mut Value, now: &Value) {
    if is_now_placeholder(value) {
        *value = now.clone();
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| resolve_now(v, now)),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_now(v, now)),
        _ => {}
    }
}

fn resolve_document(doc: &mut Document, now: &Value) {
    doc.values_mut().for_each(|v| resolve_now(v, now));
}

/// Replace apply-time placeholders with `now`.
///
/// `{"$now": true}` inside insert documents and mutation values becomes the
/// RFC 3339 timestamp, and `$currentDate: {field: true}` becomes a `$set`.
/// Filters are left untouched.
pub fn resolve_apply_time(operation: &Operation, now: DateTime<Utc>) -> Operation {
    let stamp = Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true));
    let mut resolved = operation.clone();
    match &mut resolved {
        Operation::Insert { documents, .. } => {
            documents.iter_mut().for_each(|doc| resolve_document(doc, &stamp));
        }
        Operation::Update { mutation, .. } => {
            if let Some(Value::Object(fields)) = mutation.remove("$currentDate") {
                let set = mutation
                    .entry("$set".to_string())
                    .or_insert_with(|| Value::Object(Document::new()));
                if let Value::Object(set) = set {
                    for field in fields.keys() {
                        set.insert(field.clone(), stamp.clone());
                    }
                }
            }
            resolve_document(mutation, &stamp);
        }
        Operation::Delete { .. } | Operation::CreateIndex { .. } => {}
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn equality_and_dotted_paths() {
        let user = doc(json!({"name": "John", "address": {"city": "Oslo"}, "tags": ["a", "b"]}));
        assert!(matches(&user, &doc(json!({"name": "John"}))).unwrap());
        assert!(matches(&user, &doc(json!({"address.city": "Oslo"}))).unwrap());
        assert!(matches(&user, &doc(json!({"tags": "b"}))).unwrap());
        assert!(!matches(&user, &doc(json!({"name": "Jane"}))).unwrap());
        assert!(matches(&user, &Document::new()).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let user = doc(json!({"age": 25}));
        assert!(matches(&user, &doc(json!({"age": {"$gte": 18, "$lt": 30}}))).unwrap());
        assert!(!matches(&user, &doc(json!({"age": {"$lt": 18}}))).unwrap());
        assert!(matches(&user, &doc(json!({"age": {"$ne": 30}}))).unwrap());
        assert!(matches(&user, &doc(json!({"age": 25.0}))).unwrap());
        assert!(!matches(&user, &doc(json!({"missing": {"$gt": 1}}))).unwrap());
    }

    #[test]
    fn set_membership_and_existence() {
        let perm = doc(json!({"permission": "sp.benefits.benefitguide.list"}));
        let filter = doc(json!({"permission": {"$in": [
            "sp.benefits.benefitguide.list",
            "sp.benefits.benefitguide.sharewithprospecthire"
        ]}}));
        assert!(matches(&perm, &filter).unwrap());
        assert!(!matches(&perm, &doc(json!({"permission": {"$nin": ["sp.benefits.benefitguide.list"]}}))).unwrap());
        assert!(matches(&perm, &doc(json!({"featureKey": {"$exists": false}}))).unwrap());
    }

    #[test]
    fn logical_operators() {
        let user = doc(json!({"name": "Jane", "age": 25}));
        let either = doc(json!({"$or": [{"name": "John"}, {"age": {"$lt": 30}}]}));
        let both = doc(json!({"$and": [{"name": "John"}, {"age": {"$lt": 30}}]}));
        assert!(matches(&user, &either).unwrap());
        assert!(!matches(&user, &both).unwrap());
    }

    #[test]
    fn unknown_operators_are_errors() {
        let user = doc(json!({"age": 25}));
        let err = matches(&user, &doc(json!({"age": {"$regex": "2"}}))).unwrap_err();
        assert_eq!(err, DocumentError::UnknownOperator("$regex".to_string()));
        assert!(apply_mutation(&mut user.clone(), &doc(json!({"$rename": {"a": "b"}}))).is_err());
    }

    #[test]
    fn mutation_operators() {
        let mut user = doc(json!({"name": "John", "age": 30, "roles": ["viewer"], "legacy": true}));
        let changed = apply_mutation(
            &mut user,
            &doc(json!({
                "$set": {"profile.lang": "en"},
                "$inc": {"age": 1},
                "$push": {"roles": "editor"},
                "$unset": {"legacy": ""}
            })),
        )
        .unwrap();
        assert!(changed);
        assert_eq!(user["age"], json!(31));
        assert_eq!(user["profile"], json!({"lang": "en"}));
        assert_eq!(user["roles"], json!(["viewer", "editor"]));
        assert!(!user.contains_key("legacy"));

        apply_mutation(&mut user, &doc(json!({"$pull": {"roles": "viewer"}}))).unwrap();
        assert_eq!(user["roles"], json!(["editor"]));
    }

    #[test]
    fn array_operators_on_role_permissions() {
        let mut role = doc(json!({
            "roleName": "Admin",
            "permissions": [
                {"permissionGroup": "Benefits Guide", "access": "full"},
                {"permissionGroup": "Payroll", "access": "read"}
            ],
            "levels": [1, 2, 3, 4]
        }));
        apply_mutation(
            &mut role,
            &doc(json!({
                "$pull": {
                    "permissions": {"permissionGroup": {"$in": ["Benefits Guide"]}},
                    "levels": {"$gte": 3}
                }
            })),
        )
        .unwrap();
        assert_eq!(role["permissions"], json!([{"permissionGroup": "Payroll", "access": "read"}]));
        assert_eq!(role["levels"], json!([1, 2]));

        apply_mutation(
            &mut role,
            &doc(json!({"$push": {"permissions": {"$each": [
                {"permissionGroup": "Benefits", "access": "full"},
                {"permissionGroup": "Guides", "access": "read"}
            ]}}})),
        )
        .unwrap();
        assert_eq!(role["permissions"].as_array().unwrap().len(), 3);

        let err = apply_mutation(&mut role, &doc(json!({"$push": {"levels": {"$each": [5], "$slice": 2}}}))).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidOperand { .. }));
    }

    #[test]
    fn mutation_reports_no_change() {
        let mut user = doc(json!({"age": 31}));
        assert!(!apply_mutation(&mut user, &doc(json!({"$set": {"age": 31}}))).unwrap());
    }

    #[test]
    fn replacement_documents_are_rejected() {
        let mut user = doc(json!({"age": 31}));
        assert!(apply_mutation(&mut user, &doc(json!({"age": 32}))).is_err());
    }

    #[test]
    fn upsert_seed_uses_equality_fields() {
        let seed = upsert_seed(
            &doc(json!({"email": "new@example.com", "age": {"$gt": 1}})),
            &doc(json!({"$set": {"name": "New"}})),
        )
        .unwrap();
        assert_eq!(seed, doc(json!({"email": "new@example.com", "name": "New"})));
    }

    #[test]
    fn apply_time_placeholders_are_resolved() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let insert = Operation::Insert {
            collection: "security_test".to_string(),
            documents: vec![doc(json!({"created_date": {"$now": true}, "fixed": "2023-01-01"}))],
        };
        let Operation::Insert { documents, .. } = resolve_apply_time(&insert, now) else {
            panic!("expected insert");
        };
        assert_eq!(documents[0]["created_date"], json!("2024-05-01T10:00:00.000Z"));
        assert_eq!(documents[0]["fixed"], json!("2023-01-01"));

        let update = Operation::Update {
            collection: "users".to_string(),
            filter: doc(json!({"email": "john@example.com"})),
            mutation: doc(json!({"$set": {"age": 31}, "$currentDate": {"lastUpdated": true}})),
            multi: false,
            upsert: false,
        };
        let Operation::Update { mutation, .. } = resolve_apply_time(&update, now) else {
            panic!("expected update");
        };
        assert_eq!(mutation, doc(json!({"$set": {"age": 31, "lastUpdated": "2024-05-01T10:00:00.000Z"}})));
    }
}
