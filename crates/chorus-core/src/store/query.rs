//! Filter, update and aggregation evaluation over JSON documents.
//!
//! The dialect is the subset of MongoDB's the host needs:
//!
//! | Kind | Supported |
//! |------|-----------|
//! | Filter | field equality, dotted paths, `$eq $ne $gt $gte $lt $lte $in $nin $exists $and $or` |
//! | Update | `$set $unset $inc $push ($each, $slice) $setOnInsert`, whole-document replacement |
//! | Pipeline | `$match $sort $skip $limit $group` with `$sum $min $max $avg $count` |

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Paths
// =============================================================================

/// Looks up a dotted path (`stats.totalEarned`).
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes `value` at a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> StoreResult<()> {
    let mut cur = doc;
    let mut segments = path.split('.').peekable();
    while let Some(seg) = segments.next() {
        let Value::Object(map) = cur else {
            return Err(StoreError::invalid_query(format!(
                "cannot set '{path}': parent is not an object"
            )));
        };
        if segments.peek().is_none() {
            map.insert(seg.to_string(), value);
            return Ok(());
        }
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Err(StoreError::invalid_query("empty field path"))
}

/// Removes the value at a dotted path; returns whether something was removed.
pub fn remove_path(doc: &mut Value, path: &str) -> bool {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (get_path_mut(doc, parent), leaf),
        None => (Some(doc), path),
    };
    match parent {
        Some(Value::Object(map)) => map.remove(leaf).is_some(),
        _ => false,
    }
}

fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(map) => map.get_mut(seg),
        _ => None,
    })
}

// =============================================================================
// Comparison
// =============================================================================

/// Orders two JSON scalars of the same family; `None` across families.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: null < numbers < strings < bools < others.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Bool(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Equality that also matches an element of an array field.
fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
        None => expected.is_null(),
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Returns `true` when `doc` satisfies `filter`.
pub fn matches(doc: &Value, filter: &Value) -> StoreResult<bool> {
    let Value::Object(clauses) = filter else {
        return Err(StoreError::invalid_query("filter must be an object"));
    };

    for (key, cond) in clauses {
        let ok = match key.as_str() {
            "$and" => {
                let parts = as_clause_list(key, cond)?;
                let mut all = true;
                for part in parts {
                    if !matches(doc, part)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let parts = as_clause_list(key, cond)?;
                let mut any = false;
                for part in parts {
                    if matches(doc, part)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            op if op.starts_with('$') => {
                return Err(StoreError::invalid_query(format!(
                    "unsupported top-level operator '{op}'"
                )));
            }
            path => field_matches(get_path(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_clause_list<'a>(op: &str, cond: &'a Value) -> StoreResult<&'a Vec<Value>> {
    match cond {
        Value::Array(parts) if !parts.is_empty() => Ok(parts),
        _ => Err(StoreError::invalid_query(format!(
            "'{op}' expects a non-empty array"
        ))),
    }
}

fn is_operator_object(cond: &Value) -> bool {
    matches!(cond, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn field_matches(field: Option<&Value>, cond: &Value) -> StoreResult<bool> {
    if !is_operator_object(cond) {
        return Ok(field_equals(field, cond));
    }
    let Value::Object(ops) = cond else {
        return Ok(false);
    };

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => field_equals(field, arg),
            "$ne" => !field_equals(field, arg),
            "$gt" => field.and_then(|v| compare(v, arg)) == Some(Ordering::Greater),
            "$gte" => matches!(
                field.and_then(|v| compare(v, arg)),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => field.and_then(|v| compare(v, arg)) == Some(Ordering::Less),
            "$lte" => matches!(
                field.and_then(|v| compare(v, arg)),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$in" => {
                let Value::Array(options) = arg else {
                    return Err(StoreError::invalid_query("'$in' expects an array"));
                };
                options.iter().any(|o| field_equals(field, o))
            }
            "$nin" => {
                let Value::Array(options) = arg else {
                    return Err(StoreError::invalid_query("'$nin' expects an array"));
                };
                !options.iter().any(|o| field_equals(field, o))
            }
            "$exists" => {
                let want = arg.as_bool().unwrap_or(true);
                field.is_some() == want
            }
            other => {
                return Err(StoreError::invalid_query(format!(
                    "unsupported filter operator '{other}'"
                )));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Builds the seed document for an upsert from the equality clauses of a filter.
pub fn upsert_seed(filter: &Value) -> Value {
    let mut seed = Value::Object(Map::new());
    if let Value::Object(clauses) = filter {
        for (key, cond) in clauses {
            if key.starts_with('$') {
                continue;
            }
            let value = match cond {
                Value::Object(ops) if is_operator_object(cond) => match ops.get("$eq") {
                    Some(v) => v.clone(),
                    None => continue,
                },
                other => other.clone(),
            };
            let _ = set_path(&mut seed, key, value);
        }
    }
    seed
}

// =============================================================================
// Updates
// =============================================================================

/// Applies an update document in place; returns whether the document changed.
///
/// `inserting` enables `$setOnInsert`. A document without operator keys
/// replaces everything except `_id`.
pub fn apply_update(doc: &mut Value, update: &Value, inserting: bool) -> StoreResult<bool> {
    let Value::Object(ops) = update else {
        return Err(StoreError::invalid_query("update must be an object"));
    };
    if ops.is_empty() {
        return Err(StoreError::invalid_query("update must not be empty"));
    }

    let before = doc.clone();

    if !ops.keys().any(|k| k.starts_with('$')) {
        let id = get_path(doc, "_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            set_path(doc, "_id", id)?;
        }
        return Ok(*doc != before);
    }

    for (op, fields) in ops {
        let Value::Object(fields) = fields else {
            return Err(StoreError::invalid_query(format!(
                "'{op}' expects an object"
            )));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone())?;
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(doc, path, value.clone())?;
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = get_path(doc, path).cloned().unwrap_or(Value::from(0));
                    set_path(doc, path, add_numbers(path, &current, delta)?)?;
                }
            }
            "$push" => {
                for (path, spec) in fields {
                    push_values(doc, path, spec)?;
                }
            }
            other => {
                return Err(StoreError::invalid_query(format!(
                    "unsupported update operator '{other}'"
                )));
            }
        }
    }

    Ok(*doc != before)
}

fn add_numbers(path: &str, current: &Value, delta: &Value) -> StoreResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, delta) else {
        return Err(StoreError::invalid_query(format!(
            "'$inc' on non-numeric field '{path}'"
        )));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| StoreError::invalid_query(format!("'$inc' overflow on '{path}'")));
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| StoreError::invalid_query(format!("'$inc' produced NaN on '{path}'")))
}

fn push_values(doc: &mut Value, path: &str, spec: &Value) -> StoreResult<()> {
    let (items, slice) = match spec {
        Value::Object(map) if map.contains_key("$each") => {
            let Some(Value::Array(each)) = map.get("$each") else {
                return Err(StoreError::invalid_query("'$each' expects an array"));
            };
            let slice = match map.get("$slice") {
                Some(v) => Some(v.as_i64().ok_or_else(|| {
                    StoreError::invalid_query("'$slice' expects an integer")
                })?),
                None => None,
            };
            (each.clone(), slice)
        }
        other => (vec![other.clone()], None),
    };

    let mut array = match get_path(doc, path) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(existing)) => existing.clone(),
        Some(_) => {
            return Err(StoreError::invalid_query(format!(
                "'$push' on non-array field '{path}'"
            )));
        }
    };
    array.extend(items);

    if let Some(n) = slice {
        let keep = n.unsigned_abs() as usize;
        if n >= 0 {
            array.truncate(keep);
        } else if array.len() > keep {
            array.drain(..array.len() - keep);
        }
    }

    set_path(doc, path, Value::Array(array))
}

// =============================================================================
// Sorting
// =============================================================================

/// Sorts documents by a `{ field: 1 | -1 }` specification.
pub fn sort_documents(docs: &mut [Value], spec: &Value) -> StoreResult<()> {
    let Value::Object(keys) = spec else {
        return Err(StoreError::invalid_query("sort must be an object"));
    };
    let keys: Vec<(String, bool)> = keys
        .iter()
        .map(|(k, dir)| (k.clone(), dir.as_i64().unwrap_or(1) < 0))
        .collect();

    docs.sort_by(|a, b| {
        for (key, descending) in &keys {
            let ord = sort_order(get_path(a, key), get_path(b, key));
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

// =============================================================================
// Aggregation
// =============================================================================

/// Runs a pipeline over an already-loaded set of documents.
pub fn aggregate(mut docs: Vec<Value>, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
    for stage in pipeline {
        let Value::Object(map) = stage else {
            return Err(StoreError::invalid_query("pipeline stage must be an object"));
        };
        let Some((name, arg)) = map.iter().next().filter(|_| map.len() == 1) else {
            return Err(StoreError::invalid_query(
                "pipeline stage must have exactly one key",
            ));
        };

        docs = match name.as_str() {
            "$match" => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, arg)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                sort_documents(&mut docs, arg)?;
                docs
            }
            "$skip" => {
                let n = as_count(name, arg)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = as_count(name, arg)?;
                docs.into_iter().take(n).collect()
            }
            "$group" => group(docs, arg)?,
            other => {
                return Err(StoreError::invalid_query(format!(
                    "unsupported pipeline stage '{other}'"
                )));
            }
        };
    }
    Ok(docs)
}

fn as_count(stage: &str, arg: &Value) -> StoreResult<usize> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::invalid_query(format!("'{stage}' expects a non-negative integer")))
}

/// Resolves a group key or accumulator operand (`"$field"` or a literal).
fn operand(doc: &Value, expr: &Value) -> Option<Value> {
    match expr {
        Value::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned(),
        other => Some(other.clone()),
    }
}

fn group(docs: Vec<Value>, spec: &Value) -> StoreResult<Vec<Value>> {
    let Value::Object(spec) = spec else {
        return Err(StoreError::invalid_query("'$group' expects an object"));
    };
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| StoreError::invalid_query("'$group' requires an _id"))?;

    // Preserve first-seen group order.
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for doc in docs {
        let key = operand(&doc, key_expr).unwrap_or(Value::Null);
        match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Map::new();
        row.insert("_id".into(), key);
        for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            row.insert(field.clone(), accumulate(field, acc, &members)?);
        }
        out.push(Value::Object(row));
    }
    Ok(out)
}

fn accumulate(field: &str, acc: &Value, members: &[Value]) -> StoreResult<Value> {
    let Some((op, expr)) = acc.as_object().and_then(|m| m.iter().next()) else {
        return Err(StoreError::invalid_query(format!(
            "accumulator for '{field}' must be an object"
        )));
    };

    let numbers = || {
        members
            .iter()
            .filter_map(|d| operand(d, expr))
            .filter(Value::is_number)
    };

    let value = match op.as_str() {
        "$count" => Value::from(members.len() as u64),
        "$sum" => {
            let values: Vec<Value> = numbers().collect();
            if values.iter().all(|v| v.is_i64()) {
                Value::from(values.iter().filter_map(Value::as_i64).sum::<i64>())
            } else {
                float(values.iter().filter_map(Value::as_f64).sum())
            }
        }
        "$avg" => {
            let values: Vec<f64> = numbers().filter_map(|v| v.as_f64()).collect();
            if values.is_empty() {
                Value::Null
            } else {
                float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "$min" | "$max" => {
            let want = if op == "$min" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            members
                .iter()
                .filter_map(|d| operand(d, expr))
                .filter(|v| !v.is_null())
                .reduce(|best, v| {
                    if compare(&v, &best) == Some(want) {
                        v
                    } else {
                        best
                    }
                })
                .unwrap_or(Value::Null)
        }
        other => {
            return Err(StoreError::invalid_query(format!(
                "unsupported accumulator '{other}'"
            )));
        }
    };
    Ok(value)
}

fn float(x: f64) -> Value {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_equality_and_dotted_paths() {
        let doc = json!({ "userId": "a", "stats": { "wins": 3 }, "tags": ["x", "y"] });
        assert!(matches(&doc, &json!({ "userId": "a" })).unwrap());
        assert!(matches(&doc, &json!({ "stats.wins": 3 })).unwrap());
        assert!(matches(&doc, &json!({ "tags": "y" })).unwrap());
        assert!(!matches(&doc, &json!({ "userId": "b" })).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({ "wallet": 500, "name": "ada" });
        assert!(matches(&doc, &json!({ "wallet": { "$gte": 500 } })).unwrap());
        assert!(!matches(&doc, &json!({ "wallet": { "$gt": 500 } })).unwrap());
        assert!(matches(&doc, &json!({ "wallet": { "$gt": 100, "$lt": 1000 } })).unwrap());
        assert!(matches(&doc, &json!({ "name": { "$in": ["bob", "ada"] } })).unwrap());
        assert!(matches(&doc, &json!({ "bank": { "$exists": false } })).unwrap());
        assert!(matches(&doc, &json!({ "$or": [{ "name": "x" }, { "wallet": 500 }] })).unwrap());
    }

    #[test]
    fn test_unknown_operator_is_invalid() {
        let doc = json!({ "a": 1 });
        let err = matches(&doc, &json!({ "a": { "$regex": "x" } })).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }

    #[test]
    fn test_set_inc_unset() {
        let mut doc = json!({ "wallet": 10, "old": true });
        let changed = apply_update(
            &mut doc,
            &json!({
                "$inc": { "wallet": 5, "stats.totalEarned": 5 },
                "$set": { "updatedAt": "now" },
                "$unset": { "old": "" }
            }),
            false,
        )
        .unwrap();
        assert!(changed);
        assert_eq!(doc, json!({ "wallet": 15, "stats": { "totalEarned": 5 }, "updatedAt": "now" }));
    }

    #[test]
    fn test_push_with_slice_keeps_tail() {
        let mut doc = json!({ "history": [1, 2, 3] });
        apply_update(
            &mut doc,
            &json!({ "$push": { "history": { "$each": [4, 5], "$slice": -3 } } }),
            false,
        )
        .unwrap();
        assert_eq!(doc["history"], json!([3, 4, 5]));
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let mut doc = json!({ "userId": "a" });
        apply_update(&mut doc, &json!({ "$setOnInsert": { "wallet": 0 } }), false).unwrap();
        assert!(doc.get("wallet").is_none());
        apply_update(&mut doc, &json!({ "$setOnInsert": { "wallet": 0 } }), true).unwrap();
        assert_eq!(doc["wallet"], json!(0));
    }

    #[test]
    fn test_upsert_seed_takes_equality_clauses() {
        let seed = upsert_seed(&json!({ "userId": "a", "version": { "$eq": 0 }, "x": { "$gt": 1 } }));
        assert_eq!(seed, json!({ "userId": "a", "version": 0 }));
    }

    #[test]
    fn test_group_and_sort() {
        let docs = vec![
            json!({ "user": "a", "amount": 10 }),
            json!({ "user": "b", "amount": 5 }),
            json!({ "user": "a", "amount": 7 }),
        ];
        let out = aggregate(
            docs,
            &[
                json!({ "$group": { "_id": "$user", "total": { "$sum": "$amount" }, "n": { "$count": {} } } }),
                json!({ "$sort": { "total": -1 } }),
                json!({ "$limit": 1 }),
            ],
        )
        .unwrap();
        assert_eq!(out, vec![json!({ "_id": "a", "total": 17, "n": 2 })]);
    }
}
