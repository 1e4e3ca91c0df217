//! Query evaluation: filters, ordering, projection and aggregation stages

use bson::{Bson, Document};
use std::cmp::Ordering;

use super::server_error;
use crate::Result;

/// Resolves a dotted path (`a.b.0.c`) inside a document
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(doc) => doc.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Position of a value's type in the server's cross-type sort order
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 1,
        Bson::Null | Bson::Undefined => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::MaxKey => 14,
        _ => 13,
    }
}

/// Total order over BSON values, numbers compared by value across types
pub(crate) fn compare(a: &Bson, b: &Bson) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            as_i64(a).cmp(&as_i64(b))
        }
        (Bson::Decimal128(x), Bson::Decimal128(y)) => x.bytes().cmp(&y.bytes()),
        _ if rank_a == 3 => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Bson::String(x) | Bson::Symbol(x), Bson::String(y) | Bson::Symbol(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then(x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        _ => Ordering::Equal,
    }
}

fn compare_documents(a: &Document, b: &Document) -> Ordering {
    for ((key_a, value_a), (key_b, value_b)) in a.iter().zip(b.iter()) {
        let ord = compare(value_a, value_b).then_with(|| key_a.cmp(key_b));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Ordering::Equal
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        other => as_f64(other).map(|n| n != 0.0).unwrap_or(true),
    }
}

/// Evaluates a query filter against a document
pub(crate) fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    all &= matches(document, sub)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    any |= matches(document, sub)?;
                }
                any
            }
            "$nor" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    any |= matches(document, sub)?;
                }
                !any
            }
            op if op.starts_with('$') => {
                return Err(server_error(2, format!("unknown top level operator: {}", op)));
            }
            field => field_matches(get_path(document, field), condition)?,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(operator: &str, condition: &'a Bson) -> Result<Vec<&'a Document>> {
    let items = match condition {
        Bson::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(server_error(
                2,
                format!("{} must be a nonempty array", operator),
            ))
        }
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(doc) => Ok(doc),
            _ => Err(server_error(2, format!("{} argument's entries must be objects", operator))),
        })
        .collect()
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            for (operator, argument) in operators {
                if !operator_matches(value, operator, argument)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        expected => Ok(equality_matches(value, expected)),
    }
}

fn equality_matches(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(actual) => {
            (type_rank(actual) == type_rank(expected) && values_equal(actual, expected))
                || matches!(actual, Bson::Array(items) if items.iter().any(|item| {
                    type_rank(item) == type_rank(expected) && values_equal(item, expected)
                }))
        }
    }
}

fn operator_matches(value: Option<&Bson>, operator: &str, argument: &Bson) -> Result<bool> {
    let ordering_test = |accept: fn(Ordering) -> bool| {
        candidates(value)
            .into_iter()
            .any(|v| type_rank(v) == type_rank(argument) && accept(compare(v, argument)))
    };
    match operator {
        "$eq" => Ok(equality_matches(value, argument)),
        "$ne" => Ok(!equality_matches(value, argument)),
        "$gt" => Ok(ordering_test(|o| o == Ordering::Greater)),
        "$gte" => Ok(ordering_test(|o| o != Ordering::Less)),
        "$lt" => Ok(ordering_test(|o| o == Ordering::Less)),
        "$lte" => Ok(ordering_test(|o| o != Ordering::Greater)),
        "$in" | "$nin" => {
            let Bson::Array(options) = argument else {
                return Err(server_error(2, format!("{} needs an array", operator)));
            };
            let found = options.iter().any(|option| equality_matches(value, option));
            Ok(if operator == "$in" { found } else { !found })
        }
        "$exists" => Ok(value.is_some() == truthy(argument)),
        other => Err(server_error(2, format!("unknown operator: {}", other))),
    }
}

fn candidates(value: Option<&Bson>) -> Vec<&Bson> {
    match value {
        Some(Bson::Array(items)) => {
            let mut all: Vec<&Bson> = items.iter().collect();
            all.push(value.unwrap_or(&Bson::Null));
            all
        }
        Some(v) => vec![v],
        None => Vec::new(),
    }
}

/// Orders two documents by a sort specification (`{a: 1, b: -1}`)
pub(crate) fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        let left = get_path(a, field).unwrap_or(&Bson::Null);
        let right = get_path(b, field).unwrap_or(&Bson::Null);
        let mut ord = compare(left, right);
        if as_f64(direction).map(|d| d < 0.0).unwrap_or(false) {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| compare_by_sort(a, b, sort));
}

/// Applies an inclusion or exclusion projection over top-level fields
pub(crate) fn project(document: &Document, projection: &Document) -> Result<Document> {
    let include_id = projection.get("_id").map(truthy).unwrap_or(true);
    let mut inclusion = None;
    for (field, flag) in projection.iter().filter(|(k, _)| k.as_str() != "_id") {
        let include = truthy(flag);
        match inclusion {
            None => inclusion = Some(include),
            Some(mode) if mode != include => {
                return Err(server_error(
                    2,
                    format!("Cannot mix inclusion and exclusion in projection at field {}", field),
                ));
            }
            Some(_) => {}
        }
    }

    let mut projected = Document::new();
    for (field, value) in document {
        let keep = if field == "_id" {
            include_id
        } else {
            match inclusion {
                Some(true) => projection.contains_key(field),
                Some(false) => !projection.contains_key(field),
                None => true,
            }
        };
        if keep {
            projected.insert(field.clone(), value.clone());
        }
    }
    Ok(projected)
}

/// Distinct values of `field`, flattening arrays like the server does
pub(crate) fn distinct_values<'a>(documents: impl Iterator<Item = &'a Document>, field: &str) -> Vec<Bson> {
    let mut values: Vec<Bson> = Vec::new();
    for document in documents {
        let found = match get_path(document, field) {
            Some(Bson::Array(items)) => items.clone(),
            Some(value) => vec![value.clone()],
            None => continue,
        };
        for value in found {
            if !values.iter().any(|v| type_rank(v) == type_rank(&value) && values_equal(v, &value)) {
                values.push(value);
            }
        }
    }
    values
}

/// Runs the aggregation stages the deployment understands
pub(crate) fn run_pipeline(mut documents: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        let Some((name, argument)) = stage.iter().next() else {
            return Err(server_error(40323, "A pipeline stage specification object must contain exactly one field."));
        };
        documents = match (name.as_str(), argument) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(documents.len());
                for document in documents {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut documents, sort);
                documents
            }
            ("$skip", n) => {
                let n = stage_count(name, n)?;
                documents.into_iter().skip(n).collect()
            }
            ("$limit", n) => {
                let n = stage_count(name, n)?;
                documents.into_iter().take(n).collect()
            }
            ("$project", Bson::Document(projection)) => documents
                .iter()
                .map(|d| project(d, projection))
                .collect::<Result<Vec<_>>>()?,
            ("$count", Bson::String(field)) => {
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let mut counted = Document::new();
                    counted.insert(field.clone(), documents.len() as i32);
                    vec![counted]
                }
            }
            (name, _) if ["$match", "$sort", "$project", "$count"].contains(&name) => {
                return Err(server_error(2, format!("invalid argument to {} stage", name)));
            }
            (name, _) => {
                return Err(server_error(
                    40324,
                    format!("Unrecognized pipeline stage name: '{}'", name),
                ));
            }
        };
    }
    Ok(documents)
}

fn stage_count(stage: &str, value: &Bson) -> Result<usize> {
    match as_i64(value) {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(server_error(2, format!("invalid argument to {} stage", stage))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use test_case::test_case;

    fn sample() -> Document {
        doc! { "_id": 1, "x": 5, "tags": ["a", "b"], "sub": { "y": "z" }, "n": null }
    }

    #[test_case(doc! { "x": 5 }, true ; "equality")]
    #[test_case(doc! { "x": 5.0 }, true ; "numeric equality across types")]
    #[test_case(doc! { "x": { "$gt": 4, "$lt": 6 } }, true ; "range")]
    #[test_case(doc! { "x": { "$gte": 6 } }, false ; "gte miss")]
    #[test_case(doc! { "x": { "$gt": "a" } }, false ; "comparison does not cross types")]
    #[test_case(doc! { "tags": "b" }, true ; "array contains")]
    #[test_case(doc! { "sub.y": "z" }, true ; "dotted path")]
    #[test_case(doc! { "missing": null }, true ; "null matches missing")]
    #[test_case(doc! { "n": { "$exists": true } }, true ; "exists on null field")]
    #[test_case(doc! { "missing": { "$exists": true } }, false ; "exists on missing field")]
    #[test_case(doc! { "x": { "$in": [1, 5] } }, true ; "in")]
    #[test_case(doc! { "x": { "$nin": [1, 5] } }, false ; "nin")]
    #[test_case(doc! { "$or": [{ "x": 1 }, { "_id": 1 }] }, true ; "or")]
    #[test_case(doc! { "$nor": [{ "x": 5 }] }, false ; "nor")]
    #[test_case(doc! { "x": { "$ne": 5 } }, false ; "ne")]
    fn test_filter(filter: Document, expected: bool) {
        assert_eq!(matches(&sample(), &filter).unwrap(), expected);
    }

    #[test]
    fn test_unknown_operator_is_bad_value() {
        let err = matches(&sample(), &doc! { "x": { "$regex": "a" } }).unwrap_err();
        assert_eq!(err.code(), Some(2));
    }

    #[test]
    fn test_sort_and_project() {
        let mut docs = vec![doc! { "_id": 2, "a": 1 }, doc! { "_id": 1, "a": 2 }, doc! { "_id": 3, "a": 1 }];
        sort_documents(&mut docs, &doc! { "a": -1, "_id": 1 });
        let ids: Vec<i32> = docs.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let projected = project(&docs[0], &doc! { "_id": 0, "a": 1 }).unwrap();
        assert_eq!(projected, doc! { "a": 2 });
        assert!(project(&docs[0], &doc! { "a": 1, "b": 0 }).is_err());
    }

    #[test]
    fn test_pipeline_stages() {
        let docs = vec![doc! { "_id": 1, "x": 1 }, doc! { "_id": 2, "x": 2 }, doc! { "_id": 3, "x": 3 }];
        let out = run_pipeline(
            docs.clone(),
            &[doc! { "$match": { "x": { "$gte": 2 } } }, doc! { "$sort": { "x": -1 } }, doc! { "$limit": 1 }],
        )
        .unwrap();
        assert_eq!(out, vec![doc! { "_id": 3, "x": 3 }]);

        let counted = run_pipeline(docs.clone(), &[doc! { "$count": "total" }]).unwrap();
        assert_eq!(counted, vec![doc! { "total": 3 }]);

        let err = run_pipeline(docs, &[doc! { "$lookup": {} }]).unwrap_err();
        assert_eq!(err.code(), Some(40324));
    }

    #[test]
    fn test_distinct_flattens_arrays() {
        let docs = vec![doc! { "t": ["a", "b"] }, doc! { "t": "a" }, doc! { "t": 1 }, doc! { "t": 1.0 }];
        let values = distinct_values(docs.iter(), "t");
        assert_eq!(values, vec![Bson::from("a"), Bson::from("b"), Bson::Int32(1)]);
    }
}
