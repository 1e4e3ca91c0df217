//! Update operators and replacement semantics

use bson::{oid::ObjectId, Bson, Document};

use super::{query, server_error};
use crate::options::UpdateModifications;
use crate::{Error, Result};

/// Client-side check that an update carries only update operators
pub(crate) fn validate_update(update: &UpdateModifications) -> Result<()> {
    match update {
        UpdateModifications::Document(doc) => {
            if doc.is_empty() {
                return Err(Error::invalid_argument("update document must not be empty"));
            }
            if doc.keys().any(|k| !k.starts_with('$')) {
                return Err(Error::invalid_argument(
                    "update document must only contain update operators",
                ));
            }
            Ok(())
        }
        UpdateModifications::Pipeline(_) => Ok(()),
    }
}

/// Client-side check that a replacement carries no update operators
pub(crate) fn validate_replacement(replacement: &Document) -> Result<()> {
    if replacement.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) {
        return Err(Error::invalid_argument(
            "replacement document must not contain update operators",
        ));
    }
    Ok(())
}

/// Applies an update to a copy of `original`. `inserting` enables
/// `$setOnInsert`.
pub(crate) fn apply_update(original: &Document, update: &UpdateModifications, inserting: bool) -> Result<Document> {
    let mut updated = original.clone();
    match update {
        UpdateModifications::Document(operators) => {
            for (operator, operand) in operators {
                apply_operator(&mut updated, operator, operand, inserting)?;
            }
        }
        UpdateModifications::Pipeline(stages) => {
            for stage in stages {
                apply_stage(&mut updated, stage)?;
            }
        }
    }
    check_id_unchanged(original, &updated)?;
    Ok(updated)
}

/// Replaces the document body while keeping its `_id` first
pub(crate) fn apply_replacement(original: &Document, replacement: &Document) -> Result<Document> {
    let mut replaced = Document::new();
    if let Some(id) = original.get("_id") {
        replaced.insert("_id", id.clone());
    }
    for (key, value) in replacement {
        replaced.insert(key.clone(), value.clone());
    }
    check_id_unchanged(original, &replaced)?;
    Ok(replaced)
}

/// Starting document for an upsert: the filter's equality conditions
pub(crate) fn upsert_seed(filter: &Document) -> Result<Document> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        let is_operator = matches!(value, Bson::Document(d)
            if d.keys().next().map(|k| k.starts_with('$')).unwrap_or(false));
        if is_operator {
            if let Some(eq) = value.as_document().and_then(|d| d.get("$eq")) {
                set_path(&mut seed, key, eq.clone())?;
            }
            continue;
        }
        set_path(&mut seed, key, value.clone())?;
    }
    Ok(seed)
}

/// Gives a newly inserted document an `_id` if it has none
pub(crate) fn ensure_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = Document::new();
    with_id.insert("_id", ObjectId::new());
    for (key, value) in document {
        with_id.insert(key, value);
    }
    with_id
}

fn check_id_unchanged(original: &Document, updated: &Document) -> Result<()> {
    match (original.get("_id"), updated.get("_id")) {
        (Some(before), Some(after)) if before == after => Ok(()),
        (None, _) => Ok(()),
        _ => Err(server_error(
            66,
            "Performing an update on the path '_id' would modify the immutable field '_id'",
        )),
    }
}

fn apply_operator(document: &mut Document, operator: &str, operand: &Bson, inserting: bool) -> Result<()> {
    let Bson::Document(fields) = operand else {
        return Err(server_error(
            9,
            format!(
                "Modifiers operate on fields but we found type {:?} instead",
                operand.element_type()
            ),
        ));
    };
    for (path, value) in fields {
        match operator {
            "$set" => set_path(document, path, value.clone())?,
            "$setOnInsert" => {
                if inserting {
                    set_path(document, path, value.clone())?;
                }
            }
            "$unset" => remove_path(document, path),
            "$inc" | "$mul" => {
                let current = query::get_path(document, path).cloned();
                let result = arithmetic(operator, path, current, value)?;
                set_path(document, path, result)?;
            }
            other => {
                return Err(server_error(
                    9,
                    format!(
                        "Unknown modifier: {}. Expected a valid update modifier or pipeline-style update specified as an array",
                        other
                    ),
                ))
            }
        }
    }
    Ok(())
}

fn apply_stage(document: &mut Document, stage: &Document) -> Result<()> {
    match stage.iter().next().map(|(name, arg)| (name.as_str(), arg)) {
        Some(("$set" | "$addFields", Bson::Document(fields))) => {
            for (path, value) in fields {
                set_path(document, path, value.clone())?;
            }
            Ok(())
        }
        Some(("$unset", Bson::String(path))) => {
            remove_path(document, path);
            Ok(())
        }
        Some(("$unset", Bson::Array(paths))) => {
            for path in paths.iter().filter_map(Bson::as_str) {
                remove_path(document, path);
            }
            Ok(())
        }
        Some((name, _)) => Err(server_error(
            40324,
            format!("Unrecognized pipeline stage name: '{}'", name),
        )),
        None => Err(server_error(
            40323,
            "A pipeline stage specification object must contain exactly one field.",
        )),
    }
}

fn arithmetic(operator: &str, path: &str, current: Option<Bson>, operand: &Bson) -> Result<Bson> {
    let non_numeric = |what: &str| {
        server_error(
            14,
            format!("Cannot apply {} to a value of non-numeric type. {}", operator, what),
        )
    };
    let current = match current {
        Some(value) => value,
        // $mul on a missing field yields a zero of the operand's type
        None if operator == "$mul" => match operand {
            Bson::Int32(_) => Bson::Int32(0),
            Bson::Int64(_) => Bson::Int64(0),
            _ => Bson::Double(0.0),
        },
        None => Bson::Int32(0),
    };
    let result = match (&current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let wide = if operator == "$inc" { i64::from(*a) + i64::from(*b) } else { i64::from(*a) * i64::from(*b) };
            i32::try_from(wide).map(Bson::Int32).unwrap_or(Bson::Int64(wide))
        }
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let (a, b) = (query::as_i64(&current).unwrap_or(0), query::as_i64(operand).unwrap_or(0));
            Bson::Int64(if operator == "$inc" { a.wrapping_add(b) } else { a.wrapping_mul(b) })
        }
        (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_), Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => {
            let (a, b) = (to_f64(&current), to_f64(operand));
            Bson::Double(if operator == "$inc" { a + b } else { a * b })
        }
        (_, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => {
            return Err(non_numeric(&format!("Field '{}' has a non-numeric value", path)))
        }
        _ => return Err(non_numeric("Operand must be a number")),
    };
    Ok(result)
}

fn to_f64(value: &Bson) -> f64 {
    match value {
        Bson::Int32(n) => f64::from(*n),
        Bson::Int64(n) => *n as f64,
        Bson::Double(n) => *n,
        _ => 0.0,
    }
}

fn path_not_viable(field: &str, parent: &Bson) -> Error {
    server_error(
        28,
        format!("Cannot create field '{}' in element {{{}}}", field, parent),
    )
}

/// Sets a dotted path, creating intermediate documents
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(child) => set_in_value(child, rest, value),
                None => Err(path_not_viable(head, &Bson::Null)),
            }
        }
    }
}

fn set_in_value(target: &mut Bson, path: &str, value: Bson) -> Result<()> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    match target {
        Bson::Document(doc) => set_path(doc, path, value),
        Bson::Array(items) => {
            let index: usize = head
                .parse()
                .map_err(|_| path_not_viable(head, &Bson::Array(items.clone())))?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if items[index] == Bson::Null {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in_value(&mut items[index], rest, value)
                }
            }
        }
        other => Err(path_not_viable(head, other)),
    }
}

pub(crate) fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn update(doc: Document) -> UpdateModifications {
        UpdateModifications::Document(doc)
    }

    #[test]
    fn test_set_inc_unset() {
        let original = doc! { "_id": 1, "x": 1, "drop": true };
        let updated = apply_update(
            &original,
            &update(doc! {
                "$set": { "a.b": "c" },
                "$inc": { "x": 2, "fresh": 5 },
                "$unset": { "drop": "" },
            }),
            false,
        )
        .unwrap();
        assert_eq!(
            updated,
            doc! { "_id": 1, "x": 3, "a": { "b": "c" }, "fresh": 5 }
        );
    }

    #[test]
    fn test_set_on_insert_only_applies_on_insert() {
        let op = update(doc! { "$setOnInsert": { "y": 1 } });
        assert!(!apply_update(&doc! { "_id": 1 }, &op, false).unwrap().contains_key("y"));
        assert!(apply_update(&doc! { "_id": 1 }, &op, true).unwrap().contains_key("y"));
    }

    #[test]
    fn test_id_is_immutable() {
        let err = apply_update(&doc! { "_id": 1 }, &update(doc! { "$set": { "_id": 2 } }), false)
            .unwrap_err();
        assert_eq!(err.code(), Some(66));
        assert!(apply_replacement(&doc! { "_id": 1 }, &doc! { "_id": 2 }).is_err());
        assert_eq!(
            apply_replacement(&doc! { "_id": 1, "a": 1 }, &doc! { "b": 2 }).unwrap(),
            doc! { "_id": 1, "b": 2 }
        );
    }

    #[test]
    fn test_unknown_modifier_and_type_mismatch() {
        let err = apply_update(&doc! {}, &update(doc! { "$bogus": { "a": 1 } }), false).unwrap_err();
        assert_eq!(err.code(), Some(9));
        let err = apply_update(&doc! { "a": "s" }, &update(doc! { "$inc": { "a": 1 } }), false).unwrap_err();
        assert_eq!(err.code(), Some(14));
    }

    #[test]
    fn test_client_side_validation() {
        assert!(validate_update(&update(doc! { "x": 1 })).is_err());
        assert!(validate_update(&update(doc! { "$set": { "x": 1 } })).is_ok());
        assert!(validate_replacement(&doc! { "$set": { "x": 1 } }).is_err());
    }

    #[test]
    fn test_upsert_seed_uses_equality_conditions() {
        let seed = upsert_seed(&doc! { "_id": 3, "a.b": 1, "c": { "$gt": 2 }, "d": { "$eq": 4 } }).unwrap();
        assert_eq!(seed, doc! { "_id": 3, "a": { "b": 1 }, "d": 4 });
        assert!(ensure_id(doc! { "x": 1 }).get_object_id("_id").is_ok());
    }

    #[test]
    fn test_pipeline_update() {
        let stages = UpdateModifications::Pipeline(vec![doc! { "$set": { "y": 2 } }, doc! { "$unset": "x" }]);
        let updated = apply_update(&doc! { "_id": 1, "x": 1 }, &stages, false).unwrap();
        assert_eq!(updated, doc! { "_id": 1, "y": 2 });
    }
}
