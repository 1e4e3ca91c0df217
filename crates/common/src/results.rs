//! Results returned by successful write operations

use bson::{doc, Bson, Document};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertManyResult {
    /// Ids keyed by the index of the document in the request
    pub inserted_ids: BTreeMap<usize, Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    pub inserted_ids: BTreeMap<usize, Bson>,
    pub upserted_ids: BTreeMap<usize, Bson>,
}

fn ids_document(ids: &BTreeMap<usize, Bson>) -> Document {
    ids.iter()
        .map(|(index, id)| (index.to_string(), id.clone()))
        .collect()
}

fn count(n: u64) -> Bson {
    Bson::Int64(n as i64)
}

impl InsertOneResult {
    pub fn to_document(&self) -> Document {
        doc! { "insertedId": self.inserted_id.clone() }
    }
}

impl InsertManyResult {
    pub fn to_document(&self) -> Document {
        doc! { "insertedIds": ids_document(&self.inserted_ids) }
    }
}

impl UpdateResult {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "matchedCount": count(self.matched_count),
            "modifiedCount": count(self.modified_count),
            "upsertedCount": count(u64::from(self.upserted_id.is_some())),
        };
        if let Some(id) = &self.upserted_id {
            doc.insert("upsertedId", id.clone());
        }
        doc
    }
}

impl DeleteResult {
    pub fn to_document(&self) -> Document {
        doc! { "deletedCount": count(self.deleted_count) }
    }
}

impl BulkWriteResult {
    pub fn to_document(&self) -> Document {
        doc! {
            "insertedCount": count(self.inserted_count),
            "matchedCount": count(self.matched_count),
            "modifiedCount": count(self.modified_count),
            "deletedCount": count(self.deleted_count),
            "upsertedCount": count(self.upserted_count),
            "insertedIds": ids_document(&self.inserted_ids),
            "upsertedIds": ids_document(&self.upserted_ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_result_omits_missing_upsert() {
        let result = UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_id: None,
        };
        let doc = result.to_document();
        assert!(!doc.contains_key("upsertedId"));
        assert_eq!(doc.get_i64("upsertedCount").unwrap(), 0);
    }

    #[test]
    fn test_insert_many_ids_keyed_by_index() {
        let mut ids = BTreeMap::new();
        ids.insert(0, Bson::Int32(7));
        ids.insert(1, Bson::Int32(8));
        let doc = InsertManyResult { inserted_ids: ids }.to_document();
        let ids = doc.get_document("insertedIds").unwrap();
        assert_eq!(ids.get("1"), Some(&Bson::Int32(8)));
    }
}
