//! Operations that are recognised but not carried out: the convenient
//! transaction API and grid file buckets

use async_trait::async_trait;
use serde::Deserialize;

use super::{inert, Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::error::RunnerResult;

macro_rules! placeholder {
    ($name:ident, $op:literal, [$($arg:literal),* $(,)?]) => {
        #[derive(Debug, Deserialize)]
        pub struct $name {}

        impl Arguments for $name {
            const NAME: &'static str = $op;
            const KNOWN_ARGUMENTS: &'static [&'static str] = &[$($arg),*];
        }

        #[async_trait]
        impl Execute for $name {
            async fn execute(
                &self,
                _target: &OperationTarget,
                _ctx: &mut ExecutionContext<'_>,
            ) -> RunnerResult<OperationResult> {
                inert(Self::NAME)
            }
        }
    };
}

placeholder!(
    WithTransaction,
    "withTransaction",
    ["callback", "readConcern", "writeConcern", "readPreference", "maxCommitTimeMS"]
);
placeholder!(Download, "download", ["id"]);
placeholder!(DownloadByName, "downloadByName", ["filename", "revision"]);
placeholder!(
    Upload,
    "upload",
    ["source", "filename", "chunkSizeBytes", "disableMD5", "contentType", "metadata"]
);
placeholder!(BucketDelete, "delete", ["id"]);
placeholder!(BucketRename, "rename", ["id", "newFilename"]);
placeholder!(BucketDrop, "drop", []);

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_placeholders_still_check_arguments() {
        assert!(Upload::decode(doc! { "source": { "$$hexBytes": "11" }, "filename": "f" }).is_ok());
        assert!(BucketDrop::decode(doc! { "force": true }).is_err());
        assert!(WithTransaction::decode(doc! { "callback": [] }).is_ok());
    }
}
