use std::io::{Cursor, Read};
use std::ops::Range;
use std::sync::Arc;

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use coldscan_core::{CloudError, CloudResult, ObjectEntry, ObjectPage, ObjectStorage};
use tokio::runtime::Runtime;
use tracing::debug;

pub struct S3ObjectStorage {
    runtime: Arc<Runtime>,
    client: Client,
}

impl S3ObjectStorage {
    pub(crate) fn new(runtime: Arc<Runtime>, client: Client) -> Self {
        Self { runtime, client }
    }
}

fn failure<E>(operation: &'static str, err: E) -> CloudError
where
    E: std::error::Error,
{
    CloudError::new(operation, DisplayErrorContext(err).to_string())
}

/// HTTP `Range` header for an end-exclusive byte range.
fn range_header(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

impl ObjectStorage for S3ObjectStorage {
    fn list_buckets(&self) -> CloudResult<Vec<String>> {
        let output = self
            .runtime
            .block_on(self.client.list_buckets().send())
            .map_err(|err| failure("ListBuckets", err))?;
        Ok(output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(str::to_string))
            .collect())
    }

    fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> CloudResult<ObjectPage> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(bucket)
                    .set_continuation_token(continuation_token.map(str::to_string))
                    .send(),
            )
            .map_err(|err| failure("ListObjectsV2", err))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectEntry {
                    key: object.key()?.to_string(),
                    size: object
                        .size()
                        .and_then(|size| u64::try_from(size).ok())
                        .unwrap_or(0),
                })
            })
            .collect();
        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> CloudResult<Box<dyn Read + Send>> {
        if range.is_empty() {
            return Ok(Box::new(Cursor::new(Vec::new())));
        }
        debug!("fetching s3://{}/{} {:?}", bucket, key, range);
        let bytes = self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .range(range_header(&range))
                .send()
                .await
                .map_err(|err| failure("GetObject", err))?;
            output
                .body
                .collect()
                .await
                .map(|data| data.into_bytes())
                .map_err(|err| CloudError::new("GetObject", err.to_string()))
        })?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::range_header;

    #[test]
    fn range_header_is_inclusive_of_last_byte() {
        assert_eq!(range_header(&(0..2_097_152)), "bytes=0-2097151");
        assert_eq!(range_header(&(4_194_304..5_242_880)), "bytes=4194304-5242879");
        assert_eq!(range_header(&(7..8)), "bytes=7-7");
    }
}
