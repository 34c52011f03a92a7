// Copyright (C) 2025 Fetchgate Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use futures::future::BoxFuture;
use tracing::{error, warn};

use super::ObjectStore;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from the environment/default provider chain, falling
    /// back to `us-east-1` when no region is configured (the teacher's own
    /// default).
    pub async fn connect(bucket: impl Into<String>) -> Self {
        let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
        let config = aws_config::from_env().region(region_provider).load().await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            match self.client.get_object().bucket(&self.bucket).key(path).send().await {
                Ok(resp) => match resp.body.collect().await {
                    Ok(collected) => Some(collected.into_bytes().to_vec()),
                    Err(e) => {
                        error!(path, error = %e, "failed to read S3 object body");
                        None
                    }
                },
                Err(e) => {
                    warn!(path, error = %e, "failed to get S3 object");
                    None
                }
            }
        })
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(path)
                .body(ByteStream::from(bytes))
                .content_type("application/gzip")
                .send()
                .await;
            if let Err(e) = result {
                error!(path, bucket = %self.bucket, error = %e, "failed to put S3 object");
            }
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let listed = match self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .send()
                .await
            {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(prefix, error = %e, "failed to list S3 objects for deletion");
                    return 0;
                }
            };
            let keys: Vec<String> = listed
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect();
            let mut deleted = 0;
            for key in keys {
                if self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .is_ok()
                {
                    deleted += 1;
                }
            }
            deleted
        })
    }
}
