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

use std::borrow::Cow;

use futures::future::BoxFuture;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use tracing::{error, warn};

use super::ObjectStore;

pub struct GcsObjectStore {
    client: Client,
    bucket: String,
}

impl GcsObjectStore {
    pub async fn connect(bucket: impl Into<String>) -> Self {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .expect("failed to authenticate with GCS");
        Self {
            client: Client::new(config),
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

impl ObjectStore for GcsObjectStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let req = GetObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            };
            match self.client.download_object(&req, &Range::default()).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(path, bucket = %self.bucket, error = %e, "failed to download GCS object");
                    None
                }
            }
        })
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let req = UploadObjectRequest {
                bucket: self.bucket.clone(),
                ..Default::default()
            };
            let media = Media {
                name: Cow::Owned(path.to_string()),
                content_type: Cow::Borrowed("application/gzip"),
                content_length: Some(bytes.len() as u64),
            };
            if let Err(e) = self
                .client
                .upload_object(&req, bytes, &UploadType::Simple(media))
                .await
            {
                error!(path, bucket = %self.bucket, error = %e, "failed to upload GCS object");
            }
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let req = ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(prefix.to_string()),
                ..Default::default()
            };
            let listed = match self.client.list_objects(&req).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(prefix, error = %e, "failed to list GCS objects for deletion");
                    return 0;
                }
            };
            let names: Vec<String> = listed
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|o| o.name)
                .collect();
            let mut deleted = 0;
            for name in names {
                let del = DeleteObjectRequest {
                    bucket: self.bucket.clone(),
                    object: name,
                    ..Default::default()
                };
                if self.client.delete_object(&del).await.is_ok() {
                    deleted += 1;
                }
            }
            deleted
        })
    }
}
