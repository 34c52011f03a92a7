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

use std::env;

use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tracing::{error, warn};

use super::ObjectStore;

pub struct AzureObjectStore {
    client: BlobServiceClient,
    container: String,
}

impl AzureObjectStore {
    /// Builds a client from `AZURE_STORAGE_ACCOUNT` / `AZURE_STORAGE_ACCESS_KEY`,
    /// the teacher's own environment contract.
    pub fn connect(container: impl Into<String>) -> Self {
        let account = env::var("AZURE_STORAGE_ACCOUNT")
            .expect("missing environment variable AZURE_STORAGE_ACCOUNT");
        let access_key = env::var("AZURE_STORAGE_ACCESS_KEY")
            .expect("missing environment variable AZURE_STORAGE_ACCESS_KEY");
        let credentials = StorageCredentials::access_key(account.clone(), access_key);
        Self {
            client: BlobServiceClient::new(account, credentials),
            container: container.into(),
        }
    }

    pub fn from_client(client: BlobServiceClient, container: impl Into<String>) -> Self {
        Self {
            client,
            container: container.into(),
        }
    }

    fn blob(&self, path: &str) -> BlobClient {
        self.client
            .container_client(self.container.clone())
            .blob_client(path)
    }
}

impl ObjectStore for AzureObjectStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            match self.blob(path).get_content().await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(path, container = %self.container, error = %e, "failed to load Azure blob");
                    None
                }
            }
        })
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self
                .blob(path)
                .put_block_blob(bytes)
                .content_type("application/gzip")
                .into_future()
                .await;
            if let Err(e) = result {
                error!(path, container = %self.container, error = %e, "failed to store Azure blob");
            }
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let container = self.client.container_client(self.container.clone());
            let mut pages = container.list_blobs().prefix(prefix.to_string()).into_stream();
            let mut names = Vec::new();
            while let Some(page) = pages.next().await {
                match page {
                    Ok(page) => names.extend(page.blobs.blobs().map(|b| b.name.clone())),
                    Err(e) => {
                        warn!(prefix, error = %e, "failed to list Azure blobs for deletion");
                        break;
                    }
                }
            }
            let mut deleted = 0;
            for name in names {
                if container.blob_client(name).delete().into_future().await.is_ok() {
                    deleted += 1;
                }
            }
            deleted
        })
    }
}
