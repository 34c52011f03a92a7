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

use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::{error, warn};

use super::ObjectStore;

/// Filesystem-backed object store rooted at `base_dir`, generalized from the
/// teacher's `storage/cache/{app_id}/{key}.gz` layout: paths passed in by
/// `DistributedCache` are joined onto `base_dir` directly.
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let full_path = self.base_dir.join(path);
            match tokio::fs::read(&full_path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!(path = %full_path.display(), error = %e, "failed to read local cache file");
                    None
                }
            }
        })
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let full_path = self.base_dir.join(path);
            if let Some(parent) = full_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!(path = %parent.display(), error = %e, "failed to create local cache directory");
                    return;
                }
            }
            if let Err(e) = tokio::fs::write(&full_path, &bytes).await {
                error!(path = %full_path.display(), error = %e, "failed to write local cache file");
            }
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            // A trailing slash names a directory to clear entirely (e.g. a
            // whole namespace); otherwise the last segment is a filename
            // prefix within its parent directory.
            let (dir, file_prefix) = if prefix.ends_with('/') {
                (self.base_dir.join(prefix), String::new())
            } else {
                let full_prefix = self.base_dir.join(prefix);
                match (full_prefix.parent(), full_prefix.file_name()) {
                    (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
                    _ => return 0,
                }
            };
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => return 0,
            };
            let mut deleted = 0;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(&file_prefix) {
                    if tokio::fs::remove_file(entry.path()).await.is_ok() {
                        deleted += 1;
                    }
                }
            }
            deleted
        })
    }
}
