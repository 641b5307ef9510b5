// Copyright 2024 The Pixfetch Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use pixfetch::disk_store::{DiskStore, DiskWriteOptions};
use pixfetch_config::DiskCacheConfig;
use pixfetch_error::Error;
use pixfetch_util::expiration::{Expiration, ExpirationExtending};

fn store_in(temp: &tempfile::TempDir) -> DiskStore {
    DiskStore::new(config_in(temp)).unwrap()
}

fn config_in(temp: &tempfile::TempDir) -> DiskCacheConfig {
    DiskCacheConfig {
        directory: Some(temp.path().to_path_buf()),
        ..DiskCacheConfig::new("test-cache")
    }
}

#[cfg(test)]
mod disk_store_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn store_then_value_round_trips() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        let data = Bytes::from_static(b"png-ish payload");
        store
            .store("key-1", &data, None, &DiskWriteOptions::default())
            .await?;

        let read = store.value("key-1", ExpirationExtending::None).await?;
        assert_eq!(read, Some(data), "Expected stored bytes back");
        assert_eq!(
            store.value("key-2", ExpirationExtending::None).await?,
            None,
            "Expected an unrelated key to miss"
        );
        Ok(())
    }

    #[tokio::test]
    async fn value_sync_reads_on_the_caller_thread() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        let data = Bytes::from_static(b"sync payload");
        store.store("key", &data, None, &DiskWriteOptions::default()).await?;

        assert_eq!(store.value_sync("key", ExpirationExtending::None)?, Some(data));
        Ok(())
    }

    #[tokio::test]
    async fn hashed_filenames_are_fixed_width_hex() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        // Reserved filesystem characters, very long keys, and zero-byte
        // payloads are all fine; the digest flattens them all.
        let awkward_key = format!("https://example.com/a/b?q={}", "x".repeat(4096));
        let name = store.file_name(&awkward_key);
        assert_eq!(name.len(), 32, "Expected a 128-bit hex digest file name");
        assert_eq!(name.chars().all(|c| c.is_ascii_hexdigit()), true);

        store
            .store(&awkward_key, &Bytes::new(), None, &DiskWriteOptions::default())
            .await?;
        assert_eq!(
            store.value(&awkward_key, ExpirationExtending::None).await?,
            Some(Bytes::new()),
            "Expected a zero-byte entry to round trip"
        );
        Ok(())
    }

    #[tokio::test]
    async fn unhashed_filenames_escape_reserved_characters() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(DiskCacheConfig {
            use_hashed_filenames: false,
            ..config_in(&temp)
        })?;

        let key = "dir/name:with?reserved";
        store
            .store(key, &Bytes::from_static(b"x"), None, &DiskWriteOptions::default())
            .await?;
        assert_eq!(store.file_name(key).contains('/'), false);
        assert_eq!(
            store.value(key, ExpirationExtending::None).await?,
            Some(Bytes::from_static(b"x"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn configured_extension_is_appended() {
        let temp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(DiskCacheConfig {
            path_extension: Some("png".to_string()),
            ..config_in(&temp)
        })
        .unwrap();
        assert_eq!(store.file_name("key").ends_with(".png"), true);
    }

    #[tokio::test]
    async fn expired_entry_is_not_cached() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store(
                "key",
                &Bytes::from_static(b"data"),
                Some(Expiration::Seconds(60)),
                &DiskWriteOptions::default(),
            )
            .await?;

        assert_eq!(store.is_cached("key", None), true);
        let past_deadline = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(
            store.is_cached("key", Some(past_deadline)),
            false,
            "Expected entry with TTL 60s to be a miss at +120s"
        );

        let removed = store.remove_expired(past_deadline).await?;
        assert_eq!(removed.len(), 1);
        assert_eq!(store.value("key", ExpirationExtending::None).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn storing_expired_is_an_immediate_miss() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store(
                "key",
                &Bytes::from_static(b"data"),
                Some(Expiration::Expired),
                &DiskWriteOptions::default(),
            )
            .await?;
        assert_eq!(store.value("key", ExpirationExtending::None).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn extending_read_pushes_the_deadline() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store(
                "key",
                &Bytes::from_static(b"data"),
                Some(Expiration::Seconds(60)),
                &DiskWriteOptions::default(),
            )
            .await?;

        // An extending read re-arms the 60s TTL from now, so a reference
        // date 90s out is still before the new deadline.
        store.value("key", ExpirationExtending::CacheTime).await?;
        let reference = SystemTime::now() + Duration::from_secs(90);
        assert_eq!(
            store.is_cached("key", Some(reference)),
            true,
            "Expected the extending read to have pushed the deadline"
        );

        // A plain read must not.
        let temp2 = tempfile::tempdir().unwrap();
        let store2 = store_in(&temp2);
        store2
            .store(
                "key",
                &Bytes::from_static(b"data"),
                Some(Expiration::Seconds(60)),
                &DiskWriteOptions::default(),
            )
            .await?;
        store2.value("key", ExpirationExtending::None).await?;
        assert_eq!(store2.is_cached("key", Some(reference)), false);
        Ok(())
    }

    #[tokio::test]
    async fn missing_sidecar_is_treated_as_never_expiring() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        // Simulate an externally populated cache directory: a content file
        // with no metadata sidecar.
        let path = store.directory().join(store.file_name("external"));
        std::fs::write(&path, b"external bytes").unwrap();

        assert_eq!(store.is_cached("external", None), true);
        assert_eq!(
            store.value("external", ExpirationExtending::None).await?,
            Some(Bytes::from_static(b"external bytes"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn malformed_sidecar_is_treated_as_never_expiring() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store("key", &Bytes::from_static(b"data"), None, &DiskWriteOptions::default())
            .await?;
        let meta_path = store
            .directory()
            .join(format!("{}.meta", store.file_name("key")));
        std::fs::write(&meta_path, b"not bincode at all").unwrap();

        assert_eq!(store.is_cached("key", None), true);
        assert_eq!(
            store.value("key", ExpirationExtending::None).await?,
            Some(Bytes::from_static(b"data"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn remove_size_exceeded_evicts_oldest_first() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(DiskCacheConfig {
            size_limit_bytes: 100,
            ..config_in(&temp)
        })?;

        // Four 40-byte entries: 160 bytes total against a 100-byte limit.
        let payload = Bytes::from(vec![0u8; 40]);
        for key in ["a", "b", "c", "d"] {
            store.store(key, &payload, None, &DiskWriteOptions::default()).await?;
        }
        // Pin access order explicitly through mtimes: "a" oldest.
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            let path = store.directory().join(store.file_name(key));
            filetime::set_file_mtime(
                &path,
                FileTime::from_system_time(base + Duration::from_secs(i as u64)),
            )
            .unwrap();
        }

        let removed = store.remove_size_exceeded().await?;

        // Target is limit * 0.5 = 50 bytes, so three entries must go,
        // oldest access first.
        assert_eq!(removed.len(), 3);
        assert_eq!(store.total_size().await? <= 50, true);
        assert_eq!(store.is_cached("d", None), true, "Expected the newest entry to survive");
        assert_eq!(store.is_cached("a", None), false);
        assert_eq!(
            removed[0].file_name().unwrap().to_string_lossy(),
            store.file_name("a"),
            "Expected eviction in ascending mtime order"
        );
        Ok(())
    }

    #[tokio::test]
    async fn remove_size_exceeded_is_a_noop_under_budget() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(DiskCacheConfig {
            size_limit_bytes: 1000,
            ..config_in(&temp)
        })?;
        store
            .store("a", &Bytes::from(vec![0u8; 40]), None, &DiskWriteOptions::default())
            .await?;
        assert_eq!(store.remove_size_exceeded().await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn total_size_excludes_sidecars() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store("a", &Bytes::from(vec![0u8; 10]), None, &DiskWriteOptions::default())
            .await?;
        store
            .store("b", &Bytes::from(vec![0u8; 30]), None, &DiskWriteOptions::default())
            .await?;

        assert_eq!(store.total_size().await?, 40);
        Ok(())
    }

    #[tokio::test]
    async fn remove_is_idempotent() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store("key", &Bytes::from_static(b"data"), None, &DiskWriteOptions::default())
            .await?;
        store.remove("key").await?;
        assert_eq!(store.is_cached("key", None), false);
        // Removing a non-existent entry is not an error.
        store.remove("key").await?;
        Ok(())
    }

    #[tokio::test]
    async fn remove_all_recreates_directory_unless_asked_not_to() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        store
            .store("key", &Bytes::from_static(b"data"), None, &DiskWriteOptions::default())
            .await?;
        store.remove_all(false).await?;
        assert_eq!(store.directory().is_dir(), true);
        assert_eq!(store.total_size().await?, 0);

        store.remove_all(true).await?;
        assert_eq!(store.directory().is_dir(), false);
        Ok(())
    }

    #[tokio::test]
    async fn write_recreates_externally_deleted_directory() -> Result<(), Error> {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);

        std::fs::remove_dir_all(store.directory()).unwrap();
        store
            .store("key", &Bytes::from_static(b"data"), None, &DiskWriteOptions::default())
            .await?;
        assert_eq!(
            store.value("key", ExpirationExtending::None).await?,
            Some(Bytes::from_static(b"data"))
        );
        Ok(())
    }
}
