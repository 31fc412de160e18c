//! Sharded YAML record store.
//!
//! Records live at `<root>/<s1>/<s2>/<uuid>.yaml`, where `s1`/`s2` are the first four hex
//! characters of the record's canonical UUID. Writes go to a temporary file in the same
//! directory and are renamed into place so a crash never leaves a half-written record.

use crate::constants::RECORD_EXTENSION;
use crate::{GatewayError, GatewayResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use uhi_uuid::ShardableUuid;

#[derive(Debug, Clone)]
pub struct YamlStore<T> {
    root: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> YamlStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: PathBuf) -> GatewayResult<Self> {
        fs::create_dir_all(&root).map_err(|e| {
            GatewayError::Storage(format!("failed to create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            _record: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ShardableUuid) -> PathBuf {
        id.sharded_file(&self.root, RECORD_EXTENSION)
    }

    /// Writes `record` under `id`, replacing any previous version.
    pub fn save(&self, id: &ShardableUuid, record: &T) -> GatewayResult<()> {
        let path = self.path_for(id);
        let dir = id.shard_dir(&self.root);
        fs::create_dir_all(&dir).map_err(|e| {
            GatewayError::Storage(format!("failed to create {}: {e}", dir.display()))
        })?;

        let yaml = serde_yaml::to_string(record)?;
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        fs::write(&tmp, yaml).map_err(|e| {
            GatewayError::Storage(format!("failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            GatewayError::Storage(format!("failed to move {} into place: {e}", path.display()))
        })
    }

    /// Reads the record stored under `id`, if there is one.
    pub fn load(&self, id: &ShardableUuid) -> GatewayResult<Option<T>> {
        let path = self.path_for(id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatewayError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Some(serde_yaml::from_str(&text)?))
    }

    /// Removes the record stored under `id`. Missing records are not an error.
    pub fn remove(&self, id: &ShardableUuid) -> GatewayResult<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Storage(format!(
                "failed to remove record {id}: {e}"
            ))),
        }
    }

    /// Loads every record in the store.
    ///
    /// Unreadable or unparseable files are logged and skipped so one bad record cannot keep
    /// the gateway from starting.
    pub fn load_all(&self) -> Vec<T> {
        let mut records = Vec::new();

        let Ok(s1_iter) = fs::read_dir(&self.root) else {
            return records;
        };
        for s1 in s1_iter.flatten() {
            let s1_path = s1.path();
            if !s1_path.is_dir() {
                continue;
            }
            let Ok(s2_iter) = fs::read_dir(&s1_path) else {
                continue;
            };
            for s2 in s2_iter.flatten() {
                let s2_path = s2.path();
                if !s2_path.is_dir() {
                    continue;
                }
                let Ok(files) = fs::read_dir(&s2_path) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                        continue;
                    }
                    match fs::read_to_string(&path)
                        .map_err(|e| e.to_string())
                        .and_then(|text| serde_yaml::from_str::<T>(&text).map_err(|e| e.to_string()))
                    {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record")
                        }
                    }
                }
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uhi_uuid::ConsentId;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
    }

    #[test]
    fn saves_loads_and_removes_records() {
        let dir = tempfile::tempdir().unwrap();
        let store: YamlStore<Record> = YamlStore::open(dir.path().join("records")).unwrap();
        let id = ConsentId::new().shardable();

        store.save(&id, &Record { name: "first".into() }).unwrap();
        store.save(&id, &Record { name: "second".into() }).unwrap();
        assert_eq!(store.load_all(), vec![Record { name: "second".into() }]);
        assert_eq!(store.load(&id).unwrap(), Some(Record { name: "second".into() }));
        assert_eq!(store.load(&ConsentId::new().shardable()).unwrap(), None);

        let expected = id.sharded_file(store.root(), "yaml");
        assert!(expected.is_file());

        store.remove(&id).unwrap();
        store.remove(&id).unwrap();
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store: YamlStore<Record> = YamlStore::open(dir.path().to_path_buf()).unwrap();
        let good = ConsentId::new().shardable();
        store.save(&good, &Record { name: "ok".into() }).unwrap();

        let bad = ConsentId::new().shardable();
        let bad_path = bad.sharded_file(dir.path(), "yaml");
        fs::create_dir_all(bad_path.parent().unwrap()).unwrap();
        fs::write(&bad_path, "name: [unterminated").unwrap();

        assert_eq!(store.load_all().len(), 1);
    }
}
