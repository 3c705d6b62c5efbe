//! Merging reloaded records with user state, and the on-disk cache.
//!
//! The cache file is `<cacheOutput>/mock.json`:
//!
//! ```json
//! { "data": { "GET /users": { "id": "GET /users", "enable": false, ... } },
//!   "updateTime": 1700000000000 }
//! ```

use crate::config::CACHE_FILE_NAME;
use crate::error::CacheError;
use crate::record::{MockRecord, RecordSet, RecordView};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reconcile freshly loaded records with the previous set.
///
/// Every field comes from `fresh` except `enable`, which is carried over
/// from `old` when the id already existed. Ids missing from `fresh` are
/// dropped.
pub fn merge(old: &RecordSet, fresh: RecordSet) -> RecordSet {
    fresh
        .into_iter()
        .map(|mut record| {
            record.enable = old.get(&record.id).map_or(true, |previous| previous.enable);
            record
        })
        .collect()
}

/// On-disk form of the record set.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub data: RecordMap,
    #[serde(rename = "updateTime", default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

/// Records keyed by id, kept in file order.
#[derive(Debug, Default)]
pub struct RecordMap(pub Vec<RecordView>);

impl Serialize for RecordMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for view in &self.0 {
            map.serialize_entry(&view.id, view)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RecordMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordMapVisitor;

        impl<'de> Visitor<'de> for RecordMapVisitor {
            type Value = RecordMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of record id to record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RecordMap, A::Error> {
                let mut views = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, mut view)) = access.next_entry::<String, RecordView>()? {
                    // The key is authoritative
                    view.id = id;
                    views.push(view);
                }
                Ok(RecordMap(views))
            }
        }

        deserializer.deserialize_map(RecordMapVisitor)
    }
}

/// Reads and writes the cache file.
#[derive(Debug, Clone)]
pub struct MockCache {
    path: PathBuf,
}

impl MockCache {
    /// Cache stored in `dir`, which is created on first write.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CACHE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record set and its update time.
    ///
    /// The envelope is written to a sibling temp file and renamed over the
    /// cache, so readers never observe a partial file.
    pub fn persist(&self, records: &RecordSet, update_time: Option<i64>) -> Result<(), CacheError> {
        let envelope = CacheEnvelope {
            data: RecordMap(records.iter().map(MockRecord::view).collect()),
            update_time,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), records = records.len(), "Persisted mock cache");
        Ok(())
    }

    /// Read the cached set; a missing file is an empty set with no timestamp.
    ///
    /// Restored records carry no handler until the next load merges them.
    pub fn load(&self) -> Result<(RecordSet, Option<i64>), CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((RecordSet::new(), None));
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let envelope: CacheEnvelope =
            serde_json::from_str(&content).map_err(|source| CacheError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        let records = envelope.data.0.into_iter().map(MockRecord::from_view).collect();
        Ok((records, envelope.update_time))
    }
}
