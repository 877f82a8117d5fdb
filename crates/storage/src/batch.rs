//! Batch file sets on top of an [`ObjectStore`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use facilitator_core::{AggregationId, AggregationWindow, Interval, PartyId};
use tracing::debug;
use uuid::Uuid;

use crate::{ObjectStore, Result, StorageError};

pub const HEADER_SUFFIX: &str = ".header";
pub const PAYLOAD_SUFFIX: &str = ".payload";
pub const SIGNATURE_SUFFIX: &str = ".sig";

const DATE_FORMAT: &str = "%Y/%m/%d/%H/%M";

/// Location of one batch: `{aggregation}/{YYYY/MM/DD/HH/MM}/{name}`.
///
/// The timestamp is kept at minute precision, the resolution of the path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub aggregation_id: AggregationId,
    pub timestamp: i64,
    pub name: String,
}

impl BatchKey {
    pub fn new(aggregation_id: AggregationId, timestamp: i64, name: impl Into<String>) -> Self {
        Self {
            aggregation_id,
            timestamp: timestamp - timestamp.rem_euclid(60),
            name: name.into(),
        }
    }

    /// Key of an ingestion or validation batch; both are named by batch UUID.
    pub fn for_batch(aggregation_id: AggregationId, timestamp: i64, batch_uuid: Uuid) -> Self {
        Self::new(aggregation_id, timestamp, batch_uuid.to_string())
    }

    /// Key of the sum batch one processor emits for a window.
    pub fn for_sum(window: &AggregationWindow, own: &PartyId, peer: &PartyId) -> Self {
        Self::new(
            window.aggregation_id.clone(),
            window.interval.start,
            format!("sum-{}-{}-{}", own, peer, window.interval.duration()),
        )
    }

    /// The object key prefix shared by the three files.
    pub fn base(&self) -> String {
        let date = DateTime::from_timestamp(self.timestamp, 0)
            .map(|t| t.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "0000/00/00/00/00".to_string());
        format!("{}/{}/{}", self.aggregation_id, date, self.name)
    }

    pub fn header_key(&self) -> String {
        format!("{}{HEADER_SUFFIX}", self.base())
    }

    pub fn payload_key(&self) -> String {
        format!("{}{PAYLOAD_SUFFIX}", self.base())
    }

    pub fn signature_key(&self) -> String {
        format!("{}{SIGNATURE_SUFFIX}", self.base())
    }

    /// Parse a base key produced by [`BatchKey::base`].
    pub fn parse(base: &str) -> Option<Self> {
        let mut parts = base.rsplitn(7, '/');
        let name = parts.next()?;
        let minute: u32 = parts.next()?.parse().ok()?;
        let hour: u32 = parts.next()?.parse().ok()?;
        let day: u32 = parts.next()?.parse().ok()?;
        let month: u32 = parts.next()?.parse().ok()?;
        let year: i32 = parts.next()?.parse().ok()?;
        let aggregation = parts.next()?;
        if name.is_empty() || aggregation.is_empty() {
            return None;
        }

        let timestamp = NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(hour, minute, 0)?
            .and_utc()
            .timestamp();
        Some(Self::new(AggregationId::new(aggregation), timestamp, name))
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())
    }
}

/// The raw bytes of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFiles {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Reads and writes whole batches.
///
/// Writes go payload, signature, header, each conditional. Readers list by
/// header, so a listed batch always has its other two files.
#[derive(Clone)]
pub struct BatchStore {
    inner: Arc<dyn ObjectStore>,
}

impl BatchStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    /// Batches whose header key starts with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<BatchKey>> {
        let keys: BTreeSet<BatchKey> = self
            .inner
            .list(prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_suffix(HEADER_SUFFIX))
            .filter_map(BatchKey::parse)
            .collect();
        Ok(keys.into_iter().collect())
    }

    /// Batches of `aggregation_id` whose path timestamp falls in `interval`.
    pub async fn list_window(
        &self,
        aggregation_id: &AggregationId,
        interval: &Interval,
    ) -> Result<Vec<BatchKey>> {
        let keys = self.list(&format!("{aggregation_id}/")).await?;
        Ok(keys
            .into_iter()
            .filter(|k| &k.aggregation_id == aggregation_id && interval.contains(k.timestamp))
            .collect())
    }

    pub async fn exists(&self, key: &BatchKey) -> Result<bool> {
        Ok(self.inner.get(&key.header_key()).await?.is_some())
    }

    /// Fetch all three files of a batch.
    pub async fn fetch(&self, key: &BatchKey) -> Result<BatchFiles> {
        let header_key = key.header_key();
        let payload_key = key.payload_key();
        let signature_key = key.signature_key();
        let (header, payload, signature) = futures::try_join!(
            self.inner.get(&header_key),
            self.inner.get(&payload_key),
            self.inner.get(&signature_key),
        )?;

        match (header, payload, signature) {
            (Some(header), Some(payload), Some(signature)) => Ok(BatchFiles {
                header,
                payload,
                signature,
            }),
            (None, None, None) => Err(StorageError::NotFound(key.base())),
            (header, payload, signature) => {
                let missing = [
                    (header.is_none(), HEADER_SUFFIX),
                    (payload.is_none(), PAYLOAD_SUFFIX),
                    (signature.is_none(), SIGNATURE_SUFFIX),
                ]
                .into_iter()
                .filter_map(|(absent, suffix)| absent.then_some(suffix))
                .collect();
                Err(StorageError::PartialBatch {
                    key: key.base(),
                    missing,
                })
            }
        }
    }

    /// Store a batch. Re-storing byte-identical payload and signature files is
    /// accepted so an interrupted write can be completed.
    ///
    /// `AlreadyExists` means a complete batch is present. Leftover files with
    /// different bytes and no header yield `PartialBatch`.
    pub async fn store(&self, key: &BatchKey, files: &BatchFiles) -> Result<()> {
        self.put_idempotent(key, &key.payload_key(), &files.payload).await?;
        self.put_idempotent(key, &key.signature_key(), &files.signature).await?;
        self.inner.put_if_absent(&key.header_key(), &files.header).await?;
        debug!(batch = %key, "batch stored");
        Ok(())
    }

    async fn put_idempotent(&self, key: &BatchKey, object: &str, bytes: &[u8]) -> Result<()> {
        match self.inner.put_if_absent(object, bytes).await {
            Err(StorageError::AlreadyExists(_)) => match self.inner.get(object).await? {
                Some(existing) if existing == bytes => Ok(()),
                _ => {
                    self.fetch(key).await?;
                    Err(StorageError::AlreadyExists(key.base()))
                }
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalStore, MemoryStore};

    // 2020-09-13T12:26:40Z
    const TS: i64 = 1_600_000_000;

    fn files(tag: u8) -> BatchFiles {
        BatchFiles {
            header: vec![tag, 1],
            payload: vec![tag, 2],
            signature: vec![tag, 3],
        }
    }

    fn key(name: &str) -> BatchKey {
        BatchKey::new(AggregationId::new("flu"), TS, name)
    }

    #[test]
    fn test_key_layout() {
        let k = key("abc");
        assert_eq!(k.timestamp, TS - 40);
        assert_eq!(k.base(), "flu/2020/09/13/12/26/abc");
        assert_eq!(k.header_key(), "flu/2020/09/13/12/26/abc.header");
        assert_eq!(k.payload_key(), "flu/2020/09/13/12/26/abc.payload");
        assert_eq!(k.signature_key(), "flu/2020/09/13/12/26/abc.sig");
    }

    #[test]
    fn test_key_parse_roundtrip() {
        let k = key("abc");
        assert_eq!(BatchKey::parse(&k.base()), Some(k));
        assert_eq!(BatchKey::parse("flu/2020/13/01/00/00/x"), None);
        assert_eq!(BatchKey::parse("2020/01/01/00/00/x"), None);
    }

    #[test]
    fn test_sum_key_name() {
        let window = AggregationWindow::new(
            AggregationId::new("flu"),
            Interval::new(TS - 40, TS - 40 + 3600).unwrap(),
        );
        let k = BatchKey::for_sum(&window, &PartyId::new("pha"), &PartyId::new("facil"));
        assert_eq!(k.name, "sum-pha-facil-3600");
        assert_eq!(k.timestamp, TS - 40);
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let store = BatchStore::new(Arc::new(MemoryStore::new()));
        let k = key("a");
        store.store(&k, &files(1)).await.unwrap();
        assert!(store.exists(&k).await.unwrap());
        assert_eq!(store.fetch(&k).await.unwrap(), files(1));
    }

    #[tokio::test]
    async fn test_fetch_missing_and_partial() {
        let memory = Arc::new(MemoryStore::new());
        let store = BatchStore::new(memory.clone());
        let k = key("a");

        assert!(matches!(store.fetch(&k).await, Err(StorageError::NotFound(_))));

        memory.overwrite(&k.payload_key(), vec![1]);
        match store.fetch(&k).await {
            Err(StorageError::PartialBatch { missing, .. }) => {
                assert_eq!(missing, vec![HEADER_SUFFIX, SIGNATURE_SUFFIX]);
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_is_conditional() {
        let store = BatchStore::new(Arc::new(MemoryStore::new()));
        let k = key("a");
        store.store(&k, &files(1)).await.unwrap();

        // Identical bytes still lose on the header.
        assert!(matches!(
            store.store(&k, &files(1)).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.store(&k, &files(2)).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(store.fetch(&k).await.unwrap(), files(1));
    }

    #[tokio::test]
    async fn test_store_completes_interrupted_write() {
        let memory = Arc::new(MemoryStore::new());
        let store = BatchStore::new(memory.clone());
        let k = key("a");
        memory.overwrite(&k.payload_key(), files(1).payload);

        store.store(&k, &files(1)).await.unwrap();
        assert_eq!(store.fetch(&k).await.unwrap(), files(1));
    }

    #[tokio::test]
    async fn test_store_over_conflicting_leftovers() {
        let memory = Arc::new(MemoryStore::new());
        let store = BatchStore::new(memory.clone());
        let k = key("a");
        memory.overwrite(&k.payload_key(), files(9).payload);

        match store.store(&k, &files(1)).await {
            Err(StorageError::PartialBatch { missing, .. }) => {
                assert_eq!(missing, vec![HEADER_SUFFIX, SIGNATURE_SUFFIX]);
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
        assert!(!store.exists(&k).await.unwrap());
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_list_window() {
        let store = BatchStore::new(Arc::new(MemoryStore::new()));
        let inside = BatchKey::new(AggregationId::new("flu"), TS, "in");
        let outside = BatchKey::new(AggregationId::new("flu"), TS + 7200, "out");
        let other = BatchKey::new(AggregationId::new("rsv"), TS, "other");
        for k in [&inside, &outside, &other] {
            store.store(k, &files(1)).await.unwrap();
        }

        let interval = Interval::new(TS - 40, TS - 40 + 3600).unwrap();
        let listed = store
            .list_window(&AggregationId::new("flu"), &interval)
            .await
            .unwrap();
        assert_eq!(listed, vec![inside]);
    }

    #[tokio::test]
    async fn test_headerless_batch_not_listed() {
        let memory = Arc::new(MemoryStore::new());
        let store = BatchStore::new(memory.clone());
        let k = key("a");
        memory.overwrite(&k.payload_key(), vec![1]);
        memory.overwrite(&k.signature_key(), vec![2]);
        assert!(store.list("flu/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchStore::new(Arc::new(LocalStore::new(dir.path())));
        let k = key("a");
        store.store(&k, &files(3)).await.unwrap();
        assert_eq!(store.list("flu/").await.unwrap(), vec![k.clone()]);
        assert_eq!(store.fetch(&k).await.unwrap(), files(3));
    }
}
