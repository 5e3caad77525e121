//! Content digests and fingerprint persistence for the harvest planner.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ohp_core::{HistoryPoint, MatchFingerprint, OddsEntry, RawRecord};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ohp-storage";

/// Prices are compared in hundredths.
pub const PRICE_DECIMALS: u32 = 2;
const PRICE_SCALE: f64 = 100.0;
const ENTRY_DIGEST_LEN: usize = 16;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

/// Canonical `(bookmaker, market)` key used by digests and similarity scoring.
pub fn entry_key(bookmaker: &str, market: &str) -> String {
    format!("{}|{}", normalize_label(bookmaker), normalize_label(market))
}

fn price_units(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

fn canonical_prices(prices: &[f64]) -> String {
    prices
        .iter()
        .map(|p| price_units(*p).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn canonical_odds(odds: &[OddsEntry]) -> BTreeMap<String, String> {
    let mut canonical: BTreeMap<String, String> = BTreeMap::new();
    for entry in odds {
        let prices = canonical_prices(&entry.prices);
        canonical
            .entry(entry_key(&entry.bookmaker, &entry.market))
            .and_modify(|existing| {
                // Duplicate keys keep the greatest price string so input order never matters.
                if prices > *existing {
                    *existing = prices.clone();
                }
            })
            .or_insert(prices);
    }
    canonical
}

fn history_digest(points: &[HistoryPoint]) -> String {
    let lines: BTreeSet<String> = points
        .iter()
        .map(|point| {
            format!(
                "{}|{}|{}|{}",
                entry_key(&point.bookmaker, &point.market),
                point.outcome,
                point.recorded_at.timestamp(),
                price_units(point.price)
            )
        })
        .collect();
    sha256_hex(lines.into_iter().collect::<Vec<_>>().join("\n").as_bytes())
}

/// Order-independent digests of one scraped record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDigests {
    pub current_odds_digest: String,
    pub history_digest: Option<String>,
    pub entry_digests: BTreeMap<String, String>,
}

impl RecordDigests {
    pub fn from_record(record: &RawRecord) -> Self {
        let canonical = canonical_odds(&record.odds);
        let mut body = String::new();
        for (key, prices) in &canonical {
            body.push_str(key);
            body.push('=');
            body.push_str(prices);
            body.push('\n');
        }

        let entry_digests = canonical
            .iter()
            .map(|(key, prices)| {
                let digest = sha256_hex(prices.as_bytes());
                (key.clone(), digest[..ENTRY_DIGEST_LEN].to_string())
            })
            .collect();

        Self {
            current_odds_digest: sha256_hex(body.as_bytes()),
            history_digest: record.history.as_deref().map(history_digest),
            entry_digests,
        }
    }

    pub fn to_fingerprint(&self, match_id: &str, seen_at: DateTime<Utc>) -> MatchFingerprint {
        MatchFingerprint {
            match_id: match_id.to_string(),
            current_odds_digest: self.current_odds_digest.clone(),
            history_digest: self.history_digest.clone(),
            entry_digests: self.entry_digests.clone(),
            last_seen_at: seen_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fingerprint io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt fingerprint record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing fingerprint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Keyed last-seen digests. Writes are atomic per key; same-key writes are serialized.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, match_id: &str) -> Result<Option<MatchFingerprint>, StoreError>;

    async fn upsert(
        &self,
        match_id: &str,
        digests: &RecordDigests,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_many(
        &self,
        batch: &[(String, RecordDigests)],
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for (match_id, digests) in batch {
            self.upsert(match_id, digests, seen_at).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    entries: RwLock<HashMap<String, MatchFingerprint>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, match_id: &str) -> Result<Option<MatchFingerprint>, StoreError> {
        Ok(self.entries.read().await.get(match_id).cloned())
    }

    async fn upsert(
        &self,
        match_id: &str,
        digests: &RecordDigests,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(match_id.to_string(), digests.to_fingerprint(match_id, seen_at));
        Ok(())
    }
}

/// One JSON document per match, written through a temp file and an atomic rename.
#[derive(Debug)]
pub struct FileFingerprintStore {
    root: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileFingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, match_id: &str) -> PathBuf {
        let hash = sha256_hex(match_id.as_bytes());
        self.root.join(&hash[..2]).join(format!("{hash}.json"))
    }

    async fn key_lock(&self, match_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(match_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the key's lock once no writer holds or waits on it.
    async fn release_key_lock(&self, match_id: &str) {
        let mut locks = self.key_locks.lock().await;
        if locks
            .get(match_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(match_id);
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for FileFingerprintStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, match_id: &str) -> Result<Option<MatchFingerprint>, StoreError> {
        let path = self.record_path(match_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn upsert(
        &self,
        match_id: &str,
        digests: &RecordDigests,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let lock = self.key_lock(match_id).await;
        let written = async {
            let _guard = lock.lock().await;
            let path = self.record_path(match_id);
            let bytes = serde_json::to_vec_pretty(&digests.to_fingerprint(match_id, seen_at))?;
            self.write_atomic(&path, &bytes).await?;
            debug!(match_id, path = %path.display(), "fingerprint written");
            Ok::<(), StoreError>(())
        }
        .await;
        drop(lock);
        self.release_key_lock(match_id).await;
        written
    }
}

const SELECT_FINGERPRINT_SQL: &str = "SELECT match_id, current_odds_digest, history_digest, entry_digests, last_seen_at \
     FROM match_fingerprints WHERE match_id = $1";

const UPSERT_FINGERPRINT_SQL: &str = "INSERT INTO match_fingerprints \
     (match_id, current_odds_digest, history_digest, entry_digests, last_seen_at) \
     VALUES ($1, $2, $3, $4, $5) \
     ON CONFLICT (match_id) DO UPDATE SET \
     current_odds_digest = EXCLUDED.current_odds_digest, \
     history_digest = EXCLUDED.history_digest, \
     entry_digests = EXCLUDED.entry_digests, \
     last_seen_at = EXCLUDED.last_seen_at";

/// Postgres-backed store; the row upsert gives per-key atomicity.
#[derive(Debug, Clone)]
pub struct PgFingerprintStore {
    pool: PgPool,
}

impl PgFingerprintStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to fingerprint database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running fingerprint migrations")?;
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for PgFingerprintStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, match_id: &str) -> Result<Option<MatchFingerprint>, StoreError> {
        let row = sqlx::query(SELECT_FINGERPRINT_SQL)
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entry_digests: Json<BTreeMap<String, String>> = row.try_get("entry_digests")?;
        Ok(Some(MatchFingerprint {
            match_id: row.try_get("match_id")?,
            current_odds_digest: row.try_get("current_odds_digest")?,
            history_digest: row.try_get("history_digest")?,
            entry_digests: entry_digests.0,
            last_seen_at: row.try_get("last_seen_at")?,
        }))
    }

    async fn upsert(
        &self,
        match_id: &str,
        digests: &RecordDigests,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(UPSERT_FINGERPRINT_SQL)
            .bind(match_id)
            .bind(digests.current_odds_digest.as_str())
            .bind(digests.history_digest.as_deref())
            .bind(Json(digests.entry_digests.clone()))
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_many(
        &self,
        batch: &[(String, RecordDigests)],
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (match_id, digests) in batch {
            sqlx::query(UPSERT_FINGERPRINT_SQL)
                .bind(match_id.as_str())
                .bind(digests.current_odds_digest.as_str())
                .bind(digests.history_digest.as_deref())
                .bind(Json(digests.entry_digests.clone()))
                .bind(seen_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
