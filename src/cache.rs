use anyhow::{Context, Result};
use rusqlite::{Connection as SqliteConnection, OptionalExtension, params};
use std::{
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::warn;

use crate::{
    common::{ensure_parent_dir, truncate_for_log},
    error::LookupError,
    model::ApiCode,
    source::CodeSource,
};

const LOOKUP_DETAILS: &str = "details";
const LOOKUP_CHILDREN: &str = "children";

/// Resumable store of lookup outcomes, keyed by code system, code and lookup kind.
///
/// Only successes and definitive client errors (`not_found`) are stored;
/// transient failures are looked up again on the next run.
pub struct LookupCache {
    conn: SqliteConnection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedOutcome {
    Ok(String),
    NotFound { http_status: u16, message: String },
}

impl LookupCache {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = SqliteConnection::open(path)
            .with_context(|| format!("Failed opening cache DB {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory().context("Failed opening in-memory cache")?;
        Self::init(conn)
    }

    fn init(conn: SqliteConnection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS lookup_cache (
                code_system TEXT NOT NULL,
                code TEXT NOT NULL,
                lookup TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '',
                http_status INTEGER,
                error_message TEXT NOT NULL DEFAULT '',
                fetched_at_unix INTEGER NOT NULL,
                PRIMARY KEY (code_system, code, lookup)
            );
            ",
        )
        .context("Failed initializing lookup cache schema")?;
        Ok(Self { conn })
    }

    pub fn get(
        &self,
        code_system: &str,
        code: &str,
        lookup: &str,
    ) -> Result<Option<CachedOutcome>> {
        let row: Option<(String, String, Option<i64>, String)> = self
            .conn
            .query_row(
                "SELECT status, payload, http_status, error_message FROM lookup_cache
                 WHERE code_system = ?1 AND code = ?2 AND lookup = ?3",
                params![code_system, code, lookup],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .with_context(|| format!("Failed cache lookup for {code_system}/{code}/{lookup}"))?;

        Ok(row.and_then(|(status, payload, http_status, message)| {
            match status.as_str() {
                "ok" => Some(CachedOutcome::Ok(payload)),
                "not_found" => Some(CachedOutcome::NotFound {
                    http_status: http_status.unwrap_or(404) as u16,
                    message,
                }),
                _ => None,
            }
        }))
    }

    pub fn put_ok(&self, code_system: &str, code: &str, lookup: &str, payload: &str) -> Result<()> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO lookup_cache (
                    code_system, code, lookup, status, payload, http_status, error_message,
                    fetched_at_unix
                )
                VALUES (?1, ?2, ?3, 'ok', ?4, NULL, '', strftime('%s', 'now'))
                ",
                params![code_system, code, lookup, payload],
            )
            .with_context(|| format!("Failed caching {code_system}/{code}/{lookup}"))?;
        Ok(())
    }

    pub fn put_not_found(
        &self,
        code_system: &str,
        code: &str,
        lookup: &str,
        http_status: u16,
        message: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "
                INSERT OR REPLACE INTO lookup_cache (
                    code_system, code, lookup, status, payload, http_status, error_message,
                    fetched_at_unix
                )
                VALUES (?1, ?2, ?3, 'not_found', '', ?4, ?5, strftime('%s', 'now'))
                ",
                params![
                    code_system,
                    code,
                    lookup,
                    http_status as i64,
                    truncate_for_log(message)
                ],
            )
            .with_context(|| format!("Failed caching not_found for {code_system}/{code}"))?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM lookup_cache", [], |row| row.get(0))
            .context("Failed counting lookup cache rows")?;
        Ok(n as usize)
    }
}

/// A [`CodeSource`] that answers from the lookup cache first and records
/// what the wrapped source returns.
pub struct CachedSource<S> {
    inner: S,
    cache: Mutex<LookupCache>,
    code_system: String,
    offline: bool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<S: CodeSource> CachedSource<S> {
    /// With `offline` set, cache misses fail instead of reaching `inner`.
    pub fn new(inner: S, cache: LookupCache, code_system: &str, offline: bool) -> Self {
        Self {
            inner,
            cache: Mutex::new(cache),
            code_system: code_system.to_string(),
            offline,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    fn cached<T: serde::de::DeserializeOwned>(
        &self,
        code: &str,
        lookup: &str,
    ) -> Option<Result<T, LookupError>> {
        let outcome = match self.cache.lock() {
            Ok(cache) => cache.get(&self.code_system, code, lookup),
            Err(_) => return None,
        };
        let outcome = match outcome {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return None,
            Err(err) => {
                warn!(code, lookup, error = %err, "lookup cache read failed");
                return None;
            }
        };

        match outcome {
            CachedOutcome::Ok(payload) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(Ok(value))
                }
                Err(err) => {
                    warn!(code, lookup, error = %err, "ignoring undecodable cache entry");
                    None
                }
            },
            CachedOutcome::NotFound {
                http_status,
                message,
            } => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Err(LookupError::Status {
                    url: format!("cache://{}/{code}/{lookup}", self.code_system),
                    status: http_status,
                    retry_after: None,
                    body: message,
                }))
            }
        }
    }

    fn store<T: serde::Serialize>(
        &self,
        code: &str,
        lookup: &str,
        result: &Result<T, LookupError>,
    ) {
        let Ok(cache) = self.cache.lock() else {
            return;
        };
        let written = match result {
            Ok(value) => match serde_json::to_string(value) {
                Ok(payload) => cache.put_ok(&self.code_system, code, lookup, &payload),
                Err(err) => Err(err.into()),
            },
            Err(LookupError::Status { status, body, .. })
                if matches!(*status, 404 | 410) =>
            {
                cache.put_not_found(&self.code_system, code, lookup, *status, body)
            }
            Err(_) => Ok(()),
        };
        if let Err(err) = written {
            warn!(code, lookup, error = %err, "lookup cache write failed");
        }
    }

    async fn lookup<T, F, Fut>(&self, code: &str, lookup: &str, fetch: F) -> Result<T, LookupError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, LookupError>>,
    {
        if let Some(hit) = self.cached(code, lookup) {
            return hit;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.offline {
            return Err(LookupError::NotCached {
                code: code.to_string(),
            });
        }
        let result = fetch().await;
        self.store(code, lookup, &result);
        result
    }
}

impl<S: CodeSource> CodeSource for CachedSource<S> {
    async fn details(&self, code: &str) -> Result<ApiCode, LookupError> {
        self.lookup(code, LOOKUP_DETAILS, || self.inner.details(code))
            .await
    }

    async fn children(&self, code: &str) -> Result<Vec<ApiCode>, LookupError> {
        self.lookup(code, LOOKUP_CHILDREN, || self.inner.children(code))
            .await
    }
}
