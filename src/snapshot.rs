//! SQLite snapshot loading.
//!
//! A snapshot holds one row per captured site plus one row per header, meta
//! tag, script and technology observation. Site URLs are normalized on load;
//! when two captures normalize to the same id the latest capture wins.
//!
//! Observation rows point at their capture through `capture_id` (the `sites`
//! rowid). Rows without one fall back to matching on `site_url`, so in older
//! snapshots two captures of the exact same URL share their observations.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::dataset::{ClassificationMetadata, Dataset, DatasetSource, Site};
use crate::domain::normalize_site_url;
use crate::error::{AnalysisError, Result};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sites (
    url TEXT NOT NULL,
    cms TEXT,
    cms_confidence REAL,
    captured_at TEXT
);
CREATE TABLE IF NOT EXISTS headers (
    site_url TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    capture_id INTEGER
);
CREATE TABLE IF NOT EXISTS meta_tags (
    site_url TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    capture_id INTEGER
);
CREATE TABLE IF NOT EXISTS scripts (site_url TEXT NOT NULL, src TEXT NOT NULL, capture_id INTEGER);
CREATE TABLE IF NOT EXISTS technologies (site_url TEXT NOT NULL, name TEXT NOT NULL, capture_id INTEGER);
CREATE TABLE IF NOT EXISTS header_classifications (
    header TEXT NOT NULL,
    category TEXT,
    discriminative_score REAL,
    vendor TEXT
);
";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadOptions {
    pub path: PathBuf,
    pub include_classification: bool,
    /// Keep only the first `n` sites in dataset order.
    pub max_sites: Option<usize>,
}

impl LoadOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LoadOptions {
            path: path.into(),
            include_classification: true,
            max_sites: None,
        }
    }

    /// Cache key: canonical path, file size and modification time, plus the
    /// options that change what gets loaded.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = fs::canonicalize(&self.path)
            .map_err(|_| AnalysisError::SnapshotNotFound(self.path.clone()))?;
        let metadata = fs::metadata(&canonical)
            .map_err(|_| AnalysisError::SnapshotNotFound(self.path.clone()))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(format!(
            "{}|{}|{}|classification={}|max_sites={}",
            canonical.display(),
            metadata.len(),
            modified,
            self.include_classification,
            self.max_sites.map_or_else(|| "all".to_string(), |n| n.to_string())
        ))
    }
}

/// Parsed datasets keyed by [`LoadOptions::fingerprint`]. Owned by whoever
/// creates it and shared only by handing out the `Arc`.
#[derive(Debug, Default)]
pub struct DatasetCache {
    entries: Mutex<HashMap<String, Arc<Dataset>>>,
}

impl DatasetCache {
    pub fn new() -> Self {
        DatasetCache::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<Dataset>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    pub fn insert(&self, fingerprint: String, dataset: Arc<Dataset>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint, dataset);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = entries.len();
        entries.clear();
        debug!(action = "clear", component = "dataset_cache", dropped, "Dataset cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    options: LoadOptions,
    cache: Arc<DatasetCache>,
}

impl SnapshotLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotLoader::with_options(LoadOptions::new(path))
    }

    pub fn with_options(options: LoadOptions) -> Self {
        SnapshotLoader {
            options,
            cache: Arc::new(DatasetCache::new()),
        }
    }

    /// Share a cache between loaders.
    pub fn with_cache(mut self, cache: Arc<DatasetCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<DatasetCache> {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Read the snapshot from disk, bypassing the cache.
    pub fn load_uncached(&self) -> Result<Dataset> {
        let start_time = Instant::now();
        let path = &self.options.path;
        if !path.exists() {
            return Err(AnalysisError::SnapshotNotFound(path.clone()));
        }
        info!(action = "start", component = "snapshot_loader", path = ?path, "Loading snapshot");

        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut dataset = read_dataset(&conn, self.options.max_sites)?;
        if self.options.include_classification && table_exists(&conn, "header_classifications")? {
            let classification = read_classification(&conn)?;
            if !classification.is_empty() {
                dataset.classification = Some(classification);
            }
        }

        info!(
            action = "complete",
            component = "snapshot_loader",
            site_count = dataset.total_sites(),
            has_classification = dataset.classification.is_some(),
            duration_ms = start_time.elapsed().as_millis(),
            "Snapshot loaded"
        );
        Ok(dataset)
    }
}

impl DatasetSource for SnapshotLoader {
    fn load(&self) -> Result<Arc<Dataset>> {
        let fingerprint = self.options.fingerprint()?;
        if let Some(dataset) = self.cache.get(&fingerprint) {
            debug!(action = "cache_hit", component = "snapshot_loader", site_count = dataset.total_sites(), "Using cached dataset");
            return Ok(dataset);
        }
        let dataset = Arc::new(self.load_uncached()?);
        self.cache.insert(fingerprint, Arc::clone(&dataset));
        Ok(dataset)
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
            [table, column],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn parse_captured_at(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(e) => {
            warn!(action = "parse", component = "snapshot_loader", value = %raw, error = %e, "Ignoring unparseable capture time");
            None
        }
    }
}

struct Capture {
    rowid: i64,
    raw_url: String,
    site: Site,
}

fn read_dataset(conn: &Connection, max_sites: Option<usize>) -> Result<Dataset> {
    let mut stmt =
        conn.prepare("SELECT rowid, url, cms, cms_confidence, captured_at FROM sites ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<f64>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut captures: BTreeMap<String, Capture> = BTreeMap::new();
    let mut skipped = 0usize;
    let mut replaced = 0usize;
    for row in rows {
        let (rowid, raw_url, cms, cms_confidence, captured_at) = row?;
        let Some(id) = normalize_site_url(&raw_url) else {
            skipped += 1;
            continue;
        };
        let site = Site {
            url: id.clone(),
            cms,
            cms_confidence,
            captured_at: parse_captured_at(captured_at),
            ..Site::default()
        };
        let newer = captures
            .get(&id)
            .map_or(true, |existing| site.captured_at >= existing.site.captured_at);
        if captures.contains_key(&id) {
            replaced += usize::from(newer);
        }
        if newer {
            captures.insert(id, Capture { rowid, raw_url, site });
        }
    }
    if skipped > 0 {
        warn!(action = "normalize", component = "snapshot_loader", skipped, "Skipped sites without a usable URL");
    }
    if replaced > 0 {
        info!(action = "deduplicate", component = "snapshot_loader", replaced, "Merged duplicate captures, latest wins");
    }

    if let Some(limit) = max_sites {
        while captures.len() > limit {
            captures.pop_last();
        }
    }

    let owner_by_url: HashMap<String, String> = captures
        .iter()
        .map(|(id, capture)| (capture.raw_url.clone(), id.clone()))
        .collect();
    let owner_by_capture: HashMap<i64, String> = captures
        .iter()
        .map(|(id, capture)| (capture.rowid, id.clone()))
        .collect();
    let mut sites: BTreeMap<String, Site> = captures
        .into_iter()
        .map(|(id, capture)| (id, capture.site))
        .collect();

    let mut attach = |table: &str,
                      columns: &str,
                      apply: &mut dyn FnMut(&mut Site, Vec<String>)|
     -> Result<()> {
        let capture_column = if column_exists(conn, table, "capture_id")? {
            "capture_id"
        } else {
            "NULL"
        };
        let sql = format!(
            "SELECT site_url, {capture_column}, {columns} FROM {table} ORDER BY rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let site_url: String = row.get(0)?;
            let capture_id: Option<i64> = row.get(1)?;
            let owner = match capture_id {
                Some(capture_id) => owner_by_capture.get(&capture_id),
                None => owner_by_url.get(&site_url),
            };
            let Some(site) = owner.and_then(|id| sites.get_mut(id)) else {
                continue;
            };
            let mut values = Vec::with_capacity(column_count - 2);
            for i in 2..column_count {
                values.push(row.get::<_, String>(i)?);
            }
            apply(site, values);
        }
        Ok(())
    };

    attach("headers", "name, value", &mut |site: &mut Site, v: Vec<String>| {
        site.headers.entry(v[0].clone()).or_default().insert(v[1].clone());
    })?;
    attach("meta_tags", "name, content", &mut |site: &mut Site, v: Vec<String>| {
        site.meta_tags.entry(v[0].clone()).or_default().insert(v[1].clone());
    })?;
    attach("scripts", "src", &mut |site: &mut Site, v: Vec<String>| {
        site.scripts.insert(v[0].clone());
    })?;
    attach("technologies", "name", &mut |site: &mut Site, v: Vec<String>| {
        site.technologies.insert(v[0].clone());
    })?;

    Ok(Dataset {
        sites,
        classification: None,
    })
}

fn read_classification(conn: &Connection) -> Result<ClassificationMetadata> {
    let mut stmt = conn.prepare(
        "SELECT header, category, discriminative_score, vendor FROM header_classifications ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut metadata = ClassificationMetadata::default();
    for row in rows {
        let (header, category, score, vendor) = row?;
        let header = header.trim().to_ascii_lowercase();
        if header.is_empty() {
            continue;
        }
        if let Some(category) = category {
            metadata.header_categories.insert(header.clone(), category);
        }
        if let Some(score) = score.filter(|s| s.is_finite()) {
            metadata
                .discriminative_scores
                .insert(header.clone(), score.clamp(0.0, 1.0));
        }
        if let Some(vendor) = vendor {
            metadata.header_vendors.insert(header, vendor);
        }
    }
    Ok(metadata)
}

/// Write `dataset` into a new snapshot at `path`.
pub fn write_snapshot(path: &Path, dataset: &Dataset) -> Result<()> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    let tx = conn.transaction()?;
    for (id, site) in &dataset.sites {
        tx.execute(
            "INSERT INTO sites (url, cms, cms_confidence, captured_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                id,
                site.cms,
                site.cms_confidence,
                site.captured_at.map(|t| t.to_rfc3339())
            ],
        )?;
        let capture_id = tx.last_insert_rowid();
        for (name, values) in &site.headers {
            for value in values {
                tx.execute(
                    "INSERT INTO headers (site_url, name, value, capture_id) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, name, value, capture_id],
                )?;
            }
        }
        for (name, contents) in &site.meta_tags {
            for content in contents {
                tx.execute(
                    "INSERT INTO meta_tags (site_url, name, content, capture_id) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, name, content, capture_id],
                )?;
            }
        }
        for src in &site.scripts {
            tx.execute(
                "INSERT INTO scripts (site_url, src, capture_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, src, capture_id],
            )?;
        }
        for technology in &site.technologies {
            tx.execute(
                "INSERT INTO technologies (site_url, name, capture_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, technology, capture_id],
            )?;
        }
    }
    if let Some(classification) = &dataset.classification {
        let headers: std::collections::BTreeSet<&String> = classification
            .header_categories
            .keys()
            .chain(classification.discriminative_scores.keys())
            .chain(classification.header_vendors.keys())
            .collect();
        for header in headers {
            tx.execute(
                "INSERT INTO header_classifications (header, category, discriminative_score, vendor) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    header,
                    classification.header_categories.get(header),
                    classification.discriminative_scores.get(header),
                    classification.header_vendors.get(header)
                ],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}
