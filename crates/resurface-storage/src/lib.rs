//! Atomic artifact storage + live content store clients for Resurface.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use resurface_core::{ContentRecord, RecordContainer};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Per-run report directory rooted at `root`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub async fn store_run_file(
        &self,
        run_id: Uuid,
        name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        write_atomic(&self.run_dir(run_id).join(name), bytes).await
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename, so
/// readers only ever observe the previous content or the complete new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(err) = write_temp(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp artifact {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredArtifact {
        content_hash: ArtifactStore::sha256_hex(bytes),
        path: path.to_path_buf(),
        byte_size: bytes.len(),
    })
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Created,
    Updated,
}

#[derive(Debug, Error)]
pub enum LiveStoreError {
    #[error("live store unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("http status {status} from {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid live store payload from {url}: {message}")]
    Payload { url: String, message: String },
    #[error("upsert of {id} rejected: {message}")]
    Rejected { id: String, message: String },
}

/// Boundary to the authoritative content store.
#[async_trait]
pub trait LiveStore: Send + Sync {
    fn endpoint(&self) -> String;

    async fn fetch_all(&self) -> Result<Vec<ContentRecord>, LiveStoreError>;

    /// Create the record under `id`, or fully replace the record already stored there.
    async fn upsert(&self, id: &str, record: &ContentRecord) -> Result<UpsertKind, LiveStoreError>;
}

#[derive(Debug, Clone)]
pub struct LiveStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub include_unpublished: bool,
    /// `None` leaves deadlines to the caller.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for LiveStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            token: None,
            include_unpublished: true,
            timeout: None,
            user_agent: Some(format!("resurface/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Content API client: `GET {base}/content` to list, `PUT {base}/content/{id}` to upsert.
/// No retries; a failed call is reported straight back to the caller.
#[derive(Debug)]
pub struct HttpLiveStore {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    include_unpublished: bool,
}

impl HttpLiveStore {
    pub fn new(config: LiveStoreConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing live store url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("live store url {} cannot carry a path", config.base_url);
        }

        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            include_unpublished: config.include_unpublished,
        })
    }

    fn content_url(&self, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("content");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[async_trait]
impl LiveStore for HttpLiveStore {
    fn endpoint(&self) -> String {
        self.content_url(None).to_string()
    }

    async fn fetch_all(&self) -> Result<Vec<ContentRecord>, LiveStoreError> {
        let mut url = self.content_url(None);
        if self.include_unpublished {
            url.query_pairs_mut().append_pair("includeUnpublished", "true");
        }
        let span = info_span!("live_fetch_http", url = %url);

        async {
            let resp = self
                .authorized(self.client.get(url.clone()))
                .send()
                .await
                .map_err(|err| LiveStoreError::Unreachable {
                    endpoint: url.to_string(),
                    message: err.to_string(),
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(LiveStoreError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: snippet(&body),
                });
            }

            let bytes = resp.bytes().await.map_err(|err| LiveStoreError::Unreachable {
                endpoint: url.to_string(),
                message: err.to_string(),
            })?;
            let container: RecordContainer =
                serde_json::from_slice(&bytes).map_err(|err| LiveStoreError::Payload {
                    url: url.to_string(),
                    message: err.to_string(),
                })?;

            let records = container
                .into_entries()
                .into_iter()
                .enumerate()
                .map(|(index, entry)| {
                    serde_json::from_value::<ContentRecord>(entry).map_err(|err| {
                        LiveStoreError::Payload {
                            url: url.to_string(),
                            message: format!("entry {index}: {err}"),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            debug!(count = records.len(), "decoded live records");
            Ok::<_, LiveStoreError>(records)
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, id: &str, record: &ContentRecord) -> Result<UpsertKind, LiveStoreError> {
        let url = self.content_url(Some(id));
        let mut body = record.clone();
        body.id = Some(id.to_string());

        let resp = self
            .authorized(self.client.put(url.clone()))
            .json(&body)
            .send()
            .await
            .map_err(|err| LiveStoreError::Rejected {
                id: id.to_string(),
                message: format!("request to {url} failed: {err}"),
            })?;

        match resp.status() {
            StatusCode::CREATED => Ok(UpsertKind::Created),
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(UpsertKind::Updated),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(LiveStoreError::Rejected {
                    id: id.to_string(),
                    message: format!("http status {} ({})", status.as_u16(), snippet(&text)),
                })
            }
        }
    }
}

/// In-process live store keyed by stable id. Records are kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryLiveStore {
    records: Mutex<Vec<ContentRecord>>,
    rejected_ids: BTreeSet<String>,
    unreachable: bool,
    upsert_calls: AtomicUsize,
}

impl MemoryLiveStore {
    pub fn new(records: Vec<ContentRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    /// Reject every upsert targeting one of `ids`.
    pub fn rejecting<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Fail every call as if the store could not be reached.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub async fn records(&self) -> Vec<ContentRecord> {
        self.records.lock().await.clone()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    fn offline(&self) -> LiveStoreError {
        LiveStoreError::Unreachable {
            endpoint: self.endpoint(),
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl LiveStore for MemoryLiveStore {
    fn endpoint(&self) -> String {
        "memory://live".to_string()
    }

    async fn fetch_all(&self) -> Result<Vec<ContentRecord>, LiveStoreError> {
        if self.unreachable {
            return Err(self.offline());
        }
        Ok(self.records().await)
    }

    async fn upsert(&self, id: &str, record: &ContentRecord) -> Result<UpsertKind, LiveStoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(self.offline());
        }
        if self.rejected_ids.contains(id) {
            return Err(LiveStoreError::Rejected {
                id: id.to_string(),
                message: "write refused by store".to_string(),
            });
        }

        let mut replacement = record.clone();
        replacement.id = Some(id.to_string());

        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.stable_id() == Some(id)) {
            Some(existing) => {
                *existing = replacement;
                Ok(UpsertKind::Updated)
            }
            None => {
                records.push(replacement);
                Ok(UpsertKind::Created)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::{Path as AxumPath, Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::{json, Value as JsonValue};
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_overwrite_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("staging").join("missing.json");

        let first = write_atomic(&path, b"[1]").await.expect("first write");
        let second = write_atomic(&path, b"[1,2]").await.expect("second write");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(second.byte_size, 5);
        assert_eq!(std::fs::read(&path).expect("read back"), b"[1,2]");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("staging"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn run_files_land_under_run_directory() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let stored = store
            .store_run_file(run_id, "restore_report.json", b"{}")
            .await
            .expect("store");
        assert_eq!(stored.path, dir.path().join(run_id.to_string()).join("restore_report.json"));
        assert!(stored.path.exists());
    }

    #[tokio::test]
    async fn memory_store_replaces_whole_record_on_update() {
        let mut original = ContentRecord::new("Ocean Heat").with_id("o1");
        original.excerpt = Some("old excerpt".into());
        original.category = Some("climate".into());
        let store = MemoryLiveStore::new(vec![original]);

        let replacement = ContentRecord::new("Ocean Heat Revisited");
        let kind = store.upsert("o1", &replacement).await.expect("upsert");
        assert_eq!(kind, UpsertKind::Updated);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Ocean Heat Revisited");
        assert_eq!(records[0].excerpt, None);
        assert_eq!(records[0].category, None);
        assert_eq!(records[0].id.as_deref(), Some("o1"));
    }

    #[tokio::test]
    async fn memory_store_rejects_configured_ids() {
        let store = MemoryLiveStore::default().rejecting(["bad"]);
        let err = store
            .upsert("bad", &ContentRecord::new("x"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, LiveStoreError::Rejected { .. }));
        assert_eq!(
            store.upsert("good", &ContentRecord::new("y")).await.expect("ok"),
            UpsertKind::Created
        );
        assert_eq!(store.upsert_calls(), 2);
    }

    #[derive(Clone, Default)]
    struct MockApi {
        records: Arc<Mutex<Vec<JsonValue>>>,
        seen_auth: Arc<Mutex<Vec<String>>>,
        seen_query: Arc<Mutex<Vec<HashMap<String, String>>>>,
    }

    async fn list_handler(
        State(api): State<MockApi>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Json<JsonValue> {
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            api.seen_auth.lock().await.push(auth.to_string());
        }
        api.seen_query.lock().await.push(query);
        let records = api.records.lock().await.clone();
        Json(json!({ "total": records.len(), "records": records }))
    }

    async fn put_handler(
        State(api): State<MockApi>,
        AxumPath(id): AxumPath<String>,
        Json(body): Json<JsonValue>,
    ) -> AxumStatus {
        if id == "locked" {
            return AxumStatus::CONFLICT;
        }
        let mut records = api.records.lock().await;
        match records.iter_mut().find(|r| r["id"] == json!(id)) {
            Some(existing) => {
                *existing = body;
                AxumStatus::OK
            }
            None => {
                records.push(body);
                AxumStatus::CREATED
            }
        }
    }

    async fn spawn_mock(api: MockApi) -> SocketAddr {
        let app = Router::new()
            .route("/api/content", get(list_handler))
            .route("/api/content/{id}", put(put_handler))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    fn http_store(addr: SocketAddr, token: Option<&str>) -> HttpLiveStore {
        HttpLiveStore::new(LiveStoreConfig {
            base_url: format!("http://{addr}/api/"),
            token: token.map(str::to_string),
            include_unpublished: true,
            timeout: Some(Duration::from_secs(5)),
            user_agent: None,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn http_store_fetches_wrapped_listing_with_auth_and_flag() {
        let api = MockApi::default();
        api.records.lock().await.push(json!({
            "id": "o1",
            "title": "Ocean Heat",
            "category": "climate",
            "status": "published",
            "views": 120,
        }));
        let addr = spawn_mock(api.clone()).await;

        let store = http_store(addr, Some("secret"));
        let records = store.fetch_all().await.expect("fetch");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stable_id(), Some("o1"));
        assert_eq!(api.seen_auth.lock().await.as_slice(), ["Bearer secret"]);
        assert_eq!(
            api.seen_query.lock().await[0].get("includeUnpublished").map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn http_store_maps_put_statuses_to_upsert_kinds() {
        let api = MockApi::default();
        let addr = spawn_mock(api.clone()).await;
        let store = http_store(addr, None);
        let record = ContentRecord::new("Methane Surge");

        assert_eq!(store.upsert("m1", &record).await.expect("create"), UpsertKind::Created);
        assert_eq!(store.upsert("m1", &record).await.expect("update"), UpsertKind::Updated);
        assert_eq!(api.records.lock().await.len(), 1);
        assert_eq!(api.records.lock().await[0]["id"], json!("m1"));

        let err = store.upsert("locked", &record).await.expect_err("conflict");
        assert!(err.to_string().contains("409"));
    }

    #[tokio::test]
    async fn http_store_reports_unreachable_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = http_store(addr, None).fetch_all().await.expect_err("refused");
        assert!(matches!(err, LiveStoreError::Unreachable { .. }));
    }

    #[test]
    fn rejects_urls_without_paths() {
        let config = LiveStoreConfig {
            base_url: "mailto:ops@example.com".to_string(),
            ..Default::default()
        };
        assert!(HttpLiveStore::new(config).is_err());
    }
}
