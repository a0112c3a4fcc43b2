//! Record sources: snapshot archive loading, staged artifact reading and live fetching.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use resurface_core::{entry_title, ContentRecord, RecordContainer, RecoveryError};
use resurface_storage::{LiveStore, LiveStoreError};
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

/// A side of the reconciliation: something that yields canonical records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_name(&self) -> String;

    async fn load_records(&self) -> Result<Vec<ContentRecord>, RecoveryError>;
}

/// Read an archival export. Entries without a usable title are dropped; any other entry
/// that fails to decode fails the whole load. The file is only ever read.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Vec<ContentRecord>, RecoveryError> {
    let path = path.as_ref();
    let span = info_span!("snapshot_load", path = %path.display());
    let _guard = span.enter();

    let entries = parse_container(path, &read_source(path)?)?;
    let total = entries.len();
    let mut records = Vec::with_capacity(total);
    for (index, entry) in entries.into_iter().enumerate() {
        if entry_title(&entry).is_none() {
            debug!(index, "dropping snapshot entry without a title");
            continue;
        }
        records.push(decode_entry(path, index, entry)?);
    }

    info!(
        loaded = records.len(),
        dropped = total - records.len(),
        "loaded snapshot archive"
    );
    Ok(records)
}

/// Read a staged extraction artifact. Every entry is kept, titled or not: restore keys on
/// ids, and a reviewer's edits must not be silently discarded.
pub fn load_staged(path: impl AsRef<Path>) -> Result<Vec<ContentRecord>, RecoveryError> {
    let path = path.as_ref();
    decode_staged(path, &read_source(path)?)
}

/// Decode staged artifact bytes already read from `path`.
pub fn decode_staged(path: &Path, data: &[u8]) -> Result<Vec<ContentRecord>, RecoveryError> {
    let records = parse_container(path, data)?
        .into_iter()
        .enumerate()
        .map(|(index, entry)| decode_entry(path, index, entry))
        .collect::<Result<Vec<_>, _>>()?;
    info!(path = %path.display(), records = records.len(), "loaded staged artifact");
    Ok(records)
}

/// Read a source file, mapping a missing file to [`RecoveryError::NotFound`].
pub fn read_source(path: &Path) -> Result<Vec<u8>, RecoveryError> {
    fs::read(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => RecoveryError::NotFound {
            path: path.to_path_buf(),
        },
        _ => RecoveryError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    })
}

fn parse_container(path: &Path, data: &[u8]) -> Result<Vec<JsonValue>, RecoveryError> {
    let container: RecordContainer =
        serde_json::from_slice(data).map_err(|err| RecoveryError::Parse {
            source_name: path.display().to_string(),
            message: err.to_string(),
        })?;
    Ok(container.into_entries())
}

fn decode_entry(path: &Path, index: usize, entry: JsonValue) -> Result<ContentRecord, RecoveryError> {
    serde_json::from_value(entry).map_err(|err| RecoveryError::Parse {
        source_name: path.display().to_string(),
        message: format!("entry {index}: {err}"),
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotSource {
    path: PathBuf,
}

impl SnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for SnapshotSource {
    fn source_name(&self) -> String {
        format!("snapshot:{}", self.path.display())
    }

    async fn load_records(&self) -> Result<Vec<ContentRecord>, RecoveryError> {
        load_snapshot(&self.path)
    }
}

/// Reads the current records from the live store. Fails fast; retrying is up to the caller.
#[derive(Clone)]
pub struct LiveFetcher {
    store: Arc<dyn LiveStore>,
}

impl LiveFetcher {
    pub fn new(store: Arc<dyn LiveStore>) -> Self {
        Self { store }
    }

    pub async fn fetch(&self) -> Result<Vec<ContentRecord>, RecoveryError> {
        let endpoint = self.store.endpoint();
        let span = info_span!("live_fetch", endpoint = %endpoint);
        async {
            let records = self
                .store
                .fetch_all()
                .await
                .map_err(|err| live_error(&endpoint, err))?;
            info!(records = records.len(), "fetched live records");
            Ok::<_, RecoveryError>(records)
        }
        .instrument(span)
        .await
    }
}

fn live_error(endpoint: &str, err: LiveStoreError) -> RecoveryError {
    match err {
        LiveStoreError::Payload { url, message } => RecoveryError::Parse {
            source_name: url,
            message,
        },
        other => RecoveryError::Connection {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl RecordSource for LiveFetcher {
    fn source_name(&self) -> String {
        format!("live:{}", self.store.endpoint())
    }

    async fn load_records(&self) -> Result<Vec<ContentRecord>, RecoveryError> {
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use resurface_storage::{HttpLiveStore, LiveStoreConfig, MemoryLiveStore};
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = load_snapshot(dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(err, RecoveryError::NotFound { .. }));
    }

    #[test]
    fn malformed_snapshot_is_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "broken.json", "{\"records\": [");
        assert!(matches!(
            load_snapshot(&path).expect_err("malformed"),
            RecoveryError::Parse { .. }
        ));

        let path = write(
            dir.path(),
            "bad-entry.json",
            r#"[{"title": "ok"}, {"title": "bad status", "status": "archived"}]"#,
        );
        let err = load_snapshot(&path).expect_err("bad entry");
        assert!(err.to_string().contains("entry 1"));
    }

    #[test]
    fn untitled_entries_are_dropped_and_source_is_untouched() {
        let dir = tempdir().expect("tempdir");
        let body = r#"{"records": [{"title": "Keep"}, {"id": "x"}, {"title": ""}, {"title": null}]}"#;
        let path = write(dir.path(), "snap.json", body);

        let records = load_snapshot(&path).expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Keep");
        assert_eq!(fs::read_to_string(&path).expect("reread"), body);
    }

    #[test]
    fn staged_artifact_keeps_untitled_entries() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "staged.json", r#"[{"id": "a"}, {"id": "b", "title": "B"}]"#);
        let records = load_staged(&path).expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stable_id(), Some("a"));
    }

    #[test]
    fn entries_with_both_document_id_and_id_load() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "snap.json",
            r#"{"records": [{"_id": "a1", "id": "a1", "title": "Ocean Heat"}, {"_id": "b1", "title": "Methane Surge"}]}"#,
        );
        let records = load_snapshot(&path).expect("load");
        let ids: Vec<_> = records.iter().map(|r| r.stable_id()).collect();
        assert_eq!(ids, [Some("a1"), Some("b1")]);
    }

    #[test]
    fn staged_artifact_tolerates_null_titles() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "staged.json", r#"[{"id": "a", "title": null}]"#);
        let records = load_staged(&path).expect("load");
        assert_eq!(records[0].stable_id(), Some("a"));
        assert!(!records[0].has_title());
    }

    #[tokio::test]
    async fn live_records_without_title_keep_their_id() {
        let store = MemoryLiveStore::new(vec![
            serde_json::from_str(r#"{"id": "u1", "title": null}"#).expect("decode"),
            ContentRecord::new("Ocean Heat").with_id("o1"),
        ]);
        let records = LiveFetcher::new(Arc::new(store)).fetch().await.expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stable_id(), Some("u1"));
        assert!(records[0].identity_key().is_empty());
    }

    async fn spawn_listing(status: StatusCode, body: &'static str) -> SocketAddr {
        let app = Router::new().route("/api/content", get(move || async move { (status, body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    fn http_fetcher(addr: SocketAddr) -> LiveFetcher {
        let store = HttpLiveStore::new(LiveStoreConfig {
            base_url: format!("http://{addr}/api"),
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        })
        .expect("client");
        LiveFetcher::new(Arc::new(store))
    }

    #[tokio::test]
    async fn live_server_error_is_connection_error() {
        let addr = spawn_listing(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let err = http_fetcher(addr).fetch().await.expect_err("500");
        match err {
            RecoveryError::Connection { message, .. } => assert!(message.contains("500")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn live_listing_with_null_title_is_fetched() {
        let addr = spawn_listing(
            StatusCode::OK,
            r#"{"records": [{"id": "u1", "title": null}, {"id": "o1", "title": "Ocean Heat"}]}"#,
        )
        .await;
        let records = http_fetcher(addr).fetch().await.expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stable_id(), Some("u1"));
        assert!(!records[0].has_title());
    }

    #[tokio::test]
    async fn live_fetcher_maps_unreachable_store_to_connection_error() {
        let fetcher = LiveFetcher::new(Arc::new(MemoryLiveStore::default().unreachable()));
        let err = fetcher.fetch().await.expect_err("offline");
        assert!(matches!(err, RecoveryError::Connection { .. }));
    }

    #[tokio::test]
    async fn sources_share_one_interface() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "snap.json", r#"[{"title": "A"}]"#);
        let live = MemoryLiveStore::new(vec![ContentRecord::new("B").with_id("b")]);

        let sources: Vec<Box<dyn RecordSource>> = vec![
            Box::new(SnapshotSource::new(&path)),
            Box::new(LiveFetcher::new(Arc::new(live))),
        ];
        let mut titles = Vec::new();
        for source in &sources {
            for record in source.load_records().await.expect("load") {
                titles.push(record.title);
            }
        }
        assert_eq!(titles, ["A", "B"]);
        assert!(sources[1].source_name().starts_with("live:memory://"));
    }
}
