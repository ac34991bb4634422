//! Video library control plane
//!
//! Watches the library root for source files, hands new ones to the
//! encoder (at most once per source at a time), and serves finished HLS
//! artifacts from `<root>/processed/` — and nothing outside it.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::task::AbortHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::VideoConfig;
use crate::metrics::Counters;
use crate::models::{is_valid_stream_name, StreamEntry, StreamId};
use crate::service::encoder::Encoder;
use crate::{Error, Result};

/// Source extensions picked up by the scanner.
const SOURCE_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "wmv"];

static PATH_COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_.-]+$").expect("path component regex"));

/// HLS content types; anything else is served opaque.
fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(OsStr::to_str) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// Replace every byte outside `[A-Za-z0-9_-]` so a source filename becomes
/// a safe stream directory name.
fn sanitize_output_name(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct VideoCatalog {
    /// Self-handle for the encode tasks and the scan loop.
    me: Weak<VideoCatalog>,
    root: PathBuf,
    processed: PathBuf,
    encoder: Arc<dyn Encoder>,
    counters: Arc<Counters>,
    in_flight: Mutex<HashSet<String>>,
    cache: RwLock<Option<Vec<StreamEntry>>>,
    scan_loop: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for VideoCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoCatalog")
            .field("root", &self.root)
            .finish()
    }
}

impl VideoCatalog {
    #[must_use]
    pub fn new(
        config: &VideoConfig,
        encoder: Arc<dyn Encoder>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let root = PathBuf::from(&config.root);
        let processed = root.join("processed");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            root,
            processed,
            encoder,
            counters,
            in_flight: Mutex::new(HashSet::new()),
            cache: RwLock::new(None),
            scan_loop: Mutex::new(None),
        })
    }

    /// Ready streams, name-ordered. Served from cache until an encode
    /// invalidates it.
    pub async fn list(&self) -> Result<Vec<StreamEntry>> {
        if let Some(cached) = self.cache.read().clone() {
            return Ok(cached);
        }
        let entries = self.scan_processed().await?;
        *self.cache.write() = Some(entries.clone());
        Ok(entries)
    }

    async fn scan_processed(&self) -> Result<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.processed).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = item.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !is_valid_stream_name(&name) {
                continue;
            }
            let master = item.path().join("master.m3u8");
            match tokio::fs::metadata(&master).await {
                Ok(meta) if meta.is_file() => entries.push(StreamEntry {
                    stream_id: StreamId::from_name(&name)?,
                    master_playlist: master,
                }),
                _ => {}
            }
        }
        entries.sort_by(|a, b| a.stream_id.as_str().cmp(b.stream_id.as_str()));
        Ok(entries)
    }

    /// Open one HLS artifact for streaming. The subpath is validated
    /// component-by-component, then the resolved path is checked against
    /// the processed root to close the symlink hole.
    pub async fn open(
        &self,
        stream_name: &str,
        subpath: &str,
    ) -> Result<(tokio::fs::File, &'static str)> {
        if !is_valid_stream_name(stream_name) {
            return Err(Error::InvalidInput(format!(
                "invalid stream name: {stream_name}"
            )));
        }
        let mut path = self.processed.join(stream_name);
        for component in subpath.split('/') {
            if !PATH_COMPONENT_RE.is_match(component) || component.contains("..") {
                return Err(Error::InvalidInput(format!(
                    "invalid path component: {component}"
                )));
            }
            path.push(component);
        }

        let processed_root = tokio::fs::canonicalize(&self.processed)
            .await
            .map_err(|_| Error::NotFound("no processed streams".to_string()))?;
        let resolved = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| Error::NotFound(format!("{stream_name}/{subpath}")))?;
        if !resolved.starts_with(&processed_root) {
            return Err(Error::PermissionDenied(
                "path resolves outside the video root".to_string(),
            ));
        }

        let file = tokio::fs::File::open(&resolved).await?;
        Ok((file, content_type_for(&resolved)))
    }

    /// One library pass: start an encode for every source file that has
    /// neither finished output nor an encode already in flight.
    pub async fn scan_and_encode(&self) -> Result<()> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(root = %self.root.display(), "video root does not exist");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            let source = item.path();
            let Some(ext) = source.extension().and_then(OsStr::to_str) else {
                continue;
            };
            if !SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                continue;
            }
            let Some(stem) = source.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            let output_name = sanitize_output_name(stem);
            if output_name.is_empty() {
                continue;
            }

            let master = self.processed.join(&output_name).join("master.m3u8");
            if tokio::fs::metadata(&master).await.is_ok() {
                continue;
            }
            // The in-flight mark is the dedup primitive: a second scan
            // while this encode runs skips the source here.
            if !self.in_flight.lock().insert(output_name.clone()) {
                debug!(stream = %output_name, "encode already in flight");
                continue;
            }
            self.spawn_encode(source, output_name);
        }
        Ok(())
    }

    fn spawn_encode(&self, source: PathBuf, output_name: String) {
        let me = self.me.clone();
        Counters::incr(&self.counters.encodes_started);
        info!(source = %source.display(), stream = %output_name, "encode started");
        tokio::spawn(async move {
            let Some(catalog) = me.upgrade() else { return };
            let output_dir = catalog.processed.join(&output_name);
            let result = catalog.encoder.encode(&source, &output_dir).await;
            catalog.in_flight.lock().remove(&output_name);
            match result {
                Ok(()) => {
                    Counters::incr(&catalog.counters.encodes_completed);
                    *catalog.cache.write() = None;
                    info!(stream = %output_name, "encode finished");
                }
                Err(e) => {
                    Counters::incr(&catalog.counters.encodes_failed);
                    warn!(stream = %output_name, error = %e, "encode failed");
                }
            }
        });
    }

    /// Start the periodic scan loop; the first pass runs immediately.
    pub fn start_scan(&self, period: Duration) {
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(catalog) = me.upgrade() else { break };
                if let Err(e) = catalog.scan_and_encode().await {
                    warn!(error = %e, "library scan failed");
                }
            }
        })
        .abort_handle();
        if let Some(previous) = self.scan_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_scan(&self) {
        if let Some(handle) = self.scan_loop.lock().take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Encoder double: counts invocations and blocks until released, then
    /// writes a master playlist like the real thing.
    struct GatedEncoder {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedEncoder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                fail,
            }
        }
    }

    #[async_trait::async_trait]
    impl Encoder for GatedEncoder {
        async fn encode(&self, _source: &Path, output_dir: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Encoder("gate closed".to_string()))?;
            if self.fail {
                return Err(Error::Encoder("simulated failure".to_string()));
            }
            tokio::fs::create_dir_all(output_dir).await?;
            tokio::fs::write(output_dir.join("master.m3u8"), "#EXTM3U\n").await?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: Arc<VideoCatalog>,
        encoder: Arc<GatedEncoder>,
    }

    fn fixture(fail: bool) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = VideoConfig {
            root: dir.path().to_string_lossy().into_owned(),
            ..VideoConfig::default()
        };
        let encoder = Arc::new(GatedEncoder::new(fail));
        let catalog = VideoCatalog::new(&config, encoder.clone(), Arc::new(Counters::default()));
        Fixture {
            _dir: dir,
            catalog,
            encoder,
        }
    }

    fn prepare_stream(root: &Path, name: &str) {
        let dir = root.join("processed").join(name);
        std::fs::create_dir_all(&dir).expect("stream dir");
        std::fs::write(dir.join("master.m3u8"), "#EXTM3U\n").expect("playlist");
    }

    async fn drain_tasks() {
        // Spawned encode tasks bounce through the blocking fs pool; give
        // them real time to land.
        for _ in 0..10 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn output_name_sanitization() {
        assert_eq!(sanitize_output_name("Movie Night (2024)"), "Movie_Night__2024_");
        assert_eq!(sanitize_output_name("intro"), "intro");
        assert_eq!(sanitize_output_name("a.b/c"), "a_b_c");
    }

    #[test]
    fn content_types() {
        assert_eq!(
            content_type_for(Path::new("a/master.m3u8")),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for(Path::new("a/seg_00001.ts")), "video/mp2t");
        assert_eq!(
            content_type_for(Path::new("a/encode.log")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn list_requires_master_playlist() {
        let f = fixture(false);
        let root = f.catalog.root.clone();
        prepare_stream(&root, "intro");
        // A directory without a master playlist does not qualify.
        std::fs::create_dir_all(root.join("processed").join("incomplete")).expect("dir");
        // Neither does one with an invalid name.
        let weird = root.join("processed").join("bad name");
        std::fs::create_dir_all(&weird).expect("dir");
        std::fs::write(weird.join("master.m3u8"), "#EXTM3U\n").expect("playlist");

        let entries = f.catalog.list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_id.as_str(), "hls:intro");
    }

    #[tokio::test]
    async fn list_on_missing_processed_dir_is_empty() {
        let f = fixture(false);
        assert!(f.catalog.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn open_serves_artifacts_with_content_type() {
        let f = fixture(false);
        prepare_stream(&f.catalog.root.clone(), "intro");

        let (_file, ct) = f.catalog.open("intro", "master.m3u8").await.expect("open");
        assert_eq!(ct, "application/vnd.apple.mpegurl");

        let seg_dir = f.catalog.processed.join("intro").join("720p");
        std::fs::create_dir_all(&seg_dir).expect("dir");
        std::fs::write(seg_dir.join("seg_00001.ts"), b"data").expect("segment");
        let (_file, ct) = f
            .catalog
            .open("intro", "720p/seg_00001.ts")
            .await
            .expect("open");
        assert_eq!(ct, "video/mp2t");
    }

    #[tokio::test]
    async fn open_rejects_traversal_and_bad_components() {
        let f = fixture(false);
        prepare_stream(&f.catalog.root.clone(), "intro");

        assert!(matches!(
            f.catalog.open("intro", "../../server.key").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.catalog.open("intro", "a..b/master.m3u8").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.catalog.open("intro", "").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.catalog.open("../processed", "master.m3u8").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.catalog.open("intro", "missing.m3u8").await,
            Err(Error::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_refuses_symlink_escape() {
        let f = fixture(false);
        let root = f.catalog.root.clone();
        prepare_stream(&root, "intro");
        let secret = root.join("secret.txt");
        std::fs::write(&secret, b"keep out").expect("secret");
        std::os::unix::fs::symlink(&secret, f.catalog.processed.join("intro").join("leak.ts"))
            .expect("symlink");

        assert!(matches!(
            f.catalog.open("intro", "leak.ts").await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn scan_encodes_new_sources_once() {
        let f = fixture(false);
        let root = f.catalog.root.clone();
        std::fs::write(root.join("Movie Night.mp4"), b"fake video").expect("source");
        std::fs::write(root.join("notes.txt"), b"not a video").expect("other");

        f.catalog.scan_and_encode().await.expect("scan");
        drain_tasks().await;
        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.catalog.in_flight_count(), 1);

        // A second scan while the encode is in flight is a no-op for it.
        f.catalog.scan_and_encode().await.expect("scan");
        drain_tasks().await;
        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 1);

        // Release the encoder; the finished stream becomes listable.
        f.encoder.gate.add_permits(1);
        drain_tasks().await;
        assert_eq!(f.catalog.in_flight_count(), 0);
        let entries = f.catalog.list().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_id.as_str(), "hls:Movie_Night");

        // Finished output is skipped on later scans.
        f.catalog.scan_and_encode().await.expect("scan");
        drain_tasks().await;
        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scan_skips_already_processed_sources() {
        let f = fixture(false);
        let root = f.catalog.root.clone();
        std::fs::write(root.join("intro.mkv"), b"fake video").expect("source");
        prepare_stream(&root, "intro");

        f.catalog.scan_and_encode().await.expect("scan");
        drain_tasks().await;
        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_encode_clears_in_flight_for_retry() {
        let f = fixture(true);
        let root = f.catalog.root.clone();
        std::fs::write(root.join("intro.mp4"), b"fake video").expect("source");

        f.catalog.scan_and_encode().await.expect("scan");
        f.encoder.gate.add_permits(1);
        drain_tasks().await;
        assert_eq!(f.catalog.in_flight_count(), 0);
        assert!(f.catalog.list().await.expect("list").is_empty());

        // The next scan may re-attempt the same source.
        f.catalog.scan_and_encode().await.expect("scan");
        drain_tasks().await;
        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 2);
    }
}
