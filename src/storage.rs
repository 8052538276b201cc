//! Storage manager for transient uploads and committed artifacts
//!
//! ## Layout
//!
//! - `uploads/<request-id>_<name>` - staged payloads, removed when the request ends
//! - `data/.partial/*` - artifacts being encoded, invisible under their final name
//! - `data/<artifact-id>.<ext>` - committed artifacts, never overwritten
//!
//! Every writer uses a collision-free name and commits with a no-clobber
//! rename, so concurrent requests never need a lock. A worker killed
//! mid-request leaves its staged and partial files behind; [`Storage::reap`]
//! sweeps them once they are older than any live request could be.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::OutputFormat;
use crate::error::{MediaError, Result};

const PARTIAL_DIR: &str = ".partial";
const MAX_NAME_LEN: usize = 64;

static ARTIFACT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of a committed artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Content hash prefix + process-monotonic counter + random suffix.
    ///
    /// The counter keeps ids unique inside one worker, the random suffix
    /// across workers sharing the same `data` directory.
    pub fn derive(input: &[u8]) -> Self {
        let digest = Sha256::digest(input);
        let hash = hex::encode(&digest[..8]);
        let seq = ARTIFACT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().simple().to_string();
        ArtifactId(format!("{}-{:06x}-{}", hash, seq, &suffix[..8]))
    }

    /// Accepts only the character set [`ArtifactId::derive`] produces
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
        valid.then(|| ArtifactId(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload written to the uploads area
#[derive(Debug)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub size: u64,
}

/// Artifact being written under `data/.partial`
#[derive(Debug)]
pub struct PendingArtifact {
    file: NamedTempFile,
    extension: &'static str,
}

impl PendingArtifact {
    /// Path an external encoder may write into
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn extension(&self) -> &'static str {
        self.extension
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .as_file_mut()
            .write_all(bytes)
            .and_then(|_| self.file.as_file_mut().sync_all())
            .map_err(|e| MediaError::io("write artifact", e))
    }

    pub fn len(&self) -> u64 {
        fs::metadata(self.file.path()).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one orphan sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Storage {
    uploads: PathBuf,
    data: PathBuf,
    partial: PathBuf,
}

impl Storage {
    pub fn open(uploads: impl Into<PathBuf>, data: impl Into<PathBuf>) -> Result<Self> {
        let uploads = uploads.into();
        let data = data.into();
        let partial = data.join(PARTIAL_DIR);

        for dir in [&uploads, &data, &partial] {
            fs::create_dir_all(dir).map_err(|e| MediaError::io("create storage directories", e))?;
        }

        Ok(Self { uploads, data, partial })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    /// Write an incoming payload to `uploads/<request-id>_<name>`
    pub fn stage(&self, request_id: &Uuid, bytes: &[u8], declared_name: Option<&str>) -> Result<StagedUpload> {
        let name = secure_filename(declared_name.unwrap_or("upload"));
        let path = self.uploads.join(format!("{}_{}", request_id.simple(), name));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| MediaError::io("stage upload", e))?;

        if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
            self.discard(&path);
            return Err(MediaError::io("stage upload", e));
        }

        debug!("Staged {} bytes at {}", bytes.len(), path.display());
        Ok(StagedUpload {
            path,
            size: bytes.len() as u64,
        })
    }

    /// Open a partial artifact; dropping it without [`Storage::commit`] deletes it
    pub fn begin_artifact(&self, extension: &'static str) -> Result<PendingArtifact> {
        let file = tempfile::Builder::new()
            .prefix("partial-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.partial)
            .map_err(|e| MediaError::io("open partial artifact", e))?;
        Ok(PendingArtifact { file, extension })
    }

    /// Atomically move a finished artifact to its final name.
    ///
    /// Fails instead of overwriting an existing artifact; the partial file is
    /// removed on failure.
    pub fn commit(&self, pending: PendingArtifact, id: &ArtifactId) -> Result<PathBuf> {
        let target = self.artifact_path(id, pending.extension);
        pending
            .file
            .persist_noclobber(&target)
            .map_err(|e| MediaError::io("commit artifact", e.error))?;
        debug!("Committed artifact {}", id);
        Ok(target)
    }

    /// Best-effort removal used for cleanup; never fails
    pub fn discard(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Discarded {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", path.display(), e),
        }
    }

    /// Remove staged uploads and partial artifacts older than `max_age`
    pub fn reap(&self, max_age: Duration) -> ReapReport {
        let mut report = ReapReport::default();
        let now = SystemTime::now();

        for dir in [&self.uploads, &self.partial] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Reaper cannot read {}: {}", dir.display(), e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                report.scanned += 1;

                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age < max_age {
                    continue;
                }

                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        report.removed += 1;
                        debug!("Reaped orphan {} (age {:?})", entry.path().display(), age);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!("Failed to reap {}: {}", entry.path().display(), e);
                    }
                }
            }
        }

        report
    }

    /// Resolve a committed artifact by id, trying each output extension
    pub fn find_artifact(&self, id: &ArtifactId) -> Option<PathBuf> {
        OutputFormat::ALL
            .iter()
            .map(|format| self.artifact_path(id, format.extension()))
            .find(|path| path.is_file())
    }

    /// Committed artifact count, ignoring partials
    pub fn artifact_count(&self) -> usize {
        count_files(&self.data)
    }

    /// Staged upload count
    pub fn staged_count(&self) -> usize {
        count_files(&self.uploads)
    }

    fn artifact_path(&self, id: &ArtifactId, extension: &str) -> PathBuf {
        self.data.join(format!("{}.{}", id, extension))
    }
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

/// Reduce a client supplied file name to a safe single path component
pub fn secure_filename(name: &str) -> String {
    // Keep only the last component of either separator style
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            ' ' => '_',
            _ => '\0',
        })
        .filter(|c| *c != '\0')
        .collect();

    let trimmed = cleaned.trim_start_matches(['.', '_']);
    let mut safe: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    if safe.is_empty() {
        safe.push_str("upload");
    }
    safe
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> Storage {
        Storage::open(tmp.path().join("uploads"), tmp.path().join("data")).unwrap()
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("C:\\clips\\my clip.mp4"), "my_clip.mp4");
        assert_eq!(secure_filename(".hidden"), "hidden");
        assert_eq!(secure_filename("ünïcødé"), "ncd");
        assert_eq!(secure_filename("///"), "upload");
        assert_eq!(secure_filename(&"a".repeat(200)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_artifact_ids_are_unique_for_same_input() {
        let a = ArtifactId::derive(b"same bytes");
        let b = ArtifactId::derive(b"same bytes");
        assert_ne!(a, b);
        assert_eq!(a.as_str()[..16], b.as_str()[..16]);
        assert!(ArtifactId::parse(a.as_str()).is_some());
    }

    #[test]
    fn test_artifact_id_parse_rejects_traversal() {
        assert!(ArtifactId::parse("../data").is_none());
        assert!(ArtifactId::parse("").is_none());
        assert!(ArtifactId::parse("abc/def").is_none());
        assert!(ArtifactId::parse("00ff-0001-abcd").is_some());
    }

    #[test]
    fn test_stage_and_discard() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);

        let staged = storage.stage(&Uuid::new_v4(), b"payload", Some("clip.mp4")).unwrap();
        assert!(staged.path.starts_with(storage.uploads_dir()));
        assert!(staged.path.to_string_lossy().ends_with("_clip.mp4"));
        assert_eq!(fs::read(&staged.path).unwrap(), b"payload");

        storage.discard(&staged.path);
        assert!(!staged.path.exists());
        // second discard is a no-op
        storage.discard(&staged.path);
        assert_eq!(storage.staged_count(), 0);
    }

    #[test]
    fn test_commit_is_atomic_and_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let id = ArtifactId::derive(b"x");

        let mut pending = storage.begin_artifact("png").unwrap();
        pending.write_all(b"first").unwrap();
        assert_eq!(storage.artifact_count(), 0);
        let path = storage.commit(pending, &id).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        let mut again = storage.begin_artifact("png").unwrap();
        again.write_all(b"second").unwrap();
        let err = storage.commit(again, &id).unwrap_err();
        assert!(matches!(err, MediaError::IoFault { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"first");
        assert_eq!(storage.artifact_count(), 1);
        assert_eq!(count_files(&storage.partial), 0);
        assert_eq!(storage.find_artifact(&id), Some(path));
    }

    #[test]
    fn test_find_artifact_only_resolves_output_extensions() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let id = ArtifactId::derive(b"lookup");

        assert_eq!(storage.find_artifact(&id), None);

        // same stem, but neither a known extension nor a regular file
        fs::write(storage.data_dir().join(format!("{}.txt", id)), b"stray").unwrap();
        fs::create_dir(storage.data_dir().join(format!("{}.png", id))).unwrap();
        assert_eq!(storage.find_artifact(&id), None);

        let mut pending = storage.begin_artifact(OutputFormat::WebP.extension()).unwrap();
        pending.write_all(b"riff").unwrap();
        let path = storage.commit(pending, &id).unwrap();
        assert_eq!(storage.find_artifact(&id), Some(path));
        assert_eq!(storage.find_artifact(&ArtifactId::derive(b"other")), None);
    }

    #[test]
    fn test_dropped_pending_artifact_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        {
            let mut pending = storage.begin_artifact("mp4").unwrap();
            pending.write_all(b"half").unwrap();
        }
        assert_eq!(count_files(&storage.partial), 0);
        assert_eq!(storage.artifact_count(), 0);
    }

    #[test]
    fn test_reap_respects_age_and_spares_artifacts() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);

        storage.stage(&Uuid::new_v4(), b"orphan", None).unwrap();
        let pending = storage.begin_artifact("png").unwrap();
        // simulate a killed worker: the partial file outlives its handle
        let (_file, partial_path) = pending.file.keep().unwrap();
        let mut done = storage.begin_artifact("png").unwrap();
        done.write_all(b"ok").unwrap();
        storage.commit(done, &ArtifactId::derive(b"ok")).unwrap();

        let young = storage.reap(Duration::from_secs(3600));
        assert_eq!(young.removed, 0);
        assert_eq!(young.scanned, 2);

        let old = storage.reap(Duration::ZERO);
        assert_eq!(old.removed, 2);
        assert!(!partial_path.exists());
        assert_eq!(storage.staged_count(), 0);
        assert_eq!(storage.artifact_count(), 1);
    }
}
