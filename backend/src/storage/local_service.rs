use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Which artifact of a study a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Raw,
    Raster,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Raw => "dcm",
            ArtifactKind::Raster => "png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StudyId(Uuid);

impl StudyId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Anything that is not a UUID cannot have been handed out by an upload.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Image not found")]
    NotFound,
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct LocalStorageService {
    root: PathBuf,
    max_upload_bytes: usize,
}

impl LocalStorageService {
    pub fn new(root: PathBuf, max_upload_bytes: usize) -> Self {
        Self {
            root,
            max_upload_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn validate_upload_size(&self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > self.max_upload_bytes {
            return Err(StorageError::FileTooLarge {
                size: data.len(),
                limit: self.max_upload_bytes,
            });
        }
        Ok(())
    }

    pub fn path_for(&self, id: &StudyId, kind: ArtifactKind) -> PathBuf {
        self.root.join(format!("{}.{}", id, kind.extension()))
    }

    /// Writes through a staging file so readers never see a partial artifact.
    pub async fn store(
        &self,
        id: &StudyId,
        kind: ArtifactKind,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let target = self.path_for(id, kind);
        let staging = self.root.join(format!("{}.{}.part", id, kind.extension()));

        let written = match tokio::fs::write(&staging, data).await {
            Ok(()) => tokio::fs::rename(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            discard(&staging).await;
            return Err(e.into());
        }

        Ok(target)
    }

    /// Persists both artifacts of a freshly uploaded study under a new identifier.
    pub async fn store_study(&self, raw: &[u8], raster: &[u8]) -> Result<StudyId, StorageError> {
        self.validate_upload_size(raw)?;

        let id = StudyId::generate();
        self.store_artifacts(&id, raw, raster).await?;

        log::info!("Stored study {} under {}", id, self.root.display());
        Ok(id)
    }

    /// Either both artifacts exist afterwards or neither does.
    async fn store_artifacts(&self, id: &StudyId, raw: &[u8], raster: &[u8]) -> Result<(), StorageError> {
        let raw_path = self.store(id, ArtifactKind::Raw, raw).await?;
        if let Err(e) = self.store(id, ArtifactKind::Raster, raster).await {
            log::error!("Failed to store raster for study {}: {:?}", id, e);
            discard(&raw_path).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn resolve(&self, image_id: &str, kind: ArtifactKind) -> Result<PathBuf, StorageError> {
        let id = StudyId::parse(image_id).ok_or(StorageError::NotFound)?;
        let path = self.path_for(&id, kind);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::NotFound),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, image_id: &str, kind: ArtifactKind) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(image_id, kind).await?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound,
            _ => StorageError::Io(e),
        })
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {:?}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> LocalStorageService {
        LocalStorageService::new(dir.to_path_buf(), 1024)
    }

    #[actix_web::test]
    async fn stored_study_resolves_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(dir.path());

        let id = storage.store_study(b"raw-bytes", b"png-bytes").await.unwrap();
        let id = id.to_string();

        assert_eq!(storage.read(&id, ArtifactKind::Raw).await.unwrap(), b"raw-bytes");
        assert_eq!(storage.read(&id, ArtifactKind::Raster).await.unwrap(), b"png-bytes");
        assert!(dir.path().join(format!("{id}.png")).is_file());
        assert!(!dir.path().join(format!("{id}.png.part")).exists());
    }

    #[actix_web::test]
    async fn unknown_identifier_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(dir.path());
        let id = StudyId::generate().to_string();

        assert!(matches!(
            storage.resolve(&id, ArtifactKind::Raster).await,
            Err(StorageError::NotFound)
        ));
    }

    #[actix_web::test]
    async fn raster_lookup_never_falls_back_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(dir.path());
        let id = StudyId::generate();
        storage.store(&id, ArtifactKind::Raw, b"raw").await.unwrap();

        assert!(matches!(
            storage.read(&id.to_string(), ArtifactKind::Raster).await,
            Err(StorageError::NotFound)
        ));
    }

    #[actix_web::test]
    async fn malformed_identifiers_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(dir.path());

        for bad in ["", "../secret", "not-a-uuid", "..%2F..%2Fetc%2Fpasswd"] {
            assert!(matches!(
                storage.resolve(bad, ArtifactKind::Raster).await,
                Err(StorageError::NotFound)
            ));
        }
    }

    #[actix_web::test]
    async fn oversized_upload_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorageService::new(dir.path().to_path_buf(), 4);

        let result = storage.store_study(b"too large", b"png").await;
        assert!(matches!(
            result,
            Err(StorageError::FileTooLarge { size: 9, limit: 4 })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[actix_web::test]
    async fn ensure_root_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("uploads").join("nested");
        let storage = service(&nested);

        storage.ensure_root().await.unwrap();
        assert!(nested.is_dir());
    }

    #[actix_web::test]
    async fn failed_raster_write_leaves_no_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(dir.path());
        let id = StudyId::generate();
        let blocker = storage.path_for(&id, ArtifactKind::Raster);
        std::fs::create_dir(&blocker).unwrap();

        let result = storage.store_artifacts(&id, b"raw", b"png").await;
        assert!(matches!(result, Err(StorageError::Io(_))));

        let left: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(left, vec![blocker]);
    }

    #[actix_web::test]
    async fn failed_write_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = service(&dir.path().join("missing"));

        let result = storage.store(&StudyId::generate(), ArtifactKind::Raw, b"raw").await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
