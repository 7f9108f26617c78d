//! File blobs on the sending side and assembled artifacts on the receiving side.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::TransferError;
use crate::protocol::FileMetadata;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
enum Source {
    Memory(Bytes),
    Disk(Arc<Mutex<File>>),
}

/// A named byte blob with a declared size and MIME type
#[derive(Debug, Clone)]
pub struct FileBlob {
    name: String,
    size: u64,
    mime_type: String,
    source: Source,
}

impl FileBlob {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
            source: Source::Memory(data),
        }
    }

    /// Open a file on disk; its MIME type is inferred from the extension
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)
            .await
            .map_err(|e| TransferError::ReadFailure(format!("{}: {}", path.display(), e)))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| TransferError::ReadFailure(e.to_string()))?;
        if !meta.is_file() {
            return Err(TransferError::NoFileSelected);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or(TransferError::NoFileSelected)?;

        Ok(Self {
            mime_type: mime_guess::from_path(path).first_or_octet_stream().to_string(),
            name,
            size: meta.len(),
            source: Source::Disk(Arc::new(Mutex::new(file))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            index: None,
            total: None,
        }
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// The returned future owns everything it needs, so it can be held
    /// across other work and dropped to abort the read.
    pub fn read_chunk(
        &self,
        offset: u64,
        len: usize,
    ) -> impl std::future::Future<Output = Result<Bytes, TransferError>> + Send + 'static {
        let source = self.source.clone();
        async move {
            match source {
                Source::Memory(data) => {
                    let start = (offset as usize).min(data.len());
                    let end = start.saturating_add(len).min(data.len());
                    Ok(data.slice(start..end))
                }
                Source::Disk(file) => {
                    let mut file = file.lock().await;
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|e| TransferError::ReadFailure(e.to_string()))?;

                    let mut buf = BytesMut::zeroed(len);
                    let mut filled = 0;
                    while filled < len {
                        let n = file
                            .read(&mut buf[filled..])
                            .await
                            .map_err(|e| TransferError::ReadFailure(e.to_string()))?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }
                    buf.truncate(filled);
                    Ok(buf.freeze())
                }
            }
        }
    }
}

/// An assembled file on the receiving side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn mime_type(&self) -> &str {
        &self.metadata.mime_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bundles are archives meant to be unpacked after delivery
    pub fn is_bundle(&self) -> bool {
        self.metadata.name.to_ascii_lowercase().ends_with(".zip")
    }

    /// Write the artifact into `dir` under its sanitized name
    pub async fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(sanitize_file_name(&self.metadata.name));
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }

    /// Unpack a bundle into `dir` as flat files, one per archive member.
    ///
    /// Directory entries are skipped and nested paths are flattened, so
    /// `docs/a.txt` lands as `docs_a.txt`.
    pub async fn extract_to(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let members = read_bundle(&self.data)?;
        tokio::fs::create_dir_all(dir).await?;

        let mut written = Vec::with_capacity(members.len());
        for (name, contents) in members {
            let path = dir.join(name);
            tokio::fs::write(&path, contents).await?;
            written.push(path);
        }
        Ok(written)
    }
}

fn read_bundle(data: &Bytes) -> io::Result<Vec<(String, Vec<u8>)>> {
    let invalid = |e: zip::result::ZipError| io::Error::new(io::ErrorKind::InvalidData, e);
    let mut archive = zip::ZipArchive::new(io::Cursor::new(data.clone())).map_err(invalid)?;

    let mut members = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(invalid)?;
        if entry.is_dir() {
            continue;
        }
        let name = flatten_member_path(entry.name());
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        members.push((name, contents));
    }
    Ok(members)
}

/// Turn an archive member path into a single file name
pub fn flatten_member_path(path: &str) -> String {
    sanitize_file_name(&path.trim_end_matches('/').replace('/', "_"))
}

/// Strip any path components from a peer-supplied file name
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or("");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bundle() -> Bytes {
        let options = zip::write::SimpleFileOptions::default();
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        writer.add_directory("docs/", options).unwrap();
        writer.start_file("docs/readme.txt", options).unwrap();
        writer.write_all(b"read me").unwrap();
        writer.start_file("top.bin", options).unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();
        writer.add_directory("empty/", options).unwrap();
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn received(name: &str, data: Bytes) -> ReceivedFile {
        ReceivedFile {
            metadata: FileMetadata {
                name: name.into(),
                size: data.len() as u64,
                mime_type: "application/zip".into(),
                index: None,
                total: None,
            },
            data,
        }
    }

    #[tokio::test]
    async fn test_memory_chunks() {
        let blob = FileBlob::from_bytes("a.bin", DEFAULT_MIME_TYPE, vec![1u8, 2, 3, 4, 5]);
        assert_eq!(blob.size(), 5);
        assert_eq!(blob.read_chunk(0, 2).await.unwrap(), Bytes::from_static(&[1, 2]));
        assert_eq!(blob.read_chunk(4, 2).await.unwrap(), Bytes::from_static(&[5]));
        assert!(blob.read_chunk(5, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_chunks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let blob = FileBlob::open(tmp.path()).await.unwrap();
        assert_eq!(blob.size(), 10_000);

        let tail = blob.read_chunk(8192, 4096).await.unwrap();
        assert_eq!(&tail[..], &data[8192..]);
        let head = blob.read_chunk(0, 100).await.unwrap();
        assert_eq!(&head[..], &data[..100]);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = FileBlob::open(Path::new("/definitely/not/here.bin")).await.unwrap_err();
        assert!(matches!(err, TransferError::ReadFailure(_)));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\photo.png"), "photo.png");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("dir/"), "file");
        assert_eq!(sanitize_file_name("  "), "file");
    }

    async fn mime_of(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        FileBlob::open(&path).await.unwrap().mime_type().to_string()
    }

    #[tokio::test]
    async fn test_open_guesses_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(mime_of(dir.path(), "Photo.JPG").await, "image/jpeg");
        assert_eq!(mime_of(dir.path(), "bundle.zip").await, "application/zip");
        assert_eq!(
            mime_of(dir.path(), "report.docx").await,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(mime_of(dir.path(), "clip.mov").await, "video/quicktime");
        assert_eq!(mime_of(dir.path(), "Makefile").await, DEFAULT_MIME_TYPE);
        assert_eq!(mime_of(dir.path(), "archive.unknownext").await, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_write_received_file() {
        let dir = tempfile::tempdir().unwrap();
        let received = ReceivedFile {
            metadata: FileMetadata {
                name: "../escape.txt".into(),
                size: 2,
                mime_type: "text/plain".into(),
                index: None,
                total: None,
            },
            data: Bytes::from_static(b"hi"),
        };
        assert!(!received.is_bundle());
        let path = received.write_to(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("escape.txt"));
        assert_eq!(std::fs::read(path).unwrap(), b"hi");
    }

    #[test]
    fn test_flatten_member_path() {
        assert_eq!(flatten_member_path("a/b/c.txt"), "a_b_c.txt");
        assert_eq!(flatten_member_path("plain.txt"), "plain.txt");
        assert_eq!(flatten_member_path("../up.txt"), ".._up.txt");
        assert_eq!(flatten_member_path("win\\evil.txt"), "evil.txt");
    }

    #[tokio::test]
    async fn test_extract_bundle_flattens_members() {
        let dir = tempfile::tempdir().unwrap();
        let file = received("Folder.ZIP", bundle());
        assert!(file.is_bundle());

        let written = file.extract_to(dir.path()).await.unwrap();
        assert_eq!(
            written,
            vec![dir.path().join("docs_readme.txt"), dir.path().join("top.bin")]
        );
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"read me");
        assert_eq!(std::fs::read(&written[1]).unwrap(), vec![1, 2, 3]);
        assert!(!dir.path().join("docs").exists());
        assert!(!dir.path().join("empty").exists());
    }

    #[tokio::test]
    async fn test_extract_rejects_non_archive() {
        let dir = tempfile::tempdir().unwrap();
        let file = received("fake.zip", Bytes::from_static(b"not a zip"));
        let err = file.extract_to(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
