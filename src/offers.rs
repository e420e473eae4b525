//! File offer registry.
//!
//! `LocalOfferSet` holds the files this client advertises, `RemoteOfferTable`
//! holds what every peer in the room has advertised to us. Both are plain data
//! structures; broadcasting changes is the session controller's job.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::debug;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Advertised descriptor of a file available for download.
///
/// Identity is the `(name, size)` pair: two offers compare equal when both
/// match, whatever their MIME type says.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOffer {
    name: String,
    size: u64,
    #[serde(rename = "mime", default)]
    mime_type: String,
}

impl FileOffer {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
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

    /// Stable textual id, `name_size`, or `peer_name_size` when scoped to a peer.
    pub fn offer_id(&self, peer_id: Option<&str>) -> String {
        match peer_id {
            Some(peer) => format!("{}_{}_{}", peer, self.name, self.size),
            None => format!("{}_{}", self.name, self.size),
        }
    }
}

impl PartialEq for FileOffer {
    fn eq(&self, other: &Self) -> bool {
        compare_file_offers(self, other)
    }
}

impl Eq for FileOffer {}

impl Hash for FileOffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.hash(state);
    }
}

/// True when both offers describe the same file (same name and size).
pub fn compare_file_offers(a: &FileOffer, b: &FileOffer) -> bool {
    a.name == b.name && a.size == b.size
}

/// A local file handle that can be served to peers.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    offer: FileOffer,
}

impl LocalFile {
    /// Build a handle from a path on disk, reading its size and guessing its MIME type.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        Ok(Self {
            path: path.to_path_buf(),
            offer: FileOffer::new(name, metadata.len(), mime_type),
        })
    }

    pub fn with_offer(path: impl Into<PathBuf>, offer: FileOffer) -> Self {
        Self {
            path: path.into(),
            offer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    pub fn matches(&self, offer: &FileOffer) -> bool {
        compare_file_offers(&self.offer, offer)
    }
}

/// Ordered set of locally offered files.
#[derive(Debug, Default)]
pub struct LocalOfferSet {
    files: Vec<LocalFile>,
}

impl LocalOfferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append files to the set and return the offers that were actually added.
    ///
    /// A file whose identity is already offered is skipped.
    pub fn offer(&mut self, files: Vec<LocalFile>) -> Vec<FileOffer> {
        let mut added = Vec::new();
        for file in files {
            if self.find(file.offer()).is_some() {
                debug!("File {} already offered, skipping", file.offer().name());
                continue;
            }
            added.push(file.offer().clone());
            self.files.push(file);
        }
        added
    }

    /// Remove a file by identity. Returns the removed handle, `None` when absent.
    pub fn unoffer(&mut self, offer: &FileOffer) -> Option<LocalFile> {
        let index = self.files.iter().position(|f| f.matches(offer))?;
        Some(self.files.remove(index))
    }

    pub fn find(&self, offer: &FileOffer) -> Option<&LocalFile> {
        self.files.iter().find(|f| f.matches(offer))
    }

    pub fn offers(&self) -> Vec<FileOffer> {
        self.files.iter().map(|f| f.offer().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// What each remote peer has told us it can serve.
#[derive(Debug, Default)]
pub struct RemoteOfferTable {
    offers: HashMap<String, Vec<FileOffer>>,
}

impl RemoteOfferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append offers for a peer. An empty payload leaves the table untouched;
    /// an offer the peer already advertised is not listed twice.
    pub fn append(&mut self, peer_id: &str, offers: Vec<FileOffer>) {
        if offers.is_empty() {
            return;
        }
        let entry = self.offers.entry(peer_id.to_string()).or_default();
        for offer in offers {
            if !entry.contains(&offer) {
                entry.push(offer);
            }
        }
    }

    /// Remove one offer from a peer's list, dropping the peer entry once empty.
    pub fn remove(&mut self, peer_id: &str, offer: &FileOffer) -> bool {
        let Some(entry) = self.offers.get_mut(peer_id) else {
            return false;
        };
        let Some(index) = entry.iter().position(|o| compare_file_offers(o, offer)) else {
            return false;
        };
        entry.remove(index);
        if entry.is_empty() {
            self.offers.remove(peer_id);
        }
        true
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Vec<FileOffer>> {
        self.offers.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str, offer: &FileOffer) -> bool {
        self.offers
            .get(peer_id)
            .map(|list| list.iter().any(|o| compare_file_offers(o, offer)))
            .unwrap_or(false)
    }

    pub fn get(&self, peer_id: &str) -> Option<&[FileOffer]> {
        self.offers.get(peer_id).map(|v| v.as_slice())
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.offers.contains_key(peer_id)
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<FileOffer>> {
        self.offers.clone()
    }

    pub fn clear(&mut self) {
        self.offers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str, size: u64) -> LocalFile {
        LocalFile::with_offer(
            format!("/tmp/{}", name),
            FileOffer::new(name, size, "text/plain"),
        )
    }

    #[test]
    fn test_offer_identity_ignores_mime() {
        let a = FileOffer::new("report.pdf", 2048, "application/pdf");
        let b = FileOffer::new("report.pdf", 2048, "application/octet-stream");
        let c = FileOffer::new("report.pdf", 2049, "application/pdf");

        assert!(compare_file_offers(&a, &b));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_offer_wire_format() {
        let offer = FileOffer::new("a.txt", 5, "text/plain");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["name"], "a.txt");
        assert_eq!(json["size"], 5);
        assert_eq!(json["mime"], "text/plain");

        let parsed: FileOffer = serde_json::from_str(r#"{"name":"b.bin","size":0}"#).unwrap();
        assert_eq!(parsed.size(), 0);
        assert_eq!(parsed.mime_type(), "");
    }

    #[test]
    fn test_offer_ids() {
        let offer = FileOffer::new("a.txt", 5, "text/plain");
        assert_eq!(offer.offer_id(None), "a.txt_5");
        assert_eq!(offer.offer_id(Some("peer1")), "peer1_a.txt_5");
    }

    #[test]
    fn test_unoffer_then_offer_keeps_single_entry() {
        let mut set = LocalOfferSet::new();
        let file = local("a.txt", 10);

        for _ in 0..3 {
            set.offer(vec![file.clone()]);
            assert!(set.unoffer(file.offer()).is_some());
            set.offer(vec![file.clone()]);
        }

        let matching = set.offers().iter().filter(|o| *o == file.offer()).count();
        assert_eq!(matching, 1);
    }

    #[test]
    fn test_offer_skips_duplicates() {
        let mut set = LocalOfferSet::new();
        let added = set.offer(vec![local("a.txt", 10), local("a.txt", 10), local("b.txt", 3)]);
        assert_eq!(added.len(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.offers()[0].name(), "a.txt");
        assert_eq!(set.offers()[1].name(), "b.txt");
    }

    #[test]
    fn test_unoffer_missing_is_noop() {
        let mut set = LocalOfferSet::new();
        set.offer(vec![local("a.txt", 10)]);
        assert!(set.unoffer(&FileOffer::new("a.txt", 11, "")).is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remote_table_append_and_remove() {
        let mut table = RemoteOfferTable::new();
        let a = FileOffer::new("a.txt", 1, "text/plain");
        let b = FileOffer::new("b.txt", 2, "text/plain");

        table.append("p1", vec![]);
        assert!(!table.has_peer("p1"));

        table.append("p1", vec![a.clone(), b.clone()]);
        table.append("p1", vec![a.clone()]);
        assert_eq!(table.get("p1").unwrap().len(), 2);

        assert!(table.remove("p1", &FileOffer::new("a.txt", 1, "other/mime")));
        assert!(table.contains("p1", &b));
        assert!(!table.contains("p1", &a));

        assert!(table.remove("p1", &b));
        assert!(!table.has_peer("p1"));
        assert!(!table.remove("p1", &b));
    }

    #[tokio::test]
    async fn test_local_file_from_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        assert_eq!(file.offer().name(), "notes.txt");
        assert_eq!(file.offer().size(), 5);
        assert_eq!(file.offer().mime_type(), "text/plain");

        assert!(LocalFile::from_path(dir.path()).await.is_err());
    }
}
