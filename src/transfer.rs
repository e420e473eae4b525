//! Chunked file transfer.
//!
//! Files move over the data channel in fixed 64 KiB chunks followed by a
//! `done` marker. The sender streams from disk one chunk at a time; the
//! receiver buffers chunks per `(peer, offer)` and only materialises the file
//! once the marker arrives and the byte count matches the offer.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio_util::bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::offers::FileOffer;
use crate::protocol::DataMessage;
use crate::transport::PeerChannel;

pub const CHUNK_SIZE: usize = 64 * 1024;

const FALLBACK_FILE_NAME: &str = "download";

/// Number of chunks needed for a file of `size` bytes, `None` when the count
/// does not fit the frame's `u32` chunk fields.
pub fn total_chunks(size: u64) -> Option<u32> {
    u32::try_from(size.div_ceil(CHUNK_SIZE as u64)).ok()
}

fn expected_chunks(offer: &FileOffer) -> Result<u32, TransferError> {
    total_chunks(offer.size()).ok_or_else(|| TransferError::TooLarge {
        name: offer.name().to_string(),
        size: offer.size(),
    })
}

/// Stream `path` to the peer behind `channel` as the file described by `offer`.
///
/// `on_progress` receives the completion percentage after every chunk. The
/// sender reads exactly `offer.size()` bytes; a file that shrank on disk since
/// it was offered fails the upload.
pub async fn send_file<F>(
    offer: &FileOffer,
    path: &Path,
    channel: &dyn PeerChannel,
    mut on_progress: F,
) -> Result<u32, TransferError>
where
    F: FnMut(f32) + Send,
{
    let total = expected_chunks(offer)?;
    let mut file = tokio::fs::File::open(path).await?;
    let mut remaining = offer.size();

    debug!(
        "Uploading {} to {} in {} chunks",
        offer.name(),
        channel.peer_id(),
        total
    );

    for index in 0..total {
        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        remaining -= len as u64;

        let frame = DataMessage::Chunk {
            offer: offer.clone(),
            index,
            total,
            bytes: Bytes::from(buf),
        }
        .encode();
        channel.send(frame).await?;
        on_progress(percent(index + 1, total));
    }

    channel
        .send(
            DataMessage::Done {
                offer: offer.clone(),
            }
            .encode(),
        )
        .await?;
    info!("Upload of {} to {} complete", offer.name(), channel.peer_id());
    Ok(total)
}

fn percent(received: u32, total: u32) -> f32 {
    if total == 0 {
        100.0
    } else {
        received as f32 / total as f32 * 100.0
    }
}

/// Identifies one inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub peer_id: String,
    pub offer: FileOffer,
}

impl TransferKey {
    pub fn new(peer_id: impl Into<String>, offer: FileOffer) -> Self {
        Self {
            peer_id: peer_id.into(),
            offer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub peer_id: String,
    pub offer: FileOffer,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub percent: f32,
}

#[derive(Debug)]
struct TransferState {
    received_chunks: u32,
    total_chunks: u32,
    received_bytes: u64,
    chunks: Vec<Bytes>,
}

/// A verified, fully buffered download.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub peer_id: String,
    pub offer: FileOffer,
    pub chunks: Vec<Bytes>,
}

impl CompletedTransfer {
    pub fn len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-`(peer, offer)` reassembly buffers.
#[derive(Debug, Default)]
pub struct InboundTransfers {
    transfers: HashMap<TransferKey, TransferState>,
}

impl InboundTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next chunk of a transfer.
    ///
    /// Chunks must arrive in order starting at zero, with the total the offer's
    /// size implies, each at most [`CHUNK_SIZE`] bytes and never running past
    /// the offered size. Any violation drops the buffered state for this
    /// transfer.
    pub fn accept_chunk(
        &mut self,
        peer_id: &str,
        offer: &FileOffer,
        index: u32,
        total: u32,
        bytes: Bytes,
    ) -> Result<DownloadProgress, TransferError> {
        let key = TransferKey::new(peer_id, offer.clone());
        let result = self.check_chunk(&key, index, total, bytes.len());
        if let Err(e) = result {
            self.transfers.remove(&key);
            warn!(
                "Discarding transfer of {} from {}: {}",
                offer.name(),
                peer_id,
                e
            );
            return Err(e);
        }

        let state = self.transfers.entry(key).or_insert_with(|| TransferState {
            received_chunks: 0,
            total_chunks: total,
            received_bytes: 0,
            chunks: Vec::new(),
        });
        state.received_bytes += bytes.len() as u64;
        state.received_chunks += 1;
        state.chunks.push(bytes);

        Ok(DownloadProgress {
            peer_id: peer_id.to_string(),
            offer: offer.clone(),
            received_chunks: state.received_chunks,
            total_chunks: state.total_chunks,
            percent: percent(state.received_chunks, state.total_chunks),
        })
    }

    fn check_chunk(
        &self,
        key: &TransferKey,
        index: u32,
        total: u32,
        len: usize,
    ) -> Result<(), TransferError> {
        let offer = &key.offer;
        let expected_total = expected_chunks(offer)?;
        if total != expected_total {
            return Err(TransferError::TotalMismatch {
                name: offer.name().to_string(),
                total,
                expected: expected_total,
            });
        }

        let (received_chunks, received_bytes) = self
            .transfers
            .get(key)
            .map(|state| (state.received_chunks, state.received_bytes))
            .unwrap_or((0, 0));
        if index != received_chunks || index >= total {
            return Err(TransferError::OutOfOrder {
                name: offer.name().to_string(),
                index,
                total,
                expected: received_chunks,
            });
        }
        if len > CHUNK_SIZE || received_bytes + len as u64 > offer.size() {
            return Err(TransferError::Oversized {
                name: offer.name().to_string(),
                index,
                len,
                received_bytes,
                expected_bytes: offer.size(),
            });
        }
        Ok(())
    }

    /// Handle the `done` marker. The state is removed whatever the outcome.
    pub fn finish(
        &mut self,
        peer_id: &str,
        offer: &FileOffer,
    ) -> Result<CompletedTransfer, TransferError> {
        let key = TransferKey::new(peer_id, offer.clone());
        let state = self.transfers.remove(&key).unwrap_or(TransferState {
            received_chunks: 0,
            total_chunks: 0,
            received_bytes: 0,
            chunks: Vec::new(),
        });

        if state.received_chunks != state.total_chunks || state.received_bytes != offer.size() {
            return Err(TransferError::Incomplete {
                name: offer.name().to_string(),
                received_chunks: state.received_chunks,
                total_chunks: state.total_chunks,
                received_bytes: state.received_bytes,
                expected_bytes: offer.size(),
            });
        }

        Ok(CompletedTransfer {
            peer_id: peer_id.to_string(),
            offer: offer.clone(),
            chunks: state.chunks,
        })
    }

    /// Drop every buffer belonging to a peer. Returns how many were dropped.
    pub fn remove_peer(&mut self, peer_id: &str) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|key, _| key.peer_id != peer_id);
        before - self.transfers.len()
    }

    pub fn contains(&self, peer_id: &str, offer: &FileOffer) -> bool {
        self.transfers
            .contains_key(&TransferKey::new(peer_id, offer.clone()))
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    pub fn snapshot(&self) -> Vec<DownloadProgress> {
        let mut progress: Vec<_> = self
            .transfers
            .iter()
            .map(|(key, state)| DownloadProgress {
                peer_id: key.peer_id.clone(),
                offer: key.offer.clone(),
                received_chunks: state.received_chunks,
                total_chunks: state.total_chunks,
                percent: percent(state.received_chunks, state.total_chunks),
            })
            .collect();
        progress.sort_by(|a, b| a.offer.name().cmp(b.offer.name()));
        progress
    }
}

/// Strip any directory components a remote peer put in a file name.
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// First path in `dir` named after `name` that does not exist yet:
/// `name`, then `stem (1).ext`, `stem (2).ext`, ...
pub async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let name = sanitize_file_name(name);
    let candidate = dir.join(&name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let as_path = Path::new(&name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let extension = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u32;
    loop {
        let file_name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(file_name);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Write a completed download into `dir` without overwriting anything.
pub async fn save_download(
    dir: &Path,
    transfer: &CompletedTransfer,
) -> Result<PathBuf, TransferError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = unique_path(dir, transfer.offer.name()).await;

    let mut data = Vec::with_capacity(transfer.len() as usize);
    for chunk in &transfer.chunks {
        data.extend_from_slice(chunk);
    }
    tokio::fs::write(&path, data).await?;

    info!(
        "Saved {} from {} to {}",
        transfer.offer.name(),
        transfer.peer_id,
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{ChannelId, ChannelKind, ChannelState, Frame};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn offer(size: u64) -> FileOffer {
        FileOffer::new("movie.mp4", size, "video/mp4")
    }

    /// Data channel that keeps every frame it is asked to send.
    #[derive(Debug, Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<Frame>>,
    }

    impl RecordingChannel {
        fn messages(&self) -> Vec<DataMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|frame| DataMessage::decode(frame).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl PeerChannel for RecordingChannel {
        fn id(&self) -> ChannelId {
            1
        }
        fn peer_id(&self) -> &str {
            "p1"
        }
        fn kind(&self) -> ChannelKind {
            ChannelKind::Data
        }
        fn dialer(&self) -> &str {
            "p1"
        }
        fn state(&self) -> ChannelState {
            ChannelState::Open
        }
        async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
        async fn close(&self) {}
    }

    /// Send a file of `size` bytes and return the frames and progress values.
    async fn upload(size: usize) -> (Vec<DataMessage>, Vec<f32>, Vec<u8>) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("movie.mp4");
        let contents: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(&path, &contents).await.unwrap();

        let channel = RecordingChannel::default();
        let mut progress = Vec::new();
        let sent = send_file(&offer(size as u64), &path, &channel, |p| progress.push(p))
            .await
            .unwrap();
        let messages = channel.messages();
        assert_eq!(sent as usize, messages.len() - 1);
        (messages, progress, contents)
    }

    fn chunk_parts(message: &DataMessage) -> (u32, u32, Bytes) {
        match message {
            DataMessage::Chunk {
                index,
                total,
                bytes,
                ..
            } => (*index, *total, bytes.clone()),
            other => panic!("expected a chunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_empty_file_sends_only_done() {
        let (messages, progress, _) = upload(0).await;
        assert_eq!(messages, vec![DataMessage::Done { offer: offer(0) }]);
        assert!(progress.is_empty());
    }

    #[tokio::test]
    async fn test_send_exactly_one_chunk() {
        let (messages, progress, contents) = upload(CHUNK_SIZE).await;
        assert_eq!(messages.len(), 2);
        let (index, total, bytes) = chunk_parts(&messages[0]);
        assert_eq!((index, total), (0, 1));
        assert_eq!(bytes.as_ref(), contents.as_slice());
        assert!(matches!(messages[1], DataMessage::Done { .. }));
        assert_eq!(progress, vec![100.0]);
    }

    #[tokio::test]
    async fn test_send_spills_into_second_chunk() {
        let (messages, progress, contents) = upload(CHUNK_SIZE + 1).await;
        assert_eq!(messages.len(), 3);

        let (index, total, first) = chunk_parts(&messages[0]);
        assert_eq!((index, total, first.len()), (0, 2, CHUNK_SIZE));
        let (index, total, second) = chunk_parts(&messages[1]);
        assert_eq!((index, total), (1, 2));
        assert_eq!(second.as_ref(), &contents[CHUNK_SIZE..]);
        assert!(matches!(messages[2], DataMessage::Done { .. }));
        assert_eq!(progress, vec![50.0, 100.0]);

        // What was sent reassembles into the original file.
        let mut inbound = InboundTransfers::new();
        let sent = offer(contents.len() as u64);
        inbound.accept_chunk("p1", &sent, 0, 2, first).unwrap();
        inbound.accept_chunk("p1", &sent, 1, 2, second).unwrap();
        let done = inbound.finish("p1", &sent).unwrap();
        assert_eq!(done.chunks.concat(), contents);
    }

    #[tokio::test]
    async fn test_send_file_shorter_than_offer_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("movie.mp4");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let channel = RecordingChannel::default();
        let result = send_file(&offer(10), &path, &channel, |_| {}).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(channel.messages().is_empty());
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0), Some(0));
        assert_eq!(total_chunks(1), Some(1));
        assert_eq!(total_chunks(CHUNK_SIZE as u64), Some(1));
        assert_eq!(total_chunks(CHUNK_SIZE as u64 + 1), Some(2));
        assert_eq!(total_chunks(200_000), Some(4));
        assert_eq!(total_chunks(u64::MAX), None);
    }

    /// Two chunks: a full one followed by two bytes.
    const TWO_CHUNKS: u64 = CHUNK_SIZE as u64 + 2;

    fn full_chunk() -> Bytes {
        Bytes::from(vec![7u8; CHUNK_SIZE])
    }

    #[test]
    fn test_in_order_chunks_complete() {
        let mut inbound = InboundTransfers::new();
        let offer = offer(TWO_CHUNKS);

        let progress = inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap();
        assert_eq!(progress.received_chunks, 1);
        assert_eq!(progress.percent, 50.0);

        inbound
            .accept_chunk("p1", &offer, 1, 2, Bytes::from_static(b"de"))
            .unwrap();
        let done = inbound.finish("p1", &offer).unwrap();
        assert_eq!(done.len(), TWO_CHUNKS);
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_out_of_order_discards_state() {
        let mut inbound = InboundTransfers::new();
        let offer = offer(TWO_CHUNKS);

        inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap();
        let err = inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { expected: 1, .. }));
        assert!(!inbound.contains("p1", &offer));

        assert!(inbound
            .accept_chunk("p1", &offer, 1, 2, Bytes::from_static(b"de"))
            .is_err());
    }

    #[test]
    fn test_claimed_total_must_match_offer_size() {
        let mut inbound = InboundTransfers::new();
        let tiny = offer(5);

        let err = inbound
            .accept_chunk("p1", &tiny, 0, u32::MAX, Bytes::from_static(b"abcde"))
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::TotalMismatch { total: u32::MAX, expected: 1, .. }
        ));
        assert!(inbound.is_empty());

        let err = inbound
            .accept_chunk("p1", &tiny, 0, 3, full_chunk())
            .unwrap_err();
        assert!(matches!(err, TransferError::TotalMismatch { total: 3, .. }));
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_total_change_mid_transfer_discards_state() {
        let mut inbound = InboundTransfers::new();
        let offer = offer(TWO_CHUNKS);

        inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap();
        assert!(inbound
            .accept_chunk("p1", &offer, 1, 3, Bytes::from_static(b"de"))
            .is_err());
        assert!(!inbound.contains("p1", &offer));
    }

    #[test]
    fn test_oversized_chunks_are_rejected() {
        let mut inbound = InboundTransfers::new();

        let tiny = offer(5);
        let err = inbound
            .accept_chunk("p1", &tiny, 0, 1, Bytes::from_static(b"abcdef"))
            .unwrap_err();
        assert!(matches!(err, TransferError::Oversized { len: 6, .. }));
        assert!(inbound.is_empty());

        let big = offer(2 * CHUNK_SIZE as u64);
        let err = inbound
            .accept_chunk("p1", &big, 0, 2, Bytes::from(vec![0u8; CHUNK_SIZE + 1]))
            .unwrap_err();
        assert!(matches!(err, TransferError::Oversized { .. }));
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_chunk_past_offered_size_discards_state() {
        let mut inbound = InboundTransfers::new();
        let offer = offer(TWO_CHUNKS);

        inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap();
        let err = inbound
            .accept_chunk("p1", &offer, 1, 2, Bytes::from_static(b"xyz"))
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Oversized { index: 1, received_bytes, .. } if received_bytes == CHUNK_SIZE as u64
        ));
        assert!(!inbound.contains("p1", &offer));
    }

    #[test]
    fn test_unrepresentable_size_is_rejected() {
        let mut inbound = InboundTransfers::new();
        let huge = offer(u64::MAX);
        let err = inbound
            .accept_chunk("p1", &huge, 0, u32::MAX, full_chunk())
            .unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { .. }));
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_done_before_all_chunks_fails() {
        let mut inbound = InboundTransfers::new();
        let offer = offer(TWO_CHUNKS);

        inbound
            .accept_chunk("p1", &offer, 0, 2, full_chunk())
            .unwrap();
        assert!(matches!(
            inbound.finish("p1", &offer),
            Err(TransferError::Incomplete { received_chunks: 1, total_chunks: 2, .. })
        ));
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_zero_size_completes_on_done_only() {
        let mut inbound = InboundTransfers::new();
        let empty = offer(0);
        let done = inbound.finish("p1", &empty).unwrap();
        assert!(done.is_empty());

        assert!(inbound.finish("p1", &offer(3)).is_err());
    }

    #[test]
    fn test_remove_peer() {
        let mut inbound = InboundTransfers::new();
        inbound
            .accept_chunk("p1", &offer(70_000), 0, 2, Bytes::from(vec![0u8; CHUNK_SIZE]))
            .unwrap();
        inbound
            .accept_chunk("p2", &offer(70_000), 0, 2, Bytes::from(vec![0u8; CHUNK_SIZE]))
            .unwrap();

        assert_eq!(inbound.remove_peer("p1"), 1);
        assert!(!inbound.contains("p1", &offer(70_000)));
        assert_eq!(inbound.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_path_never_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = unique_path(dir.path(), "a.txt").await;
        assert_eq!(first, dir.path().join("a.txt"));
        tokio::fs::write(&first, b"1").await.unwrap();

        let second = unique_path(dir.path(), "a.txt").await;
        assert_eq!(second, dir.path().join("a (1).txt"));
        tokio::fs::write(&second, b"2").await.unwrap();

        assert_eq!(
            unique_path(dir.path(), "a.txt").await,
            dir.path().join("a (2).txt")
        );
        assert_eq!(
            unique_path(dir.path(), "../../etc/passwd").await,
            dir.path().join("passwd")
        );
    }

    #[tokio::test]
    async fn test_save_download() {
        let dir = tempfile::TempDir::new().unwrap();
        let transfer = CompletedTransfer {
            peer_id: "p1".to_string(),
            offer: FileOffer::new("x.bin", 4, ""),
            chunks: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
        };
        let path = save_download(&dir.path().join("nested"), &transfer)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcd");
    }
}
