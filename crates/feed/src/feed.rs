//! A single feed: in-memory index over its storage file.
//!
//! Records are stored back to back as `[u32 LE length][postcard entry]`.
//! Appends and replicated inserts are serialized behind one writer mutex;
//! readers take a shared lock on the committed entries and never block the
//! writer for longer than a clone.

use crate::entry::{signing_bytes, FeedEntry};
use crate::error::{FeedError, FeedResult};
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessel_core::{File, PublicKey};
use tessel_crypto::Keyring;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Observable feed progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedStatus {
    /// Number of committed entries (next seq to assign)
    pub length: u64,
    /// Set once the feed has been closed
    pub closed: bool,
}

/// Result of offering a replicated entry to a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Committed, possibly along with buffered successors
    Appended,
    /// Already present with identical content
    Duplicate,
    /// Ahead of the local length; held until the gap fills
    Buffered,
    /// Signature did not verify; dropped
    Rejected,
    /// A different entry already occupies this seq; dropped
    Conflict,
}

struct Writer {
    file: Arc<dyn File>,
    offset: u64,
    pending: BTreeMap<u64, FeedEntry>,
}

struct FeedInner {
    key: PublicKey,
    keyring: Arc<Keyring>,
    writable: AtomicBool,
    entries: RwLock<Vec<FeedEntry>>,
    writer: Mutex<Writer>,
    status: watch::Sender<FeedStatus>,
}

/// Handle to a feed. Clones share the same logical feed.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.inner.key)
            .field("writable", &self.is_writable())
            .field("length", &self.length())
            .finish()
    }
}

fn encode_record(entry: &FeedEntry) -> FeedResult<Vec<u8>> {
    let body = postcard::to_stdvec(entry)?;
    let mut record = Vec::with_capacity(4 + body.len());
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

impl Feed {
    /// Load a feed from `file`, keeping the longest verifiable prefix.
    pub(crate) async fn load(
        key: PublicKey,
        file: Arc<dyn File>,
        keyring: Arc<Keyring>,
        writable: bool,
    ) -> FeedResult<Self> {
        let data = file.read_all().await?;
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset + 4 <= data.len() {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&data[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let end = offset + 4 + len;
            if end > data.len() {
                warn!(feed = %key.fmt_short(), offset, "Truncated trailing record");
                break;
            }
            let entry: FeedEntry = match postcard::from_bytes(&data[offset + 4..end]) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(feed = %key.fmt_short(), offset, "Undecodable record: {}", e);
                    break;
                }
            };
            if entry.seq != entries.len() as u64 || !entry.verify(&key) {
                warn!(
                    feed = %key.fmt_short(),
                    seq = entry.seq,
                    "Stored entry failed verification, discarding remainder"
                );
                break;
            }
            entries.push(entry);
            offset = end;
        }

        if offset < data.len() {
            file.truncate(offset as u64).await?;
        }

        debug!(feed = %key.fmt_short(), length = entries.len(), writable, "Feed loaded");
        let (status, _) = watch::channel(FeedStatus {
            length: entries.len() as u64,
            closed: false,
        });
        Ok(Self {
            inner: Arc::new(FeedInner {
                key,
                keyring,
                writable: AtomicBool::new(writable),
                entries: RwLock::new(entries),
                writer: Mutex::new(Writer {
                    file,
                    offset: offset as u64,
                    pending: BTreeMap::new(),
                }),
                status,
            }),
        })
    }

    /// The feed's public key.
    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    /// True if this peer owns the feed and may append.
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    pub(crate) fn set_writable(&self) {
        self.inner.writable.store(true, Ordering::Release);
    }

    /// Number of committed entries.
    pub fn length(&self) -> u64 {
        self.inner.status.borrow().length
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.status.borrow().closed
    }

    /// Watch length and close events.
    pub fn subscribe(&self) -> watch::Receiver<FeedStatus> {
        self.inner.status.subscribe()
    }

    /// Committed entry at `seq`, if any.
    pub async fn get(&self, seq: u64) -> Option<FeedEntry> {
        self.inner.entries.read().await.get(seq as usize).cloned()
    }

    /// Snapshot of committed entries in `[start, end)`.
    pub async fn range(&self, start: u64, end: u64) -> Vec<FeedEntry> {
        let entries = self.inner.entries.read().await;
        let end = (end as usize).min(entries.len());
        let start = (start as usize).min(end);
        entries[start..end].to_vec()
    }

    /// Sign and commit `payload` as the next entry, returning its seq.
    pub async fn append(&self, payload: impl Into<Vec<u8>>) -> FeedResult<u64> {
        if !self.is_writable() {
            return Err(FeedError::PermissionDenied(self.inner.key));
        }
        let payload = payload.into();
        let mut writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(FeedError::Closed(self.inner.key));
        }

        let seq = self.length();
        let signature = self
            .inner
            .keyring
            .sign(&self.inner.key, &signing_bytes(&self.inner.key, seq, &payload))
            .await?;
        let entry = FeedEntry {
            seq,
            payload,
            signature,
        };
        self.commit(&mut writer, entry).await?;
        trace!(feed = %self.inner.key.fmt_short(), seq, "Appended");
        Ok(seq)
    }

    /// Offer an entry received from a peer.
    ///
    /// Verification failures and conflicts are logged and reported through
    /// the outcome; they are never errors.
    pub async fn insert_replicated(&self, entry: FeedEntry) -> FeedResult<InsertOutcome> {
        let key = self.inner.key;
        if !entry.verify(&key) {
            warn!(feed = %key.fmt_short(), seq = entry.seq, "Dropping entry with invalid signature");
            return Ok(InsertOutcome::Rejected);
        }

        let mut writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(FeedError::Closed(key));
        }

        let length = self.length();
        if entry.seq < length {
            let existing = self.get(entry.seq).await;
            return Ok(if existing.as_ref() == Some(&entry) {
                InsertOutcome::Duplicate
            } else {
                warn!(feed = %key.fmt_short(), seq = entry.seq, "Conflicting entry for committed seq");
                InsertOutcome::Conflict
            });
        }

        if self.is_writable() {
            // Nobody else can legitimately extend a feed we own.
            warn!(feed = %key.fmt_short(), seq = entry.seq, "Replicated entry beyond owned feed head");
            return Ok(InsertOutcome::Conflict);
        }

        if entry.seq > length {
            return Ok(match writer.pending.get(&entry.seq) {
                Some(held) if *held == entry => InsertOutcome::Duplicate,
                Some(_) => InsertOutcome::Conflict,
                None => {
                    trace!(feed = %key.fmt_short(), seq = entry.seq, length, "Buffering out-of-order entry");
                    writer.pending.insert(entry.seq, entry);
                    InsertOutcome::Buffered
                }
            });
        }

        self.commit(&mut writer, entry).await?;
        loop {
            let next = self.length();
            let Some(entry) = writer.pending.remove(&next) else {
                break;
            };
            self.commit(&mut writer, entry).await?;
        }
        let stale: Vec<u64> = writer.pending.range(..self.length()).map(|(s, _)| *s).collect();
        for seq in stale {
            writer.pending.remove(&seq);
        }
        Ok(InsertOutcome::Appended)
    }

    async fn commit(&self, writer: &mut Writer, entry: FeedEntry) -> FeedResult<()> {
        let record = encode_record(&entry)?;
        writer.file.write(writer.offset, &record).await?;
        writer.offset += record.len() as u64;

        let mut entries = self.inner.entries.write().await;
        entries.push(entry);
        let length = entries.len() as u64;
        drop(entries);
        self.inner.status.send_modify(|s| s.length = length);
        Ok(())
    }

    /// Live stream of verified entries starting at `start`.
    ///
    /// The stream yields the committed prefix and then waits for new
    /// entries. It ends when the feed closes, or stops at the first entry
    /// that fails verification rather than skipping it.
    pub fn read_from(&self, start: u64) -> impl Stream<Item = FeedEntry> + Send + 'static {
        let feed = self.clone();
        let status = self.subscribe();
        futures::stream::unfold((feed, status, start), |(feed, mut status, next)| async move {
            loop {
                if let Some(entry) = feed.get(next).await {
                    if !entry.verify(&feed.inner.key) {
                        warn!(feed = %feed.inner.key.fmt_short(), seq = next, "Entry failed verification on read");
                        return None;
                    }
                    return Some((entry, (feed, status, next + 1)));
                }
                let advanced = match status.wait_for(|s| s.closed || s.length > next).await {
                    Ok(s) => s.length > next && !s.closed,
                    Err(_) => false,
                };
                if !advanced {
                    return None;
                }
            }
        })
    }

    /// Close the feed after any in-flight append completes.
    pub async fn close(&self) {
        let _writer = self.inner.writer.lock().await;
        self.inner.status.send_if_modified(|s| {
            let changed = !s.closed;
            s.closed = true;
            changed
        });
    }

    pub(crate) async fn delete_storage(&self) -> FeedResult<()> {
        let writer = self.inner.writer.lock().await;
        writer.file.delete().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tessel_core::{Directory, MemoryDirectory};
    use tessel_crypto::KeyPair;

    async fn writable_feed(dir: &MemoryDirectory) -> (Feed, Arc<Keyring>) {
        let keyring = Arc::new(Keyring::new());
        let key = keyring.create_key().await.unwrap();
        let file = dir.file(&key.to_hex()).await.unwrap();
        let feed = Feed::load(key, file, keyring.clone(), true).await.unwrap();
        (feed, keyring)
    }

    async fn replica_of(feed: &Feed, dir: &MemoryDirectory) -> Feed {
        let file = dir.file(&feed.key().to_hex()).await.unwrap();
        Feed::load(feed.key(), file, Arc::new(Keyring::new()), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        for i in 0..5u8 {
            assert_eq!(feed.append(vec![i]).await.unwrap(), i as u64);
        }
        assert_eq!(feed.length(), 5);

        let entries: Vec<_> = feed.read_from(0).take(5).collect().await;
        let payloads: Vec<_> = entries.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        assert!(entries.iter().all(|e| e.verify(&feed.key())));
    }

    #[tokio::test]
    async fn test_read_only_append_denied() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        let replica = replica_of(&feed, &MemoryDirectory::new()).await;
        assert!(matches!(
            replica.append(b"x".to_vec()).await,
            Err(FeedError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_replicated_out_of_order() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        for i in 0..3u8 {
            feed.append(vec![i]).await.unwrap();
        }
        let entries = feed.range(0, 3).await;
        let replica = replica_of(&feed, &MemoryDirectory::new()).await;

        assert_eq!(
            replica.insert_replicated(entries[2].clone()).await.unwrap(),
            InsertOutcome::Buffered
        );
        assert_eq!(replica.length(), 0);
        assert_eq!(
            replica.insert_replicated(entries[0].clone()).await.unwrap(),
            InsertOutcome::Appended
        );
        assert_eq!(replica.length(), 1);
        assert_eq!(
            replica.insert_replicated(entries[1].clone()).await.unwrap(),
            InsertOutcome::Appended
        );
        assert_eq!(replica.length(), 3);
        assert_eq!(
            replica.insert_replicated(entries[1].clone()).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(replica.range(0, 10).await, entries);
    }

    #[tokio::test]
    async fn test_tampered_entry_rejected() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        feed.append(b"genuine".to_vec()).await.unwrap();
        let mut entry = feed.get(0).await.unwrap();
        entry.signature.as_mut_bytes()[10] ^= 0x80;

        let replica = replica_of(&feed, &MemoryDirectory::new()).await;
        assert_eq!(
            replica.insert_replicated(entry).await.unwrap(),
            InsertOutcome::Rejected
        );
        assert_eq!(replica.length(), 0);
    }

    #[tokio::test]
    async fn test_forged_entry_rejected() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        let forger = KeyPair::generate();
        let forged = FeedEntry {
            seq: 0,
            payload: b"forged".to_vec(),
            signature: forger
                .sign(&signing_bytes(&feed.key(), 0, b"forged"))
                .unwrap(),
        };
        let replica = replica_of(&feed, &MemoryDirectory::new()).await;
        assert_eq!(
            replica.insert_replicated(forged).await.unwrap(),
            InsertOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_reload_after_restart() {
        let dir = MemoryDirectory::new();
        let (feed, keyring) = writable_feed(&dir).await;
        feed.append(b"a".to_vec()).await.unwrap();
        feed.append(b"b".to_vec()).await.unwrap();

        let file = dir.file(&feed.key().to_hex()).await.unwrap();
        let reloaded = Feed::load(feed.key(), file, keyring, true).await.unwrap();
        assert_eq!(reloaded.length(), 2);
        assert_eq!(reloaded.append(b"c".to_vec()).await.unwrap(), 2);
        assert_eq!(reloaded.get(1).await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_truncated_tail_recovers() {
        let dir = MemoryDirectory::new();
        let (feed, keyring) = writable_feed(&dir).await;
        feed.append(b"first".to_vec()).await.unwrap();
        feed.append(b"second".to_vec()).await.unwrap();

        let file = dir.file(&feed.key().to_hex()).await.unwrap();
        let size = file.stat().await.unwrap().size;
        file.truncate(size - 3).await.unwrap();

        let reloaded = Feed::load(feed.key(), file.clone(), keyring, true)
            .await
            .unwrap();
        assert_eq!(reloaded.length(), 1);
        assert_eq!(reloaded.append(b"again".to_vec()).await.unwrap(), 1);
        assert_eq!(reloaded.get(1).await.unwrap().payload, b"again");
    }

    #[tokio::test]
    async fn test_flipped_signature_on_disk_never_delivered() {
        let dir = MemoryDirectory::new();
        let (feed, keyring) = writable_feed(&dir).await;
        feed.append(b"one".to_vec()).await.unwrap();
        feed.append(b"two".to_vec()).await.unwrap();
        feed.append(b"three".to_vec()).await.unwrap();

        // Flip the final byte of the last record, which lies in its signature.
        let file = dir.file(&feed.key().to_hex()).await.unwrap();
        let size = file.stat().await.unwrap().size;
        let last = file.read(size - 1, 1).await.unwrap();
        file.write(size - 1, &[last[0] ^ 0x01]).await.unwrap();

        let reloaded = Feed::load(feed.key(), file, keyring, false).await.unwrap();
        reloaded.close().await;
        let payloads: Vec<_> = reloaded.read_from(0).map(|e| e.payload).collect().await;
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_live_reader_sees_new_entries() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        let mut reader = Box::pin(feed.read_from(0));

        let writer = feed.clone();
        tokio::spawn(async move {
            writer.append(b"later".to_vec()).await.unwrap();
        });

        let entry = reader.next().await.unwrap();
        assert_eq!(entry.payload, b"later");
    }

    #[tokio::test]
    async fn test_close_ends_readers_and_appends() {
        let dir = MemoryDirectory::new();
        let (feed, _) = writable_feed(&dir).await;
        feed.append(b"x".to_vec()).await.unwrap();
        let mut reader = Box::pin(feed.read_from(1));

        feed.close().await;
        feed.close().await;
        assert!(reader.next().await.is_none());
        assert!(matches!(
            feed.append(b"y".to_vec()).await,
            Err(FeedError::Closed(_))
        ));
    }
}
