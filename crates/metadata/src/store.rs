//! Metadata store: serialized read-modify-write over the catalog file.

use crate::error::{MetadataError, MetadataResult};
use crate::types::{
    IdentityRecord, InvitationRecord, SpaceMetadata, SpaceState, StoreMetadata, STORE_VERSION,
};
use std::sync::Arc;
use tessel_core::{now_millis, Directory, PublicKey, Timeframe};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Name of the catalog file within the store directory.
pub const METADATA_FILE: &str = "metadata";

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct State {
    metadata: StoreMetadata,
    corrupted: bool,
}

/// Persistent catalog of spaces, identity and hosted invitations.
pub struct MetadataStore {
    directory: Arc<dyn Directory>,
    state: Mutex<State>,
    updates: broadcast::Sender<StoreMetadata>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("directory", &self.directory.path())
            .finish()
    }
}

impl MetadataStore {
    /// Store over `directory`. Call [`load`](Self::load) before use.
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            directory,
            state: Mutex::new(State::default()),
            updates,
        }
    }

    /// Read the catalog file.
    ///
    /// A missing or short (< 4 bytes) file is a first run. A length prefix
    /// that overruns the file, or an undecodable body, yields `Corrupted`;
    /// the in-memory catalog is left empty and the file untouched.
    pub async fn load(&self) -> MetadataResult<()> {
        let mut state = self.state.lock().await;
        let file = self.directory.file(METADATA_FILE).await?;
        let data = file.read_all().await?;

        if data.len() < 4 {
            debug!("No metadata found, starting fresh");
            *state = State::default();
            return Ok(());
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[..4]);
        let declared = u32::from_le_bytes(len_bytes) as usize;
        let remaining = data.len() - 4;

        let result = if declared > remaining {
            Err(MetadataError::Corrupted(format!(
                "declared length {} exceeds remaining {} bytes",
                declared, remaining
            )))
        } else {
            postcard::from_bytes::<StoreMetadata>(&data[4..4 + declared])
                .map_err(|e| MetadataError::Corrupted(format!("undecodable body: {}", e)))
        };

        match result {
            Ok(metadata) => {
                if metadata.version > STORE_VERSION {
                    warn!(
                        version = metadata.version,
                        "Metadata written by a newer version"
                    );
                }
                info!(
                    spaces = metadata.spaces.len(),
                    identity = metadata.identity.is_some(),
                    "Metadata loaded"
                );
                *state = State {
                    metadata,
                    corrupted: false,
                };
                Ok(())
            }
            Err(e) => {
                error!("Metadata store corrupted: {}", e);
                *state = State {
                    metadata: StoreMetadata::default(),
                    corrupted: true,
                };
                Err(e)
            }
        }
    }

    /// Discard the catalog, deleting the backing file. The only way out of
    /// the corrupted state.
    pub async fn clear(&self) -> MetadataResult<()> {
        let mut state = self.state.lock().await;
        self.directory.file(METADATA_FILE).await?.delete().await?;
        *state = State::default();
        warn!("Metadata store cleared");
        Ok(())
    }

    /// True after a failed load until [`clear`](Self::clear).
    pub async fn is_corrupted(&self) -> bool {
        self.state.lock().await.corrupted
    }

    /// Snapshot of the whole catalog.
    pub async fn metadata(&self) -> StoreMetadata {
        self.state.lock().await.metadata.clone()
    }

    /// Catalog format version.
    pub async fn version(&self) -> u32 {
        self.state.lock().await.metadata.version
    }

    /// All known spaces.
    pub async fn spaces(&self) -> Vec<SpaceMetadata> {
        self.state.lock().await.metadata.spaces.clone()
    }

    /// One space's catalog entry.
    pub async fn space(&self, key: &PublicKey) -> Option<SpaceMetadata> {
        self.state
            .lock()
            .await
            .metadata
            .spaces
            .iter()
            .find(|s| s.key == *key)
            .cloned()
    }

    /// True if `key` is in the catalog.
    pub async fn has_space(&self, key: &PublicKey) -> bool {
        self.space(key).await.is_some()
    }

    /// The local identity record, if one has been set.
    pub async fn identity_record(&self) -> Option<IdentityRecord> {
        self.state.lock().await.metadata.identity
    }

    /// Hosted invitations.
    pub async fn invitations(&self) -> Vec<InvitationRecord> {
        self.state.lock().await.metadata.invitations.clone()
    }

    /// Receive a snapshot after every successful save.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreMetadata> {
        self.updates.subscribe()
    }

    /// Record a new space. Fails with `AlreadyExists` if the key is known.
    pub async fn add_space(&self, record: SpaceMetadata) -> MetadataResult<()> {
        self.mutate(|metadata| {
            if metadata.spaces.iter().any(|s| s.key == record.key) {
                return Err(MetadataError::AlreadyExists(format!("space {}", record.key)));
            }
            debug!(space = %record.key.fmt_short(), "Adding space");
            metadata.spaces.push(record);
            Ok(())
        })
        .await
    }

    /// Set the identity record. Fails with `AlreadyExists` if one is set.
    pub async fn set_identity_record(&self, record: IdentityRecord) -> MetadataResult<()> {
        self.mutate(|metadata| {
            if let Some(existing) = &metadata.identity {
                return Err(MetadataError::AlreadyExists(format!(
                    "identity {}",
                    existing.identity_key
                )));
            }
            info!(identity = %record.identity_key.fmt_short(), "Identity record set");
            metadata.identity = Some(record);
            Ok(())
        })
        .await
    }

    /// Append a newly admitted feed to a space. Known feeds are ignored.
    pub async fn add_space_feed(&self, space: &PublicKey, feed: PublicKey) -> MetadataResult<()> {
        self.mutate(|metadata| {
            let entry = find_space(metadata, space)?;
            if entry.feed_keys().any(|k| k == feed) {
                return Ok(());
            }
            entry.additional_feed_keys.push(feed);
            Ok(())
        })
        .await
    }

    /// Merge `timeframe` into the space's control timeframe.
    pub async fn set_space_control_timeframe(
        &self,
        space: &PublicKey,
        timeframe: &Timeframe,
    ) -> MetadataResult<()> {
        self.mutate(|metadata| {
            find_space(metadata, space)?.control_timeframe.merge(timeframe);
            Ok(())
        })
        .await
    }

    /// Merge `timeframe` into the space's data timeframe.
    pub async fn set_space_data_timeframe(
        &self,
        space: &PublicKey,
        timeframe: &Timeframe,
    ) -> MetadataResult<()> {
        self.mutate(|metadata| {
            find_space(metadata, space)?.data_timeframe.merge(timeframe);
            Ok(())
        })
        .await
    }

    /// Activate or deactivate a space.
    pub async fn set_space_state(&self, space: &PublicKey, state: SpaceState) -> MetadataResult<()> {
        self.mutate(|metadata| {
            find_space(metadata, space)?.state = state;
            Ok(())
        })
        .await
    }

    /// Persist a hosted invitation.
    pub async fn add_invitation(&self, record: InvitationRecord) -> MetadataResult<()> {
        self.mutate(|metadata| {
            if metadata
                .invitations
                .iter()
                .any(|i| i.invitation_id == record.invitation_id)
            {
                return Err(MetadataError::AlreadyExists(format!(
                    "invitation {}",
                    record.invitation_id
                )));
            }
            metadata.invitations.push(record);
            Ok(())
        })
        .await
    }

    /// Forget a hosted invitation. Returns whether it was present.
    pub async fn remove_invitation(&self, invitation_id: &PublicKey) -> MetadataResult<bool> {
        let mut removed = false;
        self.mutate(|metadata| {
            let before = metadata.invitations.len();
            metadata
                .invitations
                .retain(|i| i.invitation_id != *invitation_id);
            removed = metadata.invitations.len() != before;
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// Drop invitations whose lifetime ended before `now`.
    pub async fn prune_expired_invitations(&self, now: u64) -> MetadataResult<usize> {
        let mut pruned = 0;
        self.mutate(|metadata| {
            let before = metadata.invitations.len();
            metadata.invitations.retain(|i| !i.is_expired(now));
            pruned = before - metadata.invitations.len();
            Ok(())
        })
        .await?;
        if pruned > 0 {
            debug!(pruned, "Pruned expired invitations");
        }
        Ok(pruned)
    }

    /// Apply `f` to a copy of the catalog and persist it; the in-memory
    /// catalog only changes if the save succeeds.
    async fn mutate<F>(&self, f: F) -> MetadataResult<()>
    where
        F: FnOnce(&mut StoreMetadata) -> MetadataResult<()>,
    {
        let mut state = self.state.lock().await;
        if state.corrupted {
            return Err(MetadataError::Corrupted(
                "refusing to overwrite corrupted metadata; clear the store first".to_string(),
            ));
        }

        let mut next = state.metadata.clone();
        f(&mut next)?;
        let now = now_millis();
        if next.created == 0 {
            next.created = now;
        }
        next.updated = now;
        next.version = STORE_VERSION;

        let body = postcard::to_stdvec(&next)?;
        let mut record = Vec::with_capacity(4 + body.len());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&body);

        let file = self.directory.file(METADATA_FILE).await?;
        file.write(0, &record).await?;
        file.truncate(record.len() as u64).await?;

        state.metadata = next;
        let _ = self.updates.send(state.metadata.clone());
        Ok(())
    }
}

fn find_space<'a>(
    metadata: &'a mut StoreMetadata,
    key: &PublicKey,
) -> MetadataResult<&'a mut SpaceMetadata> {
    metadata
        .spaces
        .iter_mut()
        .find(|s| s.key == *key)
        .ok_or(MetadataError::SpaceNotFound(*key))
}
