//! Passphrase-encrypted export and import of the whole store.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use bazaar_shared::crypto::{probe_kdf, KeyDerivation};
use bazaar_shared::{content_id, envelope, EntityKind, Record, User};
use bazaar_store::migrations::CURRENT_VERSION;
use bazaar_store::{BackupBlob, BackupPayload, StoreError};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{SyncError, SyncResult};
use crate::events::ChangeOrigin;
use crate::orchestrator::SyncEngine;

/// Outcome of [`SyncEngine::import_encrypted`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Records in the backup.
    pub total: usize,
    pub applied: u32,
    pub rejected: u32,
    pub conflicts: u32,
    /// Records whose stored version changed.
    pub changed: usize,
    /// Media blobs written from the backup.
    pub media: usize,
}

impl SyncEngine {
    /// Use `kdf` for exports instead of probing for the strongest one.
    pub fn with_kdf(mut self, kdf: Arc<dyn KeyDerivation>) -> Self {
        self.kdf = Arc::new(OnceLock::from(kdf));
        self
    }

    async fn export_kdf(&self) -> SyncResult<Arc<dyn KeyDerivation>> {
        if let Some(kdf) = self.kdf.get() {
            return Ok(Arc::clone(kdf));
        }
        let cell = Arc::clone(&self.kdf);
        let kdf = tokio::task::spawn_blocking(move || {
            Arc::clone(cell.get_or_init(|| Arc::from(probe_kdf())))
        })
        .await?;
        Ok(kdf)
    }

    /// Every synced record, the media bytes held for them and the unread
    /// flags, as JSON sealed under `passphrase`.
    pub async fn export_encrypted(&self, passphrase: &[u8]) -> SyncResult<Vec<u8>> {
        let mut payload = self.store().with_db(|db| Ok(db.export_payload()?)).await?;
        for media in &payload.media {
            if !self.store().has_blob(media.id.clone()).await? {
                continue;
            }
            match self.store().get_blob(media.id.clone()).await {
                Ok(bytes) => payload.blobs.push(BackupBlob {
                    id: media.id.clone(),
                    data: hex::encode(bytes),
                }),
                Err(e) => warn!(id = %media.id, error = %e, "media left out of backup"),
            }
        }
        let records = payload.len();
        let kdf = self.export_kdf().await?;
        let passphrase = Zeroizing::new(passphrase.to_vec());

        let sealed = tokio::task::spawn_blocking(move || -> SyncResult<Vec<u8>> {
            let json = Zeroizing::new(serde_json::to_vec(&payload)?);
            Ok(envelope::seal(&passphrase, &json, kdf.as_ref())?)
        })
        .await??;

        info!(records, bytes = sealed.len(), "backup exported");
        Ok(sealed)
    }

    /// Decrypt a backup and merge every record in it as if a peer had sent
    /// it. A wrong passphrase or altered file fails before anything is
    /// written.
    pub async fn import_encrypted(&self, data: &[u8], passphrase: &[u8]) -> SyncResult<ImportStats> {
        let data = data.to_vec();
        let passphrase = Zeroizing::new(passphrase.to_vec());

        let mut payload = tokio::task::spawn_blocking(move || -> SyncResult<BackupPayload> {
            let plaintext = Zeroizing::new(envelope::open(&data, &passphrase)?);
            Ok(serde_json::from_slice(&plaintext)?)
        })
        .await??;

        if payload.schema_version > CURRENT_VERSION {
            return Err(SyncError::from(StoreError::SchemaMismatch {
                found: payload.schema_version,
                expected: CURRENT_VERSION,
            }));
        }

        let total = payload.len();
        let media = self.restore_blobs(std::mem::take(&mut payload.blobs)).await?;
        let unread: HashSet<String> = std::mem::take(&mut payload.unread).into_iter().collect();
        let verified: Vec<User> = payload.users.iter().filter(|u| u.verified).cloned().collect();

        let report = self.store().apply_remote(payload.into_records(), None).await?;
        let changed = report.changed_count();

        // Merging marks new messages unread and new users unverified; put
        // back what the exporting device had.
        let read: Vec<String> = report
            .changed
            .get(&EntityKind::Message)
            .into_iter()
            .flatten()
            .filter(|id| !unread.contains(*id))
            .cloned()
            .collect();
        self.store()
            .with_db(move |db| {
                db.transaction(|db| {
                    for id in &read {
                        db.set_unread(id, false)?;
                    }
                    for user in &verified {
                        if let Some(Record::User(mut stored)) = db.get(EntityKind::User, &user.id)? {
                            if !stored.verified
                                && stored.public_key.is_some()
                                && stored.public_key == user.public_key
                            {
                                stored.verified = true;
                                db.put(&Record::User(stored))?;
                            }
                        }
                    }
                    Ok(())
                })?;
                Ok(())
            })
            .await?;

        self.notifier().notify(report.changed, ChangeOrigin::Import);

        info!(
            total,
            applied = report.applied,
            rejected = report.rejected,
            conflicts = report.conflicts,
            media,
            "backup imported"
        );
        Ok(ImportStats {
            total,
            applied: report.applied,
            rejected: report.rejected,
            conflicts: report.conflicts,
            changed,
            media,
        })
    }

    /// Store each blob whose bytes hash to its id. Returns how many were new.
    async fn restore_blobs(&self, blobs: Vec<BackupBlob>) -> SyncResult<usize> {
        let mut restored = 0;
        for blob in blobs {
            let bytes = match hex::decode(&blob.data) {
                Ok(bytes) if content_id(&bytes) == blob.id => bytes,
                _ => {
                    warn!(id = %blob.id, "backup blob does not match its id");
                    continue;
                }
            };
            if self.store().has_blob(blob.id.clone()).await? {
                continue;
            }
            self.store().put_blob(bytes).await?;
            restored += 1;
        }
        Ok(restored)
    }
}
