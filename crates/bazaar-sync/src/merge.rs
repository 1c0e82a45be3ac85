//! Deterministic per-kind merge rules.
//!
//! [`merge`] is pure: it looks at the stored copy (if any) and an incoming
//! record and decides what should be stored. It never touches the store;
//! the caller commits the decision.

use std::cmp::Ordering;

use bazaar_shared::{
    Booking, BookingStatus, Conflict, ConflictReason, Listing, MediaObject, Message, Record, User,
    ValidationError,
};

use crate::error::MergeError;

/// Side information the rules need beyond the two records.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    /// Hex SEC1 public key of the booking host, when known locally.
    pub host_public_key: Option<String>,
}

/// The record to store and whether it differs from the stored copy.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub accepted: Record,
    pub changed: bool,
    pub conflict: Option<Conflict>,
}

impl MergeOutcome {
    fn keep(local: &Record) -> Self {
        Self {
            accepted: local.clone(),
            changed: false,
            conflict: None,
        }
    }

    fn take(remote: Record) -> Self {
        Self {
            accepted: remote,
            changed: true,
            conflict: None,
        }
    }

    fn conflict(local: &Record, remote: Record, reason: ConflictReason) -> Self {
        Self {
            accepted: local.clone(),
            changed: false,
            conflict: Some(Conflict {
                kind: local.kind(),
                entity_id: local.id().to_string(),
                reason,
                local: local.clone(),
                remote,
            }),
        }
    }
}

/// Merge `remote` into the stored `local` copy of the same entity.
pub fn merge(
    local: Option<&Record>,
    remote: Record,
    ctx: &MergeContext,
) -> Result<MergeOutcome, MergeError> {
    remote.validate()?;

    if let Some(local) = local {
        if local.kind() != remote.kind() || local.id() != remote.id() {
            return Err(ValidationError::new(
                remote.kind().as_str(),
                remote.id(),
                format!("cannot merge into {} {}", local.kind(), local.id()),
            )
            .into());
        }
    }

    match remote {
        Record::Listing(r) => Ok(merge_listing(local, r)),
        Record::Booking(r) => {
            let stored = match local {
                Some(record @ Record::Booking(b)) => Some((record, b)),
                _ => None,
            };
            merge_booking(stored, r, ctx)
        }
        Record::Message(r) => Ok(merge_message(local, r)),
        Record::User(r) => {
            let stored = match local {
                Some(record @ Record::User(u)) => Some((record, u)),
                _ => None,
            };
            Ok(merge_user(stored, r))
        }
        Record::Media(r) => Ok(merge_media(local, r)),
        Record::Meta(m) => {
            Err(ValidationError::new("meta", m.key, "meta entries are device-local").into())
        }
    }
}

/// Check a write made on this device against the stored copy.
///
/// Bookings must carry a hash that matches their content and may only move
/// forward along the lifecycle; a terminal booking is frozen. Other kinds
/// are accepted as is.
pub fn check_local_write(current: Option<&Record>, next: &Record) -> Result<(), MergeError> {
    let Record::Booking(next) = next else {
        return Ok(());
    };
    let intact = next
        .hash_matches()
        .map_err(|e| ValidationError::new("booking", &next.id, e.to_string()))?;
    if !intact {
        return Err(MergeError::TamperDetected {
            id: next.id.clone(),
        });
    }

    let Some(Record::Booking(current)) = current else {
        return Ok(());
    };
    if current == next {
        return Ok(());
    }
    if current.status.is_terminal() {
        return Err(ValidationError::new(
            "booking",
            &next.id,
            format!("booking is {} and cannot change", current.status),
        )
        .into());
    }
    if current.status != next.status && !current.status.can_transition_to(next.status) {
        return Err(ValidationError::new(
            "booking",
            &next.id,
            format!("cannot move from {} to {}", current.status, next.status),
        )
        .into());
    }
    if current.status == next.status
        && current.status != BookingStatus::Requested
        && !current.same_terms(next)
    {
        return Err(ValidationError::new(
            "booking",
            &next.id,
            format!("terms are fixed once {}", current.status),
        )
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Listing: last write wins
// ---------------------------------------------------------------------------

fn digest_or_empty(record: &Record) -> String {
    record.digest().unwrap_or_default()
}

fn merge_listing(local: Option<&Record>, remote: Listing) -> MergeOutcome {
    let remote = Record::Listing(remote);
    let Some(local) = local else {
        return MergeOutcome::take(remote);
    };

    // Newer timestamp wins; ties go to the smaller content digest so both
    // peers settle on the same version.
    let order = remote
        .updated()
        .cmp(&local.updated())
        .then_with(|| digest_or_empty(local).cmp(&digest_or_empty(&remote)));

    match order {
        Ordering::Greater => MergeOutcome::take(remote),
        _ => MergeOutcome::keep(local),
    }
}

// ---------------------------------------------------------------------------
// Booking: state machine with integrity checks
// ---------------------------------------------------------------------------

fn merge_booking(
    stored: Option<(&Record, &Booking)>,
    remote: Booking,
    ctx: &MergeContext,
) -> Result<MergeOutcome, MergeError> {
    let intact = remote
        .hash_matches()
        .map_err(|e| ValidationError::new("booking", &remote.id, e.to_string()))?;
    if !intact {
        return Err(MergeError::TamperDetected { id: remote.id });
    }

    if remote.signature.is_some() {
        let key = ctx
            .host_public_key
            .as_deref()
            .ok_or_else(|| MergeError::SignatureInvalid {
                id: remote.id.clone(),
                reason: format!("no public key known for host {}", remote.host),
            })?;
        remote
            .verify_signature(key)
            .map_err(|e| MergeError::SignatureInvalid {
                id: remote.id.clone(),
                reason: e.to_string(),
            })?;
    }

    let Some((local_record, current)) = stored else {
        return Ok(MergeOutcome::take(Record::Booking(remote)));
    };

    if current.updated > remote.updated || *current == remote {
        return Ok(MergeOutcome::keep(local_record));
    }

    if current.status.can_transition_to(remote.status) {
        return Ok(MergeOutcome::take(Record::Booking(remote)));
    }

    if current.status == remote.status
        && !current.status.is_terminal()
        && remote.updated > current.updated
        && current.same_terms(&remote)
    {
        // An unsigned copy never displaces the host's signed one.
        if current.signature.is_some() && remote.signature.is_none() {
            return Ok(MergeOutcome::keep(local_record));
        }
        return Ok(MergeOutcome::take(Record::Booking(remote)));
    }

    let reason = if current.status.is_terminal() {
        ConflictReason::TerminalState
    } else {
        ConflictReason::IllegalTransition
    };
    Ok(MergeOutcome::conflict(
        local_record,
        Record::Booking(remote),
        reason,
    ))
}

// ---------------------------------------------------------------------------
// Message: append only
// ---------------------------------------------------------------------------

fn merge_message(local: Option<&Record>, mut remote: Message) -> MergeOutcome {
    match local {
        Some(local) => MergeOutcome::keep(local),
        None => {
            remote.unread = true;
            MergeOutcome::take(Record::Message(remote))
        }
    }
}

// ---------------------------------------------------------------------------
// User: field-wise
// ---------------------------------------------------------------------------

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// One profile field. Set on one side only: that side. Set on both and
/// different: the newer record, ties to the smaller value.
fn pick_field(
    local: &Option<String>,
    remote: &Option<String>,
    local_updated: i64,
    remote_updated: i64,
) -> Option<String> {
    match (is_set(local), is_set(remote)) {
        (false, true) => remote.clone(),
        (true, true) if local != remote => match remote_updated.cmp(&local_updated) {
            Ordering::Greater => remote.clone(),
            Ordering::Less => local.clone(),
            Ordering::Equal => local.clone().min(remote.clone()),
        },
        _ => local.clone(),
    }
}

fn merge_user(stored: Option<(&Record, &User)>, mut remote: User) -> MergeOutcome {
    let Some((local_record, current)) = stored else {
        remote.verified = false;
        return MergeOutcome::take(Record::User(remote));
    };

    let (lu, ru) = (current.updated, remote.updated);
    let mut merged = current.clone();
    merged.display_name = pick_field(&current.display_name, &remote.display_name, lu, ru);
    merged.bio = pick_field(&current.bio, &remote.bio, lu, ru);
    merged.avatar_media_id = pick_field(&current.avatar_media_id, &remote.avatar_media_id, lu, ru);
    merged.location = pick_field(&current.location, &remote.location, lu, ru);
    merged.updated = lu.max(ru);

    let mut key_conflict = false;
    match (&current.public_key, &remote.public_key) {
        (None, Some(key)) => merged.public_key = Some(key.clone()),
        (Some(mine), Some(theirs)) if mine != theirs => key_conflict = true,
        _ => {}
    }

    let changed = merged != *current;
    let conflict = key_conflict.then(|| Conflict {
        kind: local_record.kind(),
        entity_id: current.id.clone(),
        reason: ConflictReason::PublicKeyMismatch,
        local: local_record.clone(),
        remote: Record::User(remote),
    });

    MergeOutcome {
        accepted: Record::User(merged),
        changed,
        conflict,
    }
}

// ---------------------------------------------------------------------------
// Media: immutable metadata
// ---------------------------------------------------------------------------

fn merge_media(local: Option<&Record>, remote: MediaObject) -> MergeOutcome {
    let remote = Record::Media(remote);
    match local {
        None => MergeOutcome::take(remote),
        Some(local) if *local == remote => MergeOutcome::keep(local),
        Some(local) => MergeOutcome::conflict(local, remote, ConflictReason::ContentMismatch),
    }
}
