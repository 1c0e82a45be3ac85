use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a remote (or the local) device taking part in sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The six keyed collections of the local store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Listing,
    Booking,
    Message,
    Media,
    Meta,
}

impl EntityKind {
    /// Every collection, in schema order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Listing,
        EntityKind::Booking,
        EntityKind::Message,
        EntityKind::Media,
        EntityKind::Meta,
    ];

    /// Collections exchanged with peers. Meta is device-local.
    pub const SYNCED: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Listing,
        EntityKind::Booking,
        EntityKind::Message,
        EntityKind::Media,
    ];

    /// Table name of the collection.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Listing => "listings",
            EntityKind::Booking => "bookings",
            EntityKind::Message => "messages",
            EntityKind::Media => "media",
            EntityKind::Meta => "meta",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Listing => "listing",
            EntityKind::Booking => "booking",
            EntityKind::Message => "message",
            EntityKind::Media => "media",
            EntityKind::Meta => "meta",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn is_synced(&self) -> bool {
        !matches!(self, EntityKind::Meta)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a booking.
///
/// ```text
/// requested --> confirmed --> canceled
///     |
///     +-------> declined
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Requested,
    Confirmed,
    Declined,
    Canceled,
}

impl BookingStatus {
    /// States reachable in one step from `self`.
    pub fn valid_transitions(&self) -> &'static [BookingStatus] {
        match self {
            BookingStatus::Requested => &[BookingStatus::Confirmed, BookingStatus::Declined],
            BookingStatus::Confirmed => &[BookingStatus::Canceled],
            BookingStatus::Declined | BookingStatus::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Declined and canceled bookings are immutable forever.
    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Declined => "declined",
            BookingStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the Unix epoch, used as the producer-assigned logical
/// timestamp of a revision.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
