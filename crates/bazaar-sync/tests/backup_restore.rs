use std::sync::Arc;

use bazaar_shared::crypto::Pbkdf2Kdf;
use bazaar_shared::{
    Booking, BookingStatus, EntityKind, Identity, MediaObject, Message, PeerId, Record, User,
};
use bazaar_sync::{StoreHandle, SyncConfig, SyncEngine};

fn engine(name: &str) -> SyncEngine {
    SyncEngine::new(
        PeerId::new(name),
        StoreHandle::in_memory().unwrap(),
        SyncConfig::default(),
    )
    .with_kdf(Arc::new(Pbkdf2Kdf::new(1_000).unwrap()))
}

#[tokio::test]
async fn restore_onto_second_device_is_idempotent() {
    let laptop = engine("laptop");
    let mut booking = Booking::request(
        "b1", "l1", "hana", "omar", "2025-06-01", "2025-06-04", 36_000, "EUR", 100,
    )
    .unwrap();
    booking.transition(BookingStatus::Confirmed, 200).unwrap();
    laptop.put_local(Record::User(User::new("hana", 5))).await.unwrap();
    laptop.put_local(Record::Booking(booking.clone())).await.unwrap();

    let sealed = laptop.export_encrypted(b"river house").await.unwrap();

    let phone = engine("phone");
    let first = phone.import_encrypted(&sealed, b"river house").await.unwrap();
    assert_eq!(first.total, 2);
    assert_eq!(first.changed, 2);
    assert_eq!(first.rejected, 0);

    let second = phone.import_encrypted(&sealed, b"river house").await.unwrap();
    assert_eq!(second.changed, 0);

    assert_eq!(
        phone.store().get(EntityKind::Booking, "b1").await.unwrap(),
        Some(Record::Booking(booking))
    );
}

#[tokio::test]
async fn older_backup_does_not_roll_back_newer_state() {
    let device = engine("laptop");
    let requested = Booking::request(
        "b1", "l1", "hana", "omar", "2025-06-01", "2025-06-04", 36_000, "EUR", 100,
    )
    .unwrap();
    device.put_local(Record::Booking(requested.clone())).await.unwrap();
    let sealed = device.export_encrypted(b"pw").await.unwrap();

    let mut confirmed = requested;
    confirmed.transition(BookingStatus::Confirmed, 300).unwrap();
    device.put_local(Record::Booking(confirmed.clone())).await.unwrap();

    let stats = device.import_encrypted(&sealed, b"pw").await.unwrap();
    assert_eq!(stats.changed, 0);
    assert_eq!(
        device.store().get(EntityKind::Booking, "b1").await.unwrap(),
        Some(Record::Booking(confirmed))
    );
}

#[tokio::test]
async fn restore_brings_media_bytes_and_local_flags() {
    let laptop = engine("laptop");
    let host = Identity::generate();
    let mut hana = User::new("hana", 5);
    hana.public_key = Some(host.public_key_hex());
    hana.verified = true;
    laptop.put_local(Record::User(hana)).await.unwrap();

    let photo = b"balcony at sunset".to_vec();
    let id = laptop.store().put_blob(photo.clone()).await.unwrap();
    laptop
        .put_local(Record::Media(MediaObject {
            id: id.clone(),
            listing_id: Some("l1".into()),
            mime_type: "image/jpeg".into(),
            size: photo.len() as u64,
            created: 6,
        }))
        .await
        .unwrap();

    let message = |id: &str| Message {
        id: id.into(),
        from: "omar".into(),
        to: "hana".into(),
        body: "Can we check in early?".into(),
        message_type: "text".into(),
        ref_id: None,
        unread: false,
        created: 7,
    };
    laptop
        .store()
        .apply_remote(
            vec![Record::Message(message("m1")), Record::Message(message("m2"))],
            None,
        )
        .await
        .unwrap();
    laptop.mark_read("m1").await.unwrap();

    let sealed = laptop.export_encrypted(b"river house").await.unwrap();

    let phone = engine("phone");
    let stats = phone.import_encrypted(&sealed, b"river house").await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.media, 1);
    assert_eq!(phone.store().get_blob(id).await.unwrap(), photo);

    let unread = phone
        .store()
        .with_db(|db| Ok(db.list_unread("hana")?))
        .await
        .unwrap();
    let unread: Vec<_> = unread.into_iter().map(|m| m.id).collect();
    assert_eq!(unread, vec!["m2".to_string()]);

    match phone.store().get(EntityKind::User, "hana").await.unwrap() {
        Some(Record::User(u)) => assert!(u.verified),
        other => panic!("expected user, got {other:?}"),
    }
}
