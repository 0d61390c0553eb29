use enclave_core::encryption::{decode_chat, decrypt_group_event};
use enclave_core::mls::{self, Incoming, NewGroup};
use enclave_core::Enclave;
use enclave_proto::{builder, kind};
use enclave_store::AccessControlConfig;
use tempfile::TempDir;

fn enclave() -> (Enclave, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (enclave, created) = Enclave::init(dir.path()).unwrap();
    assert!(created);
    (enclave, dir)
}

fn test_group() -> NewGroup {
    NewGroup {
        name: "Test Group".into(),
        description: "integration".into(),
        relays: vec!["wss://relay.one".into(), "wss://relay.two".into()],
        admins: vec![],
    }
}

/// Alice creates a group and brings Bob in. Returns the group id.
fn alice_invites_bob(alice: &Enclave, bob: &Enclave) -> String {
    let kp = bob.publish_key_package(&[], false).unwrap();
    let record = alice.create_group(test_group()).unwrap();
    let invitation = alice.invite(&record.mls_group_id, &kp.event).unwrap();
    bob.accept_welcome(&invitation.welcome).unwrap();
    record.mls_group_id
}

#[test]
fn init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (first, created) = Enclave::init(dir.path()).unwrap();
    assert!(created);
    let public = first.public();
    drop(first);
    let (second, created) = Enclave::init(dir.path()).unwrap();
    assert!(!created);
    assert_eq!(second.public(), public);
    assert_eq!(second.access().owner(), Some(public));
}

#[test]
fn open_requires_init() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Enclave::open(dir.path()).is_err());
    Enclave::init(dir.path()).unwrap();
    assert!(Enclave::open(dir.path()).is_ok());
}

#[test]
fn open_rejects_ownerless_policy() {
    let (enclave, dir) = enclave();
    enclave
        .store()
        .save_access_control(&AccessControlConfig::default())
        .unwrap();
    assert!(Enclave::open(dir.path()).is_err());
}

#[test]
fn create_group_persists_and_allows() {
    let (alice, _dir) = enclave();
    let record = alice.create_group(test_group()).unwrap();
    assert_eq!(record.epoch, 0);
    assert_eq!(record.member_count, 1);
    assert_eq!(record.name, "Test Group");
    assert_eq!(record.relays.len(), 2);
    assert_eq!(record.admins, vec![alice.public()]);
    assert_ne!(record.mls_group_id, record.transport_id);
    assert!(alice.access().is_group_allowed(&record.mls_group_id));
    assert_eq!(alice.groups().unwrap(), vec![record]);
}

#[test]
fn invite_produces_commit_and_wrapped_welcome() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let kp = bob.publish_key_package(&["wss://relay.one".into()], false).unwrap();
    let record = alice.create_group(test_group()).unwrap();

    let invitation = alice.invite(&record.mls_group_id, &kp.event).unwrap();
    assert_eq!(invitation.epoch, 1);
    assert_eq!(invitation.invitee, bob.public());
    assert_eq!(invitation.commit.kind, kind::GROUP_MESSAGE);
    assert_eq!(invitation.commit.tag_values("h"), vec![record.transport_id.as_str()]);
    assert_ne!(invitation.commit.pubkey, alice.public());

    // gift wrap reveals only the recipient
    assert_eq!(invitation.welcome.kind, kind::GIFT_WRAP);
    assert_ne!(invitation.welcome.pubkey, alice.public());
    assert_eq!(
        invitation.welcome.tag_value("p"),
        Some(bob.public().to_hex().as_str())
    );

    let stored = alice.store().load_group(&record.mls_group_id).unwrap().unwrap();
    assert_eq!(stored.epoch, 1);
    assert_eq!(stored.member_count, 2);
    assert!(alice
        .store()
        .is_processed(&record.mls_group_id, &invitation.commit.id)
        .unwrap());
}

#[test]
fn accept_welcome_joins_and_consumes_key_package() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let group_id = alice_invites_bob(&alice, &bob);

    let joined = bob.store().load_group(&group_id).unwrap().unwrap();
    let created = alice.store().load_group(&group_id).unwrap().unwrap();
    assert_eq!(joined.epoch, 1);
    assert_eq!(joined.transport_id, created.transport_id);
    assert_eq!(joined.name, "Test Group");
    assert_eq!(joined.admins, vec![alice.public()]);
    assert!(bob.access().is_group_allowed(&group_id));
}

#[test]
fn last_key_package_is_replaced_on_join() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let kp = bob.publish_key_package(&[], false).unwrap();
    let record = alice.create_group(test_group()).unwrap();
    let invitation = alice.invite(&record.mls_group_id, &kp.event).unwrap();
    let joined = bob.accept_welcome(&invitation.welcome).unwrap();

    let replacement = joined.replacement.expect("replacement key package");
    assert_ne!(replacement.reference, kp.reference);
    assert_eq!(replacement.event.kind, kind::KEY_PACKAGE);
    assert_eq!(replacement.event.pubkey, bob.public());
    let remaining = bob.store().list_key_packages().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].reference, replacement.reference);
    assert!(bob.store().load_key_package(&kp.reference).unwrap().is_none());
}

#[test]
fn no_replacement_while_key_packages_remain() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let used = bob.publish_key_package(&[], false).unwrap();
    let spare = bob.publish_key_package(&[], false).unwrap();
    let record = alice.create_group(test_group()).unwrap();
    let invitation = alice.invite(&record.mls_group_id, &used.event).unwrap();
    let joined = bob.accept_welcome(&invitation.welcome).unwrap();

    assert!(joined.replacement.is_none());
    let remaining = bob.store().list_key_packages().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].reference, spare.reference);
}

#[test]
fn welcome_for_someone_else_is_rejected() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let (carol, _c) = enclave();
    let kp = bob.publish_key_package(&[], false).unwrap();
    let record = alice.create_group(test_group()).unwrap();
    let invitation = alice.invite(&record.mls_group_id, &kp.event).unwrap();
    assert!(carol.accept_welcome(&invitation.welcome).is_err());
}

#[test]
fn key_package_from_wrong_publisher_rejected() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let (carol, _c) = enclave();
    let kp = bob.publish_key_package(&[], false).unwrap();
    // carol republishes bob's key package under her own key
    let forged = builder::key_package(carol.identity(), &kp.event.content, &[]).unwrap();
    let record = alice.create_group(test_group()).unwrap();
    assert!(alice.invite(&record.mls_group_id, &forged).is_err());
    let stored = alice.store().load_group(&record.mls_group_id).unwrap().unwrap();
    assert_eq!(stored.epoch, 0);
}

#[test]
fn sent_message_decrypts_for_member() {
    let (alice, _a) = enclave();
    let (bob, _b) = enclave();
    let group_id = alice_invites_bob(&alice, &bob);

    let sent = alice
        .send_message(&group_id, "hello bob", vec![vec!["e".into(), "root".into()]])
        .unwrap();
    assert_eq!(alice.messages(&group_id).unwrap(), vec![sent.message.clone()]);
    assert!(alice.store().is_processed(&group_id, &sent.event.id).unwrap());

    let bob_state = bob.store().load_group_state(&group_id).unwrap();
    let secret = mls::derive_epoch_secret(&bob_state).unwrap();
    let mls_bytes = decrypt_group_event(&secret, &sent.event.content).unwrap();
    let processed = mls::process_incoming_message(&bob_state, &mls_bytes).unwrap();
    match processed.result {
        Incoming::Application { sender, plaintext } => {
            assert_eq!(sender, alice.public());
            let rumor = decode_chat(&plaintext).unwrap();
            assert_eq!(rumor.content, "hello bob");
            assert_eq!(rumor.id, sent.message.id);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn single_member_send_leaves_state_untouched() {
    let (alice, _a) = enclave();
    let record = alice.create_group(test_group()).unwrap();
    let before = alice.store().load_group_state(&record.mls_group_id).unwrap();
    assert!(alice.send_message(&record.mls_group_id, "alone", vec![]).is_err());
    let after = alice.store().load_group_state(&record.mls_group_id).unwrap();
    assert_eq!(*before, *after);
    assert!(alice.messages(&record.mls_group_id).unwrap().is_empty());
}

#[test]
fn unknown_group_is_error() {
    let (alice, _a) = enclave();
    assert!(alice.messages("00ff").is_err());
    assert!(alice.send_message("00ff", "x", vec![]).is_err());
}
