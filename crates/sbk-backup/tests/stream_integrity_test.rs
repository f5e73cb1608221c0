//! Tampering, truncation and the importer's per-frame recovery branches.

mod common;

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{frame_offsets, Device};
use sbk_backup::{inspect, BackupFrame, FrameReader, FrameWriter};
use sbk_core::{BackupError, KeyValueValue, PreferenceValue, SqlParameter};
use sbk_crypto::BackupKey;
use sbk_store::{KeyValueStore, PreferenceStore};

const PART_SCHEMA: &str = "CREATE TABLE part (_id INTEGER PRIMARY KEY, mid INTEGER, unique_id INTEGER, data_size INTEGER, _data TEXT, data_random BLOB, content_type TEXT)";

fn key() -> BackupKey {
    BackupKey::from_bytes([0x24; 32])
}

fn writer() -> FrameWriter<Vec<u8>> {
    FrameWriter::with_key(Vec::new(), &key(), &[0x11; 32], [0x01, 0x02, 0x03, 0x04, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9])
        .unwrap()
}

fn statement(text: &str, parameters: Vec<SqlParameter>) -> BackupFrame {
    BackupFrame::SqlStatement {
        text: text.into(),
        parameters,
    }
}

fn part_row(id: i64, unique_id: i64, size: usize) -> BackupFrame {
    statement(
        "INSERT INTO part VALUES (?,?,?,?,?,?,?)",
        vec![
            SqlParameter::Integer(id),
            SqlParameter::Integer(1),
            SqlParameter::Integer(unique_id),
            SqlParameter::Integer(size as i64),
            SqlParameter::String("/elsewhere/part.mms".into()),
            SqlParameter::Blob(vec![0; 32]),
            SqlParameter::String("image/png".into()),
        ],
    )
}

fn import(target: &mut Device, bytes: Vec<u8>) -> Result<sbk_backup::ImportSummary, BackupError> {
    let reader = FrameReader::open_with_key(Cursor::new(bytes), &key())?;
    target.importer().import_stream(reader)
}

#[test]
fn any_flipped_frame_byte_fails_authentication() {
    let source = Device::messenger(4);
    source.exec("INSERT INTO sms VALUES (1, 'hello', 0);");
    let bytes = source.export_bytes();

    let mut target = Device::new(4);
    target.exec("CREATE TABLE keep (x); INSERT INTO keep VALUES (1);");

    // the version frame and the first schema statement
    for (start, len) in frame_offsets(&bytes, 2) {
        for i in start..start + len {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x40;
            let err = target.import_bytes(&tampered).unwrap_err();
            assert!(
                matches!(err, BackupError::FrameAuthentication),
                "byte {i}: {err}"
            );
        }
    }

    assert_eq!(target.rows("SELECT x FROM keep"), vec![vec![SqlParameter::Integer(1)]]);
    assert!(target.import_bytes(&bytes).is_ok());
}

#[test]
fn truncated_stream_leaves_target_untouched() {
    let source = Device::messenger(4);
    source.exec("INSERT INTO sms VALUES (1, 'hello', 0);");
    let bytes = source.export_bytes();

    let mut target = Device::new(4);
    target.exec("CREATE TABLE keep (x); INSERT INTO keep VALUES (1);");
    target
        .kv
        .put("settings.theme", &KeyValueValue::String("light".into()))
        .unwrap();

    let err = target.import_bytes(&bytes[..bytes.len() - 5]).unwrap_err();
    assert!(matches!(err, BackupError::Io(_)));
    assert!(!err.is_recoverable());
    assert_eq!(target.rows("SELECT x FROM keep").len(), 1);
    assert_eq!(
        target.kv.get("settings.theme").unwrap(),
        Some(KeyValueValue::String("light".into()))
    );
}

#[test]
fn bad_payload_mac_drops_only_that_attachment() {
    let good: Vec<u8> = (0..9000u32).map(|i| i as u8).collect();
    let mut w = writer();
    w.write_frame(&BackupFrame::DatabaseVersion(1)).unwrap();
    w.write_frame(&statement(PART_SCHEMA, vec![])).unwrap();
    w.write_frame(&part_row(1, 101, 64)).unwrap();
    let bad_frame_at = w.get_ref().len();
    w.write_attachment(1, 101, Cursor::new(vec![3u8; 64]), 64).unwrap();
    w.write_frame(&part_row(2, 102, good.len())).unwrap();
    w.write_attachment(2, 102, Cursor::new(&good), good.len() as u64)
        .unwrap();
    w.write_frame(&BackupFrame::End).unwrap();
    let mut bytes = w.finish().unwrap();

    let frame_len =
        u32::from_be_bytes(bytes[bad_frame_at..bad_frame_at + 4].try_into().unwrap()) as usize;
    let payload_at = bad_frame_at + 4 + frame_len;
    bytes[payload_at + 7] ^= 0xFF;

    let mut target = Device::new(1);
    let summary = import(&mut target, bytes).unwrap();
    assert_eq!(summary.bad_payloads, 1);
    assert_eq!(summary.attachments, 1);

    let rows = target.rows("SELECT _id, _data, data_random FROM part ORDER BY _id");
    assert_eq!(rows.len(), 2);
    assert!(rows[0][1].is_null());
    assert!(rows[0][2].is_null());
    assert_eq!(target.attachment_bytes(2).unwrap(), good);

    let files = std::fs::read_dir(target.blobs.attachments_dir()).unwrap().count();
    assert_eq!(files, 1);
}

#[test]
fn bad_sticker_mac_clears_file_reference() {
    let mut w = writer();
    w.write_frame(&BackupFrame::DatabaseVersion(1)).unwrap();
    w.write_frame(&statement(
        "CREATE TABLE sticker (_id INTEGER PRIMARY KEY, pack_id TEXT, file_path TEXT, file_length INTEGER, file_random BLOB)",
        vec![],
    ))
    .unwrap();
    w.write_frame(&statement(
        "INSERT INTO sticker VALUES (?,?,?,?,?)",
        vec![
            SqlParameter::Integer(5),
            SqlParameter::String("pack".into()),
            SqlParameter::String("/elsewhere".into()),
            SqlParameter::Integer(16),
            SqlParameter::Blob(vec![1; 32]),
        ],
    ))
    .unwrap();
    let at = w.get_ref().len();
    w.write_sticker(5, Cursor::new(vec![8u8; 16]), 16).unwrap();
    w.write_frame(&BackupFrame::End).unwrap();
    let mut bytes = w.finish().unwrap();
    // last byte of the sticker tag
    let frame_len = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
    bytes[at + 4 + frame_len + 16 + 9] ^= 0x01;

    let mut target = Device::new(1);
    let summary = import(&mut target, bytes).unwrap();
    assert_eq!(summary.bad_payloads, 1);
    let rows = target.rows("SELECT file_path, file_length, file_random FROM sticker");
    assert!(rows[0][0].is_null());
    assert_eq!(rows[0][1], SqlParameter::Integer(16));
    assert!(rows[0][2].is_null());
}

#[test]
fn legacy_identity_preferences_move_to_key_value_store() {
    let legacy = "SecureSMS-Preferences";
    let pref = |file: &str, key: &str, value: &str| BackupFrame::SharedPreference {
        file: file.into(),
        key: key.into(),
        value: Some(PreferenceValue::String(value.into())),
    };

    let mut w = writer();
    w.write_frame(&BackupFrame::DatabaseVersion(1)).unwrap();
    w.write_frame(&pref(legacy, "pref_identity_public_v3", &BASE64.encode([1u8, 2, 3])))
        .unwrap();
    w.write_frame(&pref(legacy, "pref_identity_private_v3", &BASE64.encode([4u8, 5])))
        .unwrap();
    w.write_frame(&pref(legacy, "pref_theme", "dark")).unwrap();
    w.write_frame(&pref("app_preferences", "pref_language", "de"))
        .unwrap();
    w.write_frame(&BackupFrame::SharedPreference {
        file: "app_preferences".into(),
        key: "pref_unset".into(),
        value: None,
    })
    .unwrap();
    w.write_frame(&BackupFrame::KeyValue {
        key: "empty".into(),
        value: None,
    })
    .unwrap();
    w.write_frame(&BackupFrame::KeyValue {
        key: "settings.font".into(),
        value: Some(KeyValueValue::Float(1.5)),
    })
    .unwrap();
    w.write_frame(&BackupFrame::End).unwrap();

    let mut target = Device::new(1);
    let summary = import(&mut target, w.finish().unwrap()).unwrap();
    assert_eq!(summary.key_values, 3);
    assert_eq!(summary.preferences, 1);

    assert_eq!(
        target.kv.get("account.aci_identity_public_key").unwrap(),
        Some(KeyValueValue::Blob(vec![1, 2, 3]))
    );
    assert_eq!(
        target.kv.get("account.aci_identity_private_key").unwrap(),
        Some(KeyValueValue::Blob(vec![4, 5]))
    );
    assert_eq!(
        target.kv.get("settings.font").unwrap(),
        Some(KeyValueValue::Float(1.5))
    );
    assert!(target.kv.get("empty").unwrap().is_none());
    assert!(target.prefs.get(legacy, "pref_theme").is_none());
    assert!(target.prefs.get("app_preferences", "pref_unset").is_none());
    assert_eq!(
        target.prefs.get("app_preferences", "pref_language"),
        Some(&PreferenceValue::String("de".into()))
    );
}

#[test]
fn avatar_without_recipient_clears_legacy_column_and_keeps_stream_aligned() {
    let mut w = writer();
    w.write_frame(&BackupFrame::DatabaseVersion(1)).unwrap();
    w.write_frame(&statement(
        "CREATE TABLE recipient (_id INTEGER PRIMARY KEY, phone TEXT, signal_profile_avatar TEXT)",
        vec![],
    ))
    .unwrap();
    w.write_frame(&statement(
        "INSERT INTO recipient VALUES (1, '+15550100', 'old-ref'), (2, '+15550199', 'other-ref')",
        vec![],
    ))
    .unwrap();
    w.write_frame(&BackupFrame::Avatar {
        name: Some("+15550100".into()),
        recipient_id: None,
        length: 6,
    })
    .unwrap();
    w.write_payload(Cursor::new(b"legacy".to_vec()), 6).unwrap();
    w.write_avatar("../escape", Cursor::new(b"nope".to_vec()), 4)
        .unwrap();
    w.write_avatar("2", Cursor::new(b"fresh".to_vec()), 5).unwrap();
    w.write_frame(&BackupFrame::End).unwrap();

    let mut target = Device::new(1);
    let summary = import(&mut target, w.finish().unwrap()).unwrap();
    assert_eq!(summary.avatars, 1);

    let rows = target.rows("SELECT signal_profile_avatar FROM recipient ORDER BY _id");
    assert!(rows[0][0].is_null());
    assert_eq!(rows[1][0], SqlParameter::String("other-ref".into()));

    let avatars = target.blobs.avatars().unwrap();
    assert_eq!(avatars.len(), 1);
    assert_eq!(avatars[0].recipient_id, "2");
    assert_eq!(avatars[0].length, 5);
}

#[test]
fn unknown_frames_are_skipped() {
    use prost::Message;
    use sbk_backup::proto;

    // an empty wire frame sealed with the session keys, as a newer writer might emit
    let mut w = writer();
    w.write_frame(&BackupFrame::DatabaseVersion(1)).unwrap();
    let mut bytes = w.finish().unwrap();

    let mut session = sbk_crypto::CipherSession::new(
        sbk_crypto::derive_session_keys(&key()).unwrap(),
        [0x01, 0x02, 0x03, 0x04, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9],
    );
    // skip the counter value the version frame used
    session.seal_frame(&[]).unwrap();
    for frame in [
        proto::BackupFrame::default(),
        BackupFrame::End.to_proto(),
    ] {
        let body = session.seal_frame(&frame.encode_to_vec()).unwrap();
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&body);
    }

    let mut target = Device::new(1);
    let summary = import(&mut target, bytes).unwrap();
    assert_eq!(summary.frames, 1);
}

#[test]
fn inspect_counts_frames_without_a_store() {
    let mut source = Device::messenger(6);
    source.exec("INSERT INTO sms VALUES (1, 'a', 0), (2, 'b', 0);");
    source.add_avatar("3", b"img");
    source
        .kv
        .put("settings.theme", &KeyValueValue::String("dark".into()))
        .unwrap();
    let bytes = source.export_bytes();

    let reader = FrameReader::open(Cursor::new(&bytes), &common::passphrase(), &common::kdf())
        .unwrap();
    let report = inspect(reader).unwrap();
    assert_eq!(report.database_version, Some(6));
    assert_eq!(report.frames.get("version"), Some(&1));
    assert_eq!(report.frames.get("avatar"), Some(&1));
    assert_eq!(report.frames.get("key_value"), Some(&1));
    assert_eq!(report.frames.get("end"), Some(&1));
    assert_eq!(report.payload_bytes, 3);
    assert!(report.tables.contains(&"sms".to_string()));
    assert!(report.tables.contains(&"part".to_string()));
}

fn avatar_bytes(device: &Device, recipient_id: &str) -> Vec<u8> {
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut device.blobs.open_avatar(recipient_id).unwrap(), &mut out)
        .unwrap();
    out
}

#[test]
fn failed_import_keeps_existing_avatar() {
    let source = Device::messenger(4);
    source.add_avatar("1", b"avatar from backup");
    let bytes = source.export_bytes();

    let mut target = Device::messenger(4);
    target.add_avatar("1", b"my local avatar");

    let err = target.import_bytes(&bytes[..bytes.len() - 5]).unwrap_err();
    assert!(matches!(err, BackupError::Io(_)));
    assert_eq!(avatar_bytes(&target, "1"), b"my local avatar");
    let staged = std::fs::read_dir(target.blobs.staging_dir()).unwrap().count();
    assert_eq!(staged, 0);

    target.import_bytes(&bytes).unwrap();
    assert_eq!(avatar_bytes(&target, "1"), b"avatar from backup");
    assert_eq!(target.blobs.avatars().unwrap().len(), 1);
}
