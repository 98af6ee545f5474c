//! Folder synchronizer behavior over the in-memory filesystem: admission
//! checks, initial scan, the Nagle upload window, remote-to-local
//! materialization and deferred remote deletion.

mod support;

use std::path::{Path, PathBuf};

use serde_json::json;

use mega_client::{NodeType, SyncMode, SyncState};
use mega_core::crypto::FileKey;
use mega_core::{PublicHandle, SyncError};
use support::*;

fn folder_link() -> mega_core::links::PublicLink {
    mega_core::links::PublicLink::new_folder(PublicHandle::from_raw(0x77), [5u8; 16])
}

/// Client with a folder session, a remote root and a local directory.
fn sync_harness() -> (Harness, mega_core::NodeHandle) {
    let mut h = harness();
    h.client.login_to_folder(&folder_link()).unwrap();
    h.client.scsn.set("S0AAAAAAAA");
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    h.fs.make_dir("/sync");
    (h, root)
}

fn answer_backup_put(h: &mut Harness) {
    assert!(answer_cs(h, |batch| {
        assert_eq!(batch[0]["a"], "sp");
        json!([{"id": mega_core::b64::encode(&77u64.to_le_bytes()[..6])}])
    }));
}

#[test]
fn admission_checks() {
    let (mut h, root) = sync_harness();
    let file_key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    let file = insert_file(&mut h.client, 0x10, root, "f.bin", 10, file_key);

    // A file cannot root a sync.
    assert_eq!(
        h.client
            .add_sync(PathBuf::from("/sync"), file, SyncMode::TwoWay, None)
            .unwrap_err(),
        SyncError::InvalidRemoteType
    );

    // A missing local path cannot either.
    assert_eq!(
        h.client
            .add_sync(PathBuf::from("/nope"), root, SyncMode::TwoWay, None)
            .unwrap_err(),
        SyncError::LocalPathUnavailable
    );

    let id = h
        .client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();
    assert_eq!(
        h.client.sync_state(id).unwrap().0,
        SyncState::Active,
        "empty tree finishes its initial scan immediately"
    );

    // Overlapping syncs are rejected in both directions.
    let sub = insert_folder(&mut h.client, 0x20, Some(root), NodeType::Folder, "sub");
    h.fs.make_dir("/sync2");
    assert_eq!(
        h.client
            .add_sync(PathBuf::from("/sync2"), sub, SyncMode::TwoWay, None)
            .unwrap_err(),
        SyncError::ActiveSyncAbovePath
    );
}

#[test]
fn nagle_window_defers_uploads() {
    let (mut h, root) = sync_harness();
    h.client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();

    // t=0: file appears.
    h.fs.write_file("/sync/a.txt", b"12345", 1000);
    h.client.exec();
    assert_eq!(h.client.transfer_count(), 0, "upload must wait out Nagle");

    // t=+1s: rewritten; the window restarts.
    h.client.advance_clock(10);
    h.fs.write_file("/sync/a.txt", b"1234567890", 1001);
    h.client.exec();
    h.client.advance_clock(10);
    h.client.exec();
    assert_eq!(h.client.transfer_count(), 0, "still inside the window");

    // Window passed with stable size+mtime: the PUT goes out.
    h.client.advance_clock(31);
    h.client.exec();
    assert_eq!(h.client.transfer_count(), 1);
}

#[test]
fn remote_file_materializes_locally() {
    let (mut h, root) = sync_harness();
    let key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    insert_file(&mut h.client, 0x30, root, "from-remote.bin", 4096, key);

    h.client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();

    // Syncdown queues a download for the unmatched remote file.
    assert_eq!(h.client.transfer_count(), 1);
    let id = h.client.transfer_ids()[0];
    let (_, _, size) = h.client.transfer_progress(id).unwrap();
    assert_eq!(size, 4096);
}

#[test]
fn remote_folder_materializes_locally() {
    let (mut h, root) = sync_harness();
    insert_folder(&mut h.client, 0x40, Some(root), NodeType::Folder, "docs");

    h.client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();
    h.client.exec();

    assert!(h.fs.exists("/sync/docs"), "folder created locally");
}

#[test]
fn local_deletion_queues_remote_debris() {
    let (mut h, root) = sync_harness();
    let rubbish = insert_folder(&mut h.client, 0x2, None, NodeType::Rubbish, "bin");
    let key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    // A file that exists on both sides, already in sync.
    h.fs.write_file("/sync/doc.txt", b"same-content", 500);
    let file = insert_file(&mut h.client, 0x50, root, "doc.txt", 12, key);
    {
        // Align fingerprints so the pair starts synced.
        let local_fp = mega_core::FileFingerprint::from_bytes(b"same-content", 500);
        let node = h.client.nodes.get_mut(file).unwrap();
        node.fingerprint = Some(local_fp);
        node.size = 12;
    }

    h.client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.advance_clock(40);
    h.client.exec();
    assert_eq!(h.client.transfer_count(), 0, "already in sync");

    // Local deletion: the remote counterpart must head for SyncDebris,
    // which means a day-folder PutNodes under the rubbish bin first.
    h.fs.delete("/sync/doc.txt");
    h.client.exec();

    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "p", "debris chain creation");
        assert_eq!(batch[0]["t"], rubbish.to_b64());
        json!([{"f": [
            {"h": "AAAAAAAQ", "p": rubbish.to_b64(), "t": 1, "u": me().to_b64(),
             "k": format!("{}:{}", me().to_b64(), mega_core::b64::encode(&[0u8;16]))},
            {"h": "AAAAAAAg", "p": "AAAAAAAQ", "t": 1, "u": me().to_b64(),
             "k": format!("{}:{}", me().to_b64(), mega_core::b64::encode(&[0u8;16]))},
        ]}])
    }));

    // Once the chain exists, the move command goes out.
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "m");
        assert_eq!(batch[0]["n"], file.to_b64());
        json!([0])
    }));
}

#[test]
fn volume_swap_fails_the_sync() {
    let (mut h, root) = sync_harness();
    let id = h
        .client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::TwoWay, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();
    assert_eq!(h.client.sync_state(id).unwrap().0, SyncState::Active);

    // The drive was remounted: the filesystem fingerprint changed.
    h.fs.set_fs_id(999);
    h.client.exec();
    let (state, err) = h.client.sync_state(id).unwrap();
    assert_eq!(state, SyncState::Failed);
    assert_eq!(err, SyncError::LocalFingerprintMismatch);
}

#[test]
fn monitor_backup_trips_on_remote_change() {
    let (mut h, root) = sync_harness();
    let id = h
        .client
        .add_sync(PathBuf::from("/sync"), root, SyncMode::BackupMonitor, None)
        .unwrap();
    answer_backup_put(&mut h);
    h.client.exec();
    assert_eq!(h.client.sync_state(id).unwrap().0, SyncState::Active);

    // Remote gains a file this backup never uploaded: tripwire.
    let key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    insert_file(&mut h.client, 0x60, root, "intruder.bin", 10, key);
    h.client.exec();
    let (state, err) = h.client.sync_state(id).unwrap();
    assert_eq!(state, SyncState::Failed);
    assert_eq!(err, SyncError::BackupModified);
}

#[test]
fn external_backup_writes_drive_id() {
    let (mut h, root) = sync_harness();
    h.fs.make_dir("/drive");
    h.fs.make_dir("/drive/backup");
    h.client
        .add_sync(
            PathBuf::from("/drive/backup"),
            root,
            SyncMode::BackupMirror,
            Some(PathBuf::from("/drive")),
        )
        .unwrap();
    assert!(
        h.fs.exists(Path::new("/drive/.megabackup/drive-id")),
        "drive id marker persisted on the external drive"
    );
    let marker = h.fs.read_file("/drive/.megabackup/drive-id").unwrap();
    assert_eq!(marker.len(), 8, "raw little-endian 64-bit identifier");
}
