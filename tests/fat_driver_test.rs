//! Sessions against a FAT16 card image driven through embedded-sdmmc.

use std::fs;
use std::path::Path;
use std::time::Duration;

use embedded_sdmmc::{Mode, VolumeIdx, VolumeManager};
use flight_logger::indicator::NoopIndicator;
use flight_logger::pipeline::{ChunkOutcome, LoggerSession, SessionOptions};
use flight_logger::recovery::RecoveryState;
use flight_logger::storage::{create_fat16_image, FatDriver, FixedClock, ImageDevice};
use flight_logger::StorageErrorKind;

/// Read a root-directory file back with a separate volume manager.
fn read_back(image: &Path, name: &str) -> Vec<u8> {
    let manager = VolumeManager::new(ImageDevice::open(image).unwrap(), FixedClock);
    let volume = manager.open_raw_volume(VolumeIdx(0)).unwrap();
    let root = manager.open_root_dir(volume).unwrap();
    let file = manager.open_file_in_dir(root, name, Mode::ReadOnly).unwrap();

    let len = manager.file_length(file).unwrap() as usize;
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        filled += manager.read(file, &mut out[filled..]).unwrap();
    }
    manager.close_file(file).unwrap();
    out
}

#[tokio::test]
async fn session_logs_into_fat_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    create_fat16_image(&image).unwrap();

    let mut session =
        LoggerSession::start(FatDriver::image(&image), SessionOptions::default(), NoopIndicator);
    assert_eq!(session.state(), RecoveryState::Healthy);

    let mut source: &[u8] = b"[boot] kernel up\r\n[app] telemetry online\r\n";
    session
        .run_until(&mut source, |stats| stats.idle_reads > 0)
        .await;
    session.close();

    assert_eq!(
        read_back(&image, "DATA.TXT"),
        b"[boot] kernel up\r\n[app] telemetry online\r\n"
    );
}

#[tokio::test]
async fn later_sessions_append_across_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    create_fat16_image(&image).unwrap();

    let options = SessionOptions {
        log_path: "console.log".to_string(),
        sync_interval: 1,
        ..SessionOptions::default()
    };
    for line in [&b"first flight\n"[..], &b"second flight\n"[..]] {
        let mut session = LoggerSession::start(FatDriver::image(&image), options.clone(), NoopIndicator);
        assert_eq!(
            session.process_chunk(line).await,
            ChunkOutcome::Written { synced: true }
        );
        session.close();
    }

    assert_eq!(
        read_back(&image, "CONSOLE.LOG"),
        b"first flight\nsecond flight\n"
    );
}

#[tokio::test(start_paused = true)]
async fn card_appearing_later_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");

    let mut session =
        LoggerSession::start(FatDriver::image(&image), SessionOptions::default(), NoopIndicator);
    assert_eq!(
        session
            .recovery()
            .stats()
            .last_error
            .as_ref()
            .map(|e| e.kind),
        Some(StorageErrorKind::DeviceAbsent)
    );

    // an unformatted card is recognized as present but unusable
    fs::write(&image, vec![0u8; 64 * 512]).unwrap();
    session.process_chunk(b"dropped\n").await;
    assert_eq!(session.state(), RecoveryState::Fault);
    assert_eq!(
        session
            .recovery()
            .stats()
            .last_error
            .as_ref()
            .map(|e| e.kind),
        Some(StorageErrorKind::FilesystemUnrecognized)
    );

    create_fat16_image(&image).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    session.process_chunk(b"dropped\n").await;
    assert_eq!(session.state(), RecoveryState::Healthy);

    session.process_chunk(b"kept\n").await;
    session.close();
    assert_eq!(read_back(&image, "DATA.TXT"), b"kept\n");
}
