use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::block::{BLOCK_HEADER_LEN, DIRECT_IO_ALIGN};
use super::index::Task;
use super::RecordService;
use crate::config::Config;
use crate::player::Player;
use crate::rtp::record::deserialize_from_record;
use crate::rtp::{RtpKind, RtpPack};
use crate::testing::TestPusher;

fn record_config(dir: &tempfile::TempDir) -> Arc<Config> {
    let mut config = Config::default();
    config.record.storage_paths = vec![dir.path().to_string_lossy().into_owned()];
    // Small blocks fill fast; tmpfs in CI rarely supports O_DIRECT.
    config.record.block_size = DIRECT_IO_ALIGN;
    config.record.direct_io = false;
    Arc::new(config)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn video_pack(seq: u16, payload_len: usize) -> Arc<RtpPack> {
    let mut raw = vec![0x80, 96];
    raw.extend_from_slice(&seq.to_be_bytes());
    raw.extend_from_slice(&(u32::from(seq) * 3600).to_be_bytes());
    raw.extend_from_slice(&0x11223344u32.to_be_bytes());
    raw.resize(12 + payload_len, 0x41);
    Arc::new(RtpPack::video(Bytes::from(raw)))
}

#[tokio::test]
async fn recorder_packs_blocks_and_indexes_them() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = record_config(&dir);
    let service = RecordService::start(Arc::clone(&config)).await.expect("service");

    let pusher = TestPusher::new("src", "/live/cam1");
    let task = Task {
        id: "T1".to_owned(),
        play_path: "/live/cam1".to_owned(),
    };
    service.db().add_task(task.clone());
    let (execute, recorder) = service
        .new_recorder(&task, pusher)
        .await
        .expect("recorder");
    assert_eq!(execute.id, 1);

    let handle = tokio::spawn(Arc::clone(&recorder).start());

    // More than one block worth of packets.
    for seq in 0..12u16 {
        recorder.queue_rtp(video_pack(seq, 500));
    }

    let db = Arc::clone(service.db());
    wait_for("first block in index", || {
        db.get_block(&task.id, execute.id, 1).is_ok()
    })
    .await;

    let meta = db.get_block(&task.id, execute.id, 1).expect("block meta");
    assert!(meta.path.exists());
    let bytes = std::fs::read(&meta.path).expect("block file");
    assert_eq!(bytes.len(), config.record.block_size);

    // Length prefix covers the header and never exceeds the block.
    let used = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    assert!(used > BLOCK_HEADER_LEN);
    assert!(used <= config.record.block_size);
    // Reserved header bytes stay zero.
    assert!(bytes[4..BLOCK_HEADER_LEN].iter().all(|b| *b == 0));

    // The payload is a run of intact record frames.
    let mut payload = &bytes[BLOCK_HEADER_LEN..used];
    let mut frames = 0usize;
    let mut last_seq = None;
    while !payload.is_empty() {
        let (pack, consumed) = deserialize_from_record(payload).expect("frame");
        assert_eq!(pack.kind, RtpKind::Video);
        let seq = u16::from_be_bytes([pack.buffer[2], pack.buffer[3]]);
        if let Some(last) = last_seq {
            assert_eq!(seq, last + 1);
        }
        last_seq = Some(seq);
        payload = &payload[consumed..];
        frames += 1;
    }
    assert!(frames > 0);

    // The execution end time advanced with the block.
    let loaded = db.get_execute(&task.id, execute.id).expect("execute");
    assert!(loaded.end_time >= loaded.start_time);

    // Stop flushes the partial tail block.
    recorder.stop().await;
    handle.await.expect("recorder loop");
    let db2 = Arc::clone(service.db());
    let task_id = task.id.clone();
    wait_for("tail block in index", move || {
        db2.get_block(&task_id, execute.id, 2).is_ok()
    })
    .await;

    // Time-index lookup resolves the first block at or after its start.
    let by_time = db
        .get_block_by_time(&task.id, execute.id, meta.start_time)
        .expect("by time");
    assert_eq!(by_time.id, 1);

    // And the written block reads back in full.
    let data = service.storage().read_block(&meta).await.expect("read back");
    assert_eq!(&data[..used], &bytes[..used]);
}

#[tokio::test]
async fn record_service_fails_without_writable_storage() {
    let mut config = Config::default();
    config.record.storage_paths = vec!["/definitely/not/a/real/path".to_owned()];
    assert!(RecordService::start(Arc::new(config)).await.is_err());
}
