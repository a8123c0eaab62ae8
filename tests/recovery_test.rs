//! Crash recovery scenarios: the doublewrite crash-point matrix and a
//! full redo replay after losing the buffer pool.

use std::sync::Arc;

use tempfile::tempdir;
use tessera::buffer::BufferPool;
use tessera::common::{EngineConfig, PageId, PageNo, SpaceId, DOUBLEWRITE_FIRST_PAGE, SYSTEM_SPACE};
use tessera::flush::repair_from_doublewrite;
use tessera::page::{checksum, layout::fil, ChecksumAlgorithm, RecordPage};
use tessera::record::{FieldType, FieldValue, RecordDescriptor, RecordStatus};
use tessera::redo::recovery::{encode_field_tuple, recover, ImageApplicator};
use tessera::redo::{FileLogDevice, LogManager, OpCode, PrepareOp, RedoRecord};
use tessera::storage::{BlockDevice, FileBlockDevice};

const PS: usize = 1024;
const ALGO: ChecksumAlgorithm = ChecksumAlgorithm::Crc32;

fn page_image(space: u32, page_no: u32, fill: u8, lsn: u64) -> Vec<u8> {
    let mut img = vec![fill; PS];
    fil::set_space_id(&mut img, SpaceId::new(space));
    fil::set_page_no(&mut img, PageNo::new(page_no));
    checksum::stamp(ALGO, &mut img, lsn);
    img
}

/// Lays out the on-disk state of a crash during a two-page doublewrite
/// batch: the staged block is always durable (the batch fsync ran), the
/// in-place writes progressed to `in_place_done`.
fn simulate_crash(
    device: &Arc<dyn BlockDevice>,
    new1: &[u8],
    new2: &[u8],
    old1: &[u8],
    old2: &[u8],
    in_place_done: usize,
) {
    device.allocate(SYSTEM_SPACE, 1 + 4).unwrap();
    device.allocate(SpaceId::new(1), 2).unwrap();

    // Previous lives of both pages.
    device.write(SpaceId::new(1), PageNo::new(0), old1).unwrap();
    device.write(SpaceId::new(1), PageNo::new(1), old2).unwrap();

    // The staged batch, durable in block 1.
    device
        .write(SYSTEM_SPACE, DOUBLEWRITE_FIRST_PAGE, new1)
        .unwrap();
    device
        .write(
            SYSTEM_SPACE,
            PageNo::new(DOUBLEWRITE_FIRST_PAGE.as_u32() + 1),
            new2,
        )
        .unwrap();

    // In-place writes up to the crash point.
    if in_place_done >= 1 {
        device.write(SpaceId::new(1), PageNo::new(0), new1).unwrap();
    }
    if in_place_done >= 2 {
        device.write(SpaceId::new(1), PageNo::new(1), new2).unwrap();
    }
}

#[test]
fn test_crash_before_any_in_place_write() {
    // Crash point (a): staged batch durable, neither page written home.
    let dir = tempdir().unwrap();
    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path(), PS).unwrap());

    let old1 = page_image(1, 0, 0x01, 100);
    let old2 = page_image(1, 1, 0x02, 100);
    let new1 = page_image(1, 0, 0xA1, 500);
    let new2 = page_image(1, 1, 0xA2, 600);
    simulate_crash(&device, &new1, &new2, &old1, &old2, 0);

    let repaired = repair_from_doublewrite(&device, PS, 2, ALGO).unwrap();
    assert_eq!(repaired.len(), 2, "both pages restore from doublewrite");

    let mut img = vec![0u8; PS];
    device.read(SpaceId::new(1), PageNo::new(0), &mut img).unwrap();
    assert_eq!(img, new1);
    device.read(SpaceId::new(1), PageNo::new(1), &mut img).unwrap();
    assert_eq!(img, new2);
}

#[test]
fn test_crash_between_in_place_writes() {
    // Crash point (b): P1 written home, P2 not. P1 keeps its in-place
    // version; P2 restores from doublewrite.
    let dir = tempdir().unwrap();
    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path(), PS).unwrap());

    let old1 = page_image(1, 0, 0x01, 100);
    let old2 = page_image(1, 1, 0x02, 100);
    let new1 = page_image(1, 0, 0xB1, 500);
    let new2 = page_image(1, 1, 0xB2, 600);
    simulate_crash(&device, &new1, &new2, &old1, &old2, 1);

    let repaired = repair_from_doublewrite(&device, PS, 2, ALGO).unwrap();
    assert_eq!(repaired, vec![PageId::new(SpaceId::new(1), PageNo::new(1))]);

    let mut img = vec![0u8; PS];
    device.read(SpaceId::new(1), PageNo::new(0), &mut img).unwrap();
    assert_eq!(img, new1);
    device.read(SpaceId::new(1), PageNo::new(1), &mut img).unwrap();
    assert_eq!(img, new2);
}

#[test]
fn test_torn_in_place_write_is_repaired() {
    // A crash mid-write leaves a torn home page; the staged copy wins.
    let dir = tempdir().unwrap();
    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path(), PS).unwrap());

    let old1 = page_image(1, 0, 0x01, 100);
    let old2 = page_image(1, 1, 0x02, 100);
    let new1 = page_image(1, 0, 0xC1, 500);
    let new2 = page_image(1, 1, 0xC2, 600);
    simulate_crash(&device, &new1, &new2, &old1, &old2, 2);

    // Tear P2 after the fact: front half new, back half stale.
    let mut torn = new2.clone();
    torn[PS / 2..].copy_from_slice(&old2[PS / 2..]);
    device.write(SpaceId::new(1), PageNo::new(1), &torn).unwrap();

    let repaired = repair_from_doublewrite(&device, PS, 2, ALGO).unwrap();
    assert_eq!(repaired, vec![PageId::new(SpaceId::new(1), PageNo::new(1))]);

    let mut img = vec![0u8; PS];
    device.read(SpaceId::new(1), PageNo::new(1), &mut img).unwrap();
    assert_eq!(img, new2);
}

fn desc() -> Arc<RecordDescriptor> {
    RecordDescriptor::builder()
        .key_field(FieldType::Int)
        .nullable_field(FieldType::VarBinary(255))
        .build_arc()
}

#[test]
fn test_redo_replay_rebuilds_lost_pages() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.page_size = PS;
    config.pool_size = 8;

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path().join("data"), PS).unwrap());
    let log_dev = Arc::new(FileLogDevice::new(dir.path().join("log")).unwrap());
    let log = Arc::new(LogManager::new(log_dev.clone()));
    let desc = desc();
    let space = SpaceId::new(1);

    // Write path: page initialized and flushed empty, then rows inserted
    // with their redo records; only the LOG is made durable.
    let keys: Vec<u32> = vec![7, 3, 11, 5];
    {
        let pool = BufferPool::new(&config, device.clone());
        let page_id = pool.new_page(space).unwrap();
        {
            let mut guard = pool.write_page(page_id).unwrap();
            let mut page = RecordPage::new(guard.data_mut(), &desc);
            page.init(space, page_id.page_no);
            // The empty initialized page is on disk before the crash,
            // with no modification LSN yet.
            let mut img = guard.data().to_vec();
            checksum::stamp(ALGO, &mut img, 0);
            device.write(space, page_id.page_no, &img).unwrap();
            device.fsync(space).unwrap();
        }

        for k in &keys {
            let key_bytes = k.to_be_bytes();
            let fields: Vec<FieldValue> = vec![Some(&key_bytes), Some(b"payload")];
            let lsn = log
                .append(&RedoRecord::Prepare(PrepareOp {
                    opcode: OpCode::Insert,
                    page_no: page_id.page_no.as_u32(),
                    page_index: 0,
                    key: encode_field_tuple(&fields[..1]),
                    attr: encode_field_tuple(&fields),
                }))
                .unwrap();

            let mut guard = pool.write_page(page_id).unwrap();
            let mut page = RecordPage::new(guard.data_mut(), &desc);
            page.insert(&fields, RecordStatus::Ordinary).unwrap();
            guard.mark_dirty(lsn);
        }
        log.flush_up_to(log.written_lsn()).unwrap();
        // The pool drops here with every row unflushed: the crash.
    }

    // Restart: a fresh pool sees the empty page; replay rebuilds it.
    let pool = BufferPool::new(&config, device.clone());
    let applicator = ImageApplicator::new(desc.clone());
    let stats = recover(&pool, log_dev, space, 1, u64::MAX, &applicator).unwrap();
    assert_eq!(stats.records_applied, keys.len());

    let page_id = PageId::new(space, PageNo::new(0));
    let mut guard = pool.write_page(page_id).unwrap();
    let page = RecordPage::new(guard.data_mut(), &desc);
    assert_eq!(page.record_count() as usize, keys.len());
    for k in &keys {
        let key_bytes = k.to_be_bytes();
        assert!(page.search(&[Some(&key_bytes)]).unwrap().is_some());
    }
    page.validate().unwrap();
}

#[test]
fn test_replay_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.page_size = PS;
    config.pool_size = 8;

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path().join("data"), PS).unwrap());
    let log_dev = Arc::new(FileLogDevice::new(dir.path().join("log")).unwrap());
    let log = Arc::new(LogManager::new(log_dev.clone()));
    let desc = desc();
    let space = SpaceId::new(1);

    device.allocate(space, 1).unwrap();
    let mut img = vec![0u8; PS];
    {
        let mut page = RecordPage::new(&mut img, &desc);
        page.init(space, PageNo::new(0));
    }
    checksum::stamp(ALGO, &mut img, 0);
    device.write(space, PageNo::new(0), &img).unwrap();

    let key_bytes = 1u32.to_be_bytes();
    let fields: Vec<FieldValue> = vec![Some(&key_bytes), None];
    log.append(&RedoRecord::Prepare(PrepareOp {
        opcode: OpCode::Insert,
        page_no: 0,
        page_index: 0,
        key: encode_field_tuple(&fields[..1]),
        attr: encode_field_tuple(&fields),
    }))
    .unwrap();
    log.flush_up_to(log.written_lsn()).unwrap();

    let pool = BufferPool::new(&config, device.clone());
    let applicator = ImageApplicator::new(desc.clone());

    let first = recover(&pool, log_dev.clone(), space, 1, u64::MAX, &applicator).unwrap();
    assert_eq!(first.records_applied, 1);

    // A second pass sees the advanced page LSN and applies nothing.
    let second = recover(&pool, log_dev, space, 1, u64::MAX, &applicator).unwrap();
    assert_eq!(second.records_applied, 0);
    assert_eq!(second.records_skipped, 1);

    let mut guard = pool.write_page(PageId::new(space, PageNo::new(0))).unwrap();
    let page = RecordPage::new(guard.data_mut(), &desc);
    assert_eq!(page.record_count(), 1);
}
