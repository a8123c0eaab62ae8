use std::sync::Arc;

use tessera::common::{EngineConfig, SpaceId};
use tessera::engine::Engine;
use tessera::page::RecordPage;
use tessera::record::{FieldType, FieldValue, RecordDescriptor, RecordStatus};
use tessera::redo::recovery::encode_field_tuple;
use tessera::redo::{FileLogDevice, OpCode, PrepareOp, RedoRecord};
use tessera::storage::FileBlockDevice;

fn main() {
    env_logger::init();

    println!("Tessera - a page-oriented storage engine core");
    println!("=============================================\n");

    let config = EngineConfig::default();
    let device = Arc::new(
        FileBlockDevice::new("tessera-demo/data", config.page_size)
            .expect("Failed to create block device"),
    );
    let log_device =
        Arc::new(FileLogDevice::new("tessera-demo/log").expect("Failed to create log device"));
    let engine =
        Engine::open(config, device, log_device).expect("Failed to open engine");
    println!("Opened engine (16 KiB pages, doublewrite staging)");

    // A two-column descriptor: an integer key and a nullable payload.
    let desc = RecordDescriptor::builder()
        .key_field(FieldType::Int)
        .nullable_field(FieldType::VarBinary(255))
        .build_arc();

    let space = SpaceId::new(1);
    let page_id = engine.new_page(space).expect("Failed to allocate page");
    println!("Allocated page {}", page_id);

    {
        let mut guard = engine.write_page(page_id).expect("Failed to latch page");
        let mut page = RecordPage::new(guard.data_mut(), &desc);
        page.init(space, page_id.page_no);
    }

    // Insert a few rows through the full write path: redo record first,
    // then the page change, then the dirty mark.
    let rows: &[(u32, &[u8])] = &[
        (7, b"the quick brown fox"),
        (3, b"jumps over"),
        (11, b"the lazy dog"),
    ];
    for (key, payload) in rows {
        let key_bytes = key.to_be_bytes();
        let fields: Vec<FieldValue> = vec![Some(&key_bytes), Some(payload)];

        let lsn = engine
            .append_redo(&RedoRecord::Prepare(PrepareOp {
                opcode: OpCode::Insert,
                page_no: page_id.page_no.as_u32(),
                page_index: 0,
                key: encode_field_tuple(&fields[..1]),
                attr: encode_field_tuple(&fields),
            }))
            .expect("Failed to append redo record");

        let mut guard = engine.write_page(page_id).expect("Failed to latch page");
        let mut page = RecordPage::new(guard.data_mut(), &desc);
        let heap_no = page.insert(&fields, RecordStatus::Ordinary).expect("Insert failed");
        guard.mark_dirty(lsn);
        println!("Inserted key {} at heap ordinal {} (lsn {})", key, heap_no, lsn);
    }

    {
        let guard = engine.read_page(page_id).expect("Failed to latch page");
        let mut data = guard.data().to_vec();
        let page = RecordPage::new(&mut data, &desc);
        println!("\nPage stats:");
        println!("  - Record count: {}", page.record_count());
        println!("  - Directory slots: {}", page.dir_slot_count());
        println!("  - Free space: {} bytes", page.free_space());
        page.validate().expect("Page invariants violated");

        let probe = 3u32.to_be_bytes();
        let origin = page
            .search(&[Some(&probe)])
            .expect("Search failed")
            .expect("Key 3 missing");
        let fields = page.record_fields(origin).expect("Decode failed");
        println!(
            "  - Lookup key 3 -> {:?}",
            String::from_utf8_lossy(fields[1].as_deref().unwrap_or_default())
        );
    }

    engine.checkpoint().expect("Checkpoint failed");
    println!("\nCheckpoint complete: log flushed, pages through doublewrite.");

    engine.shutdown().expect("Shutdown failed");
    println!("Engine shut down cleanly.");
}
