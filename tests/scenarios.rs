//! End-to-end scenarios exercising the page buffer, tick coordinator,
//! metadata-file codec, and reader-side VFD together, the way a caller
//! sitting above the core actually would.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions as StdOpenOptions;
use std::io::{Seek, SeekFrom, Write as IoWrite};
use std::path::Path;
use std::time::Duration;

use tempdir::TempDir;

use tickstore_core::cache_shim::CacheShim;
use tickstore_core::container::{FileVfd, MemType};
use tickstore_core::metafile::checksum::fletcher32;
use tickstore_core::metafile::header::{Header, HEADER_SIZE};
use tickstore_core::metafile::index::{self, IndexRecord};
use tickstore_core::metafile::{RetryLimits, SwmrReaderVfd};
use tickstore_core::pagebuffer::PageBufferConfig;
use tickstore_core::retry::Clock;
use tickstore_core::tick::TickCoordinator;
use tickstore_core::{AccessMode, OpenOptions, PageBuffer};

fn swmr_config(max_pages: usize, max_lag: u64) -> PageBufferConfig {
    PageBufferConfig {
        max_pages,
        min_md_pages: 0,
        min_rd_pages: 0,
        page_size: 4096,
        vfd_swmr_writer: true,
        max_lag,
    }
}

fn write_metafile(path: &Path, tick: u64, records: &[IndexRecord], reserved_pages: u64) {
    let index_offset = HEADER_SIZE as u64;
    let index_bytes = index::encode(tick, records);
    let header = Header {
        fs_page_size: 4096,
        tick_num: tick,
        index_offset,
        index_length: index_bytes.len() as u64,
    };

    let mut f = StdOpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .unwrap();
    f.set_len(reserved_pages * 4096).unwrap();
    f.seek(SeekFrom::Start(index_offset)).unwrap();
    f.write_all(&index_bytes).unwrap();
    f.flush().unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(&header.encode()).unwrap();
    f.flush().unwrap();
}

fn write_md_page(path: &Path, md_page: u32, bytes: &[u8]) {
    let mut f = StdOpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(md_page as u64 * 4096)).unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
}

#[test]
fn tiny_create_is_readable_after_close_and_reopen() {
    let dir = TempDir::new("scenario1").unwrap();
    let container_path = dir.path().join("container.db");
    let md_path = dir.path().join("meta.db");

    let create_opts = OpenOptions::new()
        .access(AccessMode::RDWR)
        .page_size(4096)
        .page_buffer_size(4096 * 8)
        .min_meta_pct(50)
        .min_raw_pct(25)
        .md_file_path(&md_path);

    {
        let mut handle = create_opts.create(&container_path).unwrap();
        let (container, shim) = handle.as_writer().unwrap();
        shim.write(container, MemType::Metadata, 1024, b"0123456789")
            .unwrap();
        assert_eq!(shim.page_buffer().curr_pages(), 1);

        shim.close(container).unwrap();
        assert_eq!(shim.page_buffer().curr_pages(), 0);
    }

    let container_len = std::fs::metadata(&container_path).unwrap().len();
    assert!(container_len >= 4096);

    let reopen_opts = OpenOptions::new()
        .access(AccessMode::RDONLY.union(AccessMode::SWMR_READ))
        .page_size(4096)
        .md_file_path(&md_path);
    let mut handle = reopen_opts.open(&container_path).unwrap();
    let reader = handle.as_reader().unwrap();
    let bytes = reader.read(MemType::Metadata, 1024, 10).unwrap();
    assert_eq!(bytes, b"0123456789");
}

#[test]
fn swmr_publish_then_delayed_overwrite_observes_old_then_new_bytes() {
    let dir = TempDir::new("scenario23").unwrap();
    let container_path = dir.path().join("container.db");
    let md_path = dir.path().join("meta.db");

    let mut container = FileVfd::open(&container_path).unwrap();
    let mut shim = CacheShim::new(swmr_config(16, 3), &md_path, 4).unwrap();

    let original = vec![0xABu8; 4096];
    shim.write(&mut container, MemType::Metadata, 8192, &original)
        .unwrap();
    shim.run_tick(&mut container).unwrap();
    assert_eq!(shim.cur_tick(), 1);

    // Reader opens right after tick 1 publishes.
    let reader_container = FileVfd::open(&container_path).unwrap();
    let mut reader = SwmrReaderVfd::open(reader_container, &md_path, 4096, 4).unwrap();
    reader.mark_page_buffer_configured();
    assert_eq!(reader.local_tick(), 1);

    let bytes = reader.read(MemType::Metadata, 8192, 4096).unwrap();
    assert_eq!(bytes, original);

    // Writer overwrites the same page at tick 2; the page was already
    // published once, so the new bytes are held back for max_lag ticks.
    let updated = vec![0xCDu8; 4096];
    shim.write(&mut container, MemType::Metadata, 8192, &updated)
        .unwrap();
    shim.run_tick(&mut container).unwrap();
    assert_eq!(shim.cur_tick(), 2);

    // The reader hasn't reloaded: it still sees the old bytes, whether or
    // not it bothers to reload against the unchanged header.
    let bytes = reader.read(MemType::Metadata, 8192, 4096).unwrap();
    assert_eq!(bytes, original);

    // Ticks 3 and 4 are still within the delay window (delay_until = 1 + 3 = 4).
    shim.run_tick(&mut container).unwrap();
    shim.run_tick(&mut container).unwrap();
    assert_eq!(shim.cur_tick(), 4);
    reader.reload().unwrap();
    let bytes = reader.read(MemType::Metadata, 8192, 4096).unwrap();
    assert_eq!(bytes, original);

    // Tick 5: the delay has lapsed and the new bytes are published.
    shim.run_tick(&mut container).unwrap();
    assert_eq!(shim.cur_tick(), 5);
    reader.reload().unwrap();
    assert_eq!(reader.local_tick(), 5);
    let bytes = reader.read(MemType::Metadata, 8192, 4096).unwrap();
    assert_eq!(bytes, updated);
}

#[test]
fn mpmde_speculative_read_clips_before_reload_then_reads_whole_after() {
    let dir = TempDir::new("scenario4").unwrap();
    let container_path = dir.path().join("container.db");
    let md_path = dir.path().join("meta.db");

    let mut container = FileVfd::open(&container_path).unwrap();
    let mut shim = CacheShim::new(swmr_config(16, 3), &md_path, 4).unwrap();

    let mpmde_bytes: Vec<u8> = (0..12288u32).map(|i| (i % 251) as u8).collect();
    shim.write(&mut container, MemType::Metadata, 16384, &mpmde_bytes)
        .unwrap();
    shim.run_tick(&mut container).unwrap();
    assert_eq!(shim.cur_tick(), 1);

    let reader_container = FileVfd::open(&container_path).unwrap();
    let mut reader = SwmrReaderVfd::open(reader_container, &md_path, 4096, 4).unwrap();

    // Before the reader is backed by a page buffer, a page-aligned read
    // smaller than the record clips to the bytes actually requested.
    let clipped = reader.read(MemType::Metadata, 16384, 4096).unwrap();
    assert_eq!(clipped, mpmde_bytes[..4096]);

    reader.reload().unwrap();
    let full = reader.read(MemType::Metadata, 16384, 12288).unwrap();
    assert_eq!(full, mpmde_bytes);
}

#[test]
fn free_and_reuse_does_not_publish_the_stale_image() {
    let dir = TempDir::new("scenario5").unwrap();
    let mut container = FileVfd::open(dir.path().join("container.db")).unwrap();
    let mut pb = PageBuffer::new(swmr_config(16, 3)).unwrap();
    let mut coord = TickCoordinator::create(dir.path().join("meta.db"), 4096, 4).unwrap();

    for _ in 0..3 {
        coord.run_tick(&mut pb, &mut container).unwrap();
    }
    assert_eq!(coord.cur_tick(), 3);

    // All three of these happen before the next tick runs: dirty, free,
    // then reallocate the same address clean.
    pb.write(&mut container, MemType::Metadata, 32768, b"stale")
        .unwrap();
    assert_eq!(pb.tick_list_snapshot().len(), 1);

    pb.remove_entry(32768).unwrap();
    assert_eq!(pb.tick_list_snapshot().len(), 0);
    assert!(!pb.page_exists(32768));

    pb.add_new_page(&mut container, MemType::Metadata, 32768)
        .unwrap();
    assert!(pb.page_exists(32768));
    assert_eq!(pb.tick_list_snapshot().len(), 0);

    coord.run_tick(&mut pb, &mut container).unwrap();
    assert_eq!(coord.cur_tick(), 4);
    assert!(coord.index().find(8).is_none());
}

/// A [`Clock`] whose `sleep` does not actually wait — it deterministically
/// advances a scripted writer instead, letting a retry-budget test control
/// exactly when (and whether) the racing write lands.
struct ScriptedWriterClock {
    md_path: std::path::PathBuf,
    pending: RefCell<Option<(u64, Vec<IndexRecord>)>>,
    fired: Cell<bool>,
}

impl Clock for ScriptedWriterClock {
    fn sleep(&self, _delay: Duration) {
        self.fired.set(true);
        if let Some((tick, records)) = self.pending.borrow_mut().take() {
            write_metafile(&self.md_path, tick, &records, 4);
        }
    }
}

#[test]
fn checksum_race_reader_retries_through_a_torn_index_then_succeeds() {
    let dir = TempDir::new("scenario6a").unwrap();
    let container_path = dir.path().join("container.db");
    let md_path = dir.path().join("meta.db");

    FileVfd::open(&container_path).unwrap();
    write_metafile(&md_path, 0, &[], 4);

    let page_bytes = vec![5u8; 4096];
    let checksum = fletcher32(&page_bytes);
    let record = IndexRecord {
        container_page: 0,
        md_page: 4,
        length: 4096,
        checksum,
    };
    write_md_page(&md_path, 4, &page_bytes);

    let mut reader = SwmrReaderVfd::open(FileVfd::open(&container_path).unwrap(), &md_path, 4096, 4)
        .unwrap();
    assert_eq!(reader.local_tick(), 0);

    // The header is bumped to tick 1 — already sized for the record the
    // writer means to publish — while the index bytes underneath it are
    // still the old, empty tick-0 content: a writer caught mid-publish.
    // The reader's first attempt decodes that stale content fine (it's
    // internally consistent, just stale) and sees the mismatch between
    // the header's tick and the index's own embedded tick, so it must
    // retry rather than give up immediately.
    let final_index_len = index::encode(1, std::slice::from_ref(&record)).len() as u64;
    {
        let mut f = StdOpenOptions::new().write(true).open(&md_path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(
            &Header {
                fs_page_size: 4096,
                tick_num: 1,
                index_offset: HEADER_SIZE as u64,
                index_length: final_index_len,
            }
            .encode(),
        )
        .unwrap();
        f.flush().unwrap();
    }

    let clock = ScriptedWriterClock {
        md_path: md_path.clone(),
        pending: RefCell::new(Some((1, vec![record]))),
        fired: Cell::new(false),
    };
    reader = reader.with_retry_limits(RetryLimits {
        header: 10,
        index: 10,
        page: 10,
    });
    reader = reader.with_clock(Box::new(clock));

    reader.reload().unwrap();
    assert_eq!(reader.local_tick(), 1);

    reader.mark_page_buffer_configured();
    let bytes = reader.read(MemType::Metadata, 0, 4096).unwrap();
    assert_eq!(bytes, page_bytes);
}

#[test]
fn checksum_race_reader_gives_up_once_its_retry_budget_is_exhausted() {
    let dir = TempDir::new("scenario6b").unwrap();
    let container_path = dir.path().join("container.db");
    let md_path = dir.path().join("meta.db");

    FileVfd::open(&container_path).unwrap();
    write_metafile(&md_path, 0, &[], 4);

    let mut reader = SwmrReaderVfd::open(FileVfd::open(&container_path).unwrap(), &md_path, 4096, 4)
        .unwrap();
    assert_eq!(reader.local_tick(), 0);

    // Same torn state as the success case, but the index is never
    // actually repaired — the writer's pause outlasts the retry budget.
    let mut f = StdOpenOptions::new().write(true).open(&md_path).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(
        &Header {
            fs_page_size: 4096,
            tick_num: 1,
            index_offset: HEADER_SIZE as u64,
            index_length: index::encode(0, &[]).len() as u64,
        }
        .encode(),
    )
    .unwrap();
    f.flush().unwrap();
    drop(f);

    reader = reader.with_retry_limits(RetryLimits {
        header: 10,
        index: 2,
        page: 10,
    });

    let result = reader.reload();
    assert!(matches!(
        result,
        Err(tickstore_core::CoreError::ChecksumMismatch {
            what: "index",
            ..
        })
    ));
}
