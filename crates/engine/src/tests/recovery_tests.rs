use super::helpers::{abandon, open_engine, small_segment_config, test_config};
use crate::meta::Meta;
use crate::{index, Config, Engine, Error};
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::tempdir;

// --------------------- Clean reopen ---------------------

#[test]
fn reopen_after_clean_close_reads_everything() {
    let dir = tempdir().unwrap();
    let expected = format!("{:08192}", 123);

    {
        let engine = Engine::open(Config {
            sync_write: true,
            ..test_config(dir.path())
        })
        .unwrap();
        for i in 0..1000u32 {
            engine
                .put(format!("{i:016}").as_bytes(), expected.as_bytes())
                .unwrap();
        }
        engine.close().unwrap();
    }

    // a clean close leaves a trusted snapshot behind
    let meta = Meta::load(dir.path()).unwrap();
    assert!(meta.index_up_to_date);
    assert!(index::index_path(dir.path()).exists());

    let engine = open_engine(dir.path());
    for i in 0..1000u32 {
        assert_eq!(
            engine.get(format!("{i:016}").as_bytes()).unwrap(),
            expected.as_bytes()
        );
    }
    engine.close().unwrap();
}

#[test]
fn open_marks_the_snapshot_stale_on_disk() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }
    assert!(Meta::load(dir.path()).unwrap().index_up_to_date);

    let engine = open_engine(dir.path());
    // while the engine runs, a crash must not leave a trusted-but-stale
    // snapshot behind
    assert!(!Meta::load(dir.path()).unwrap().index_up_to_date);
    engine.close().unwrap();
    assert!(Meta::load(dir.path()).unwrap().index_up_to_date);
}

#[test]
fn reopen_preserves_reusable_space() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        engine.put(b"key", b"value").unwrap();
        engine.put(b"key", b"value").unwrap(); // 19 dead bytes
        engine.close().unwrap();
    }
    let engine = open_engine(dir.path());
    assert_eq!(engine.reusable_space(), 19);
}

// --------------------- Crash reopen (no close) ---------------------

#[test]
fn reopen_without_close_rebuilds_from_data_files() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(Config {
            sync_write: true,
            ..test_config(dir.path())
        })
        .unwrap();
        for i in 0..200u32 {
            engine
                .put(format!("key{i:03}").as_bytes(), format!("val{i:03}").as_bytes())
                .unwrap();
        }
        // deleted keys must stay deleted after the rebuild
        for i in (0..200u32).step_by(2) {
            engine.delete(format!("key{i:03}").as_bytes()).unwrap();
        }
        abandon(engine);
    }

    let engine = open_engine(dir.path());
    assert_eq!(engine.len(), 100);
    for i in 0..200u32 {
        let key = format!("key{i:03}");
        if i % 2 == 0 {
            assert!(matches!(engine.get(key.as_bytes()), Err(Error::KeyNotFound)));
        } else {
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                format!("val{i:03}").as_bytes()
            );
        }
    }
    engine.close().unwrap();
}

#[test]
fn reopen_without_close_rebuilds_across_segments() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(Config {
            sync_write: true,
            ..small_segment_config(dir.path(), 64)
        })
        .unwrap();
        for round in 0..4u32 {
            for i in 0..10u32 {
                engine
                    .put(format!("k{i}").as_bytes(), format!("r{round}").as_bytes())
                    .unwrap();
            }
        }
        engine.delete(b"k0").unwrap();
        assert!(engine.segment_count() > 1);
        abandon(engine);
    }

    let engine = open_engine(dir.path());
    assert!(matches!(engine.get(b"k0"), Err(Error::KeyNotFound)));
    for i in 1..10u32 {
        assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), b"r3");
    }
}

// --------------------- Tail corruption ---------------------

#[test]
fn garbage_tail_is_truncated_on_reopen() {
    let dir = tempdir().unwrap();
    let expected = format!("{:08192}", 123);
    let (clean_size, active_path);

    {
        let engine = Engine::open(Config {
            sync_write: true,
            ..test_config(dir.path())
        })
        .unwrap();
        for i in 0..1000u32 {
            engine
                .put(format!("{i:016}").as_bytes(), expected.as_bytes())
                .unwrap();
        }
        clean_size = engine.active_file_size();
        {
            let st = engine.core.state.read();
            active_path = st.files.as_ref().unwrap().active.path().to_path_buf();
        }
        engine.close().unwrap();
    }

    // scribble 32 bytes of garbage over the tail
    let mut file = OpenOptions::new().append(true).open(&active_path).unwrap();
    file.write_all(b"test string to corrupt data file").unwrap();
    drop(file);

    let engine = open_engine(dir.path());
    assert_eq!(engine.active_file_size(), clean_size);
    for i in 0..1000u32 {
        assert_eq!(
            engine.get(format!("{i:016}").as_bytes()).unwrap(),
            expected.as_bytes()
        );
    }

    // the engine keeps working normally afterwards
    for i in 1000..1100u32 {
        let key = format!("{i:016}");
        engine.put(key.as_bytes(), expected.as_bytes()).unwrap();
        assert_eq!(engine.get(key.as_bytes()).unwrap(), expected.as_bytes());
        engine.delete(key.as_bytes()).unwrap();
        assert!(matches!(engine.get(key.as_bytes()), Err(Error::KeyNotFound)));
    }
    engine.close().unwrap();
}

#[test]
fn truncation_discards_the_stale_index_snapshot() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        engine.put(b"keep", b"me").unwrap();
        engine.close().unwrap();
    }
    assert!(index::index_path(dir.path()).exists());

    // a torn half-record after the snapshot was written
    let active_path = datafile::file_path(dir.path(), 0);
    let torn = record::Record::put(b"torn".to_vec(), b"half".to_vec()).encode();
    let mut file = OpenOptions::new().append(true).open(&active_path).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    let engine = open_engine(dir.path());
    // offsets in the old snapshot survived only because truncation threw
    // the snapshot away and rebuilt
    assert!(!index::index_path(dir.path()).exists());
    assert_eq!(engine.get(b"keep").unwrap(), b"me");
    assert!(matches!(engine.get(b"torn"), Err(Error::KeyNotFound)));
}

// --------------------- Directory lock ---------------------

#[test]
fn second_open_of_a_locked_directory_fails() {
    let dir = tempdir().unwrap();
    let first = open_engine(dir.path());

    match Engine::open(test_config(dir.path())) {
        Err(Error::DirLocked) => {}
        other => panic!("expected DirLocked, got {other:?}"),
    }

    first.close().unwrap();
    let again = Engine::open(test_config(dir.path())).unwrap();
    again.close().unwrap();
}

#[test]
fn stale_lock_file_from_a_dead_process_is_harmless() {
    let dir = tempdir().unwrap();
    // the sentinel exists but nobody holds the flock
    std::fs::write(dir.path().join(crate::LOCK_FILE_NAME), b"").unwrap();

    let engine = open_engine(dir.path());
    engine.put(b"k", b"v").unwrap();
    engine.close().unwrap();
}

// --------------------- Fresh directory ---------------------

#[test]
fn fresh_directory_starts_empty_at_segment_zero() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("nested").join("undertow");
    let engine = Engine::open(test_config(&root)).unwrap();

    assert!(engine.is_empty());
    assert_eq!(engine.segment_count(), 1);
    assert_eq!(engine.active_file_size(), 0);
    assert!(datafile::file_path(&root, 0).exists());
    engine.close().unwrap();
}
