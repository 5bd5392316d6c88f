//! End-to-end tests against directory stores.

use alopex_tracks::presence::{Presence, PresenceEvent};
use alopex_tracks::store::TraceFile;
use alopex_tracks::{Backend, DirBackend, Registry, Store, TraceError, WriterConfig};
use std::fs;
use tempfile::TempDir;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_stateful::<Presence>();
    registry
}

#[test]
fn test_presence_roundtrip_through_directory() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
        let mut writer = store
            .create_stateful_writer::<Presence>("lobby", WriterConfig::default())
            .unwrap();
        for (time, line) in [(0, "A,in"), (5, "A,x"), (12, "A,out")] {
            let event: PresenceEvent = line.parse().unwrap();
            writer.append(time, &event).unwrap();
        }
        writer.close().unwrap();
        store.close();
    }

    let dir = temp_dir.path().join("lobby");
    for file in ["info", "trace", "index"] {
        assert!(dir.join(file).is_file(), "missing {file}");
    }

    let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
    let meta = store.meta("lobby").unwrap();
    assert_eq!(meta.time_bounds(), Some((0, 12)));
    assert_eq!(meta.trace_type.as_deref(), Some("presence"));
    assert_eq!(meta.default_priority, Some(10));
    assert_eq!(meta.max_update_interval, Some(7));

    let mut reader = store.open_stateful_reader::<Presence>("lobby").unwrap();
    reader.seek(5).unwrap();
    assert_eq!(reader.state(), vec!["A".to_string()]);
    reader.seek(13).unwrap();
    assert!(reader.state().is_empty());
    reader.seek(12).unwrap();
    assert_eq!(reader.state(), vec!["A".to_string()]);
    assert!(matches!(
        reader.seek(-1),
        Err(TraceError::SeekBeforeStart { time: -1, start: 0 })
    ));
}

#[test]
fn test_discovery_skips_unreadable_traces() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
        let mut writer = store
            .create_stateful_writer::<Presence>("ok", WriterConfig::default())
            .unwrap();
        writer.append(1, &PresenceEvent::join("B")).unwrap();
        writer.close().unwrap();
    }
    // A directory without metadata and one with garbage metadata.
    fs::create_dir_all(temp_dir.path().join("empty")).unwrap();
    let broken = temp_dir.path().join("broken");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("info"), b"this line has no separator\n").unwrap();

    let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
    assert_eq!(store.names(), vec!["ok".to_string()]);
    assert!(store.open_stateful_reader::<Presence>("broken").unwrap_err().is_not_found());
}

#[test]
fn test_corrupt_trace_surfaces_on_read() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
    let mut writer = store
        .create_stateful_writer::<Presence>("t", WriterConfig::default())
        .unwrap();
    writer.append(1, &PresenceEvent::join("C")).unwrap();
    writer.append(2, &PresenceEvent::leave("C")).unwrap();
    writer.close().unwrap();

    // Cut the last block short.
    let backend = DirBackend::new(temp_dir.path()).unwrap();
    let path = backend.trace_dir("t").join(TraceFile::Trace.file_name());
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
    assert!(backend.exists("t").unwrap());

    let mut reader = store.open_stateful_reader::<Presence>("t").unwrap();
    let err = reader.seek(3).unwrap_err();
    assert!(err.is_corrupt(), "{err:?}");
}

#[test]
fn test_replacing_a_trace_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open_dir(temp_dir.path(), registry()).unwrap();
    let write = |events: &[(i64, &str)]| {
        let mut writer = store
            .create_stateful_writer::<Presence>("hall", WriterConfig::default())
            .unwrap();
        for (time, id) in events {
            writer.append(*time, &PresenceEvent::join(*id)).unwrap();
        }
        writer
    };

    write(&[(1, "A")]).close().unwrap();
    // Abandoned replacement: the published trace is untouched.
    drop(write(&[(2, "B")]));
    assert!(!temp_dir.path().join("hall.staging").exists());
    let mut reader = store.open_stateful_reader::<Presence>("hall").unwrap();
    reader.seek(5).unwrap();
    assert_eq!(reader.state(), vec!["A".to_string()]);
    drop(reader);

    write(&[(3, "C")]).close().unwrap();
    assert_eq!(store.meta("hall").unwrap().time_bounds(), Some((3, 3)));
    let mut reader = store.open_stateful_reader::<Presence>("hall").unwrap();
    reader.seek(5).unwrap();
    assert_eq!(reader.state(), vec!["C".to_string()]);
}
