use std::cell::Cell;
use std::rc::Rc;

use bstore::fileset::FileSet;
use bstore::freemap::FileSource;
use bstore::StoreError;
use tempfile::tempdir;

// ---------------------------------------------------------------------------
// Creation and naming
// ---------------------------------------------------------------------------

#[test]
fn files_are_created_through_the_factory() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("vocab", Box::new(|_| Some(1 << 20)));

    assert_eq!(fs.create(set, 0).unwrap(), 1 << 20);
    assert_eq!(fs.create(set, 1).unwrap(), 1 << 20);
    assert_eq!(fs.file_count(set), 2);
    assert_eq!(fs.capacity(set, 0).unwrap(), 1 << 20);
    assert!(dir.path().join("vocab.000").exists());
    assert!(dir.path().join("vocab.001").exists());
}

#[test]
fn name_uses_the_registered_stem() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("idx", Box::new(|_| Some(100)));
    assert_eq!(fs.name(set, 7), dir.path().join("idx.007"));
}

#[test]
fn a_declining_factory_means_not_found() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("idx", Box::new(|i| if i == 0 { Some(100) } else { None }));
    assert!(fs.create(set, 0).is_ok());
    assert!(matches!(fs.create(set, 1), Err(StoreError::NotFound(_))));
}

#[test]
fn two_sets_coexist_in_one_directory() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let index = fs.register("index", Box::new(|_| Some(100)));
    let temp = fs.register("temp", Box::new(|_| Some(200)));

    fs.create(index, 0).unwrap();
    fs.create(temp, 0).unwrap();
    assert!(dir.path().join("index.000").exists());
    assert!(dir.path().join("temp.000").exists());
    assert_eq!(fs.capacity(index, 0).unwrap(), 100);
    assert_eq!(fs.capacity(temp, 0).unwrap(), 200);
}

// ---------------------------------------------------------------------------
// I/O
// ---------------------------------------------------------------------------

#[test]
fn write_then_read_round_trips() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(4096)));
    fs.create(set, 0).unwrap();

    fs.write_at(set, 0, 128, b"hello block").unwrap();
    let mut buf = [0u8; 11];
    fs.read_at(set, 0, 128, &mut buf).unwrap();
    assert_eq!(&buf, b"hello block");
}

#[test]
fn io_past_capacity_is_rejected() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    fs.create(set, 0).unwrap();

    assert!(matches!(
        fs.write_at(set, 0, 60, b"too much"),
        Err(StoreError::Invalid(_))
    ));
}

// ---------------------------------------------------------------------------
// Pinning and the descriptor budget
// ---------------------------------------------------------------------------

#[test]
fn unpinned_handles_are_evicted_to_stay_in_budget() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 2).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    for i in 0..4 {
        fs.create(set, i).unwrap();
    }
    // Touch all four files with a budget of two descriptors.
    for file in 0..4u16 {
        fs.write_at(set, file, 0, &[file as u8]).unwrap();
    }
    for file in 0..4u16 {
        let mut b = [0u8; 1];
        fs.read_at(set, file, 0, &mut b).unwrap();
        assert_eq!(b[0], file as u8);
    }
}

#[test]
fn busy_when_every_handle_is_pinned() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 2).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    for i in 0..3 {
        fs.create(set, i).unwrap();
    }
    fs.pin(set, 0).unwrap();
    fs.pin(set, 1).unwrap();
    assert!(matches!(fs.pin(set, 2), Err(StoreError::Busy)));

    fs.unpin(set, 0);
    fs.pin(set, 2).unwrap();
    fs.unpin(set, 1);
    fs.unpin(set, 2);
}

#[test]
fn pinned_handles_stay_usable() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    fs.create(set, 0).unwrap();

    fs.pin(set, 0).unwrap();
    assert!(fs.handle(set, 0).is_ok());
    fs.unpin(set, 0);
}

// ---------------------------------------------------------------------------
// Unlink and reattach
// ---------------------------------------------------------------------------

#[test]
fn unlink_removes_the_backing_file() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    fs.create(set, 0).unwrap();

    fs.unlink(set, 0).unwrap();
    assert!(!dir.path().join("data.000").exists());
    assert!(matches!(fs.pin(set, 0), Err(StoreError::NotFound(_))));
}

#[test]
fn unlink_refuses_a_pinned_file() {
    let dir = tempdir().unwrap();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(64)));
    fs.create(set, 0).unwrap();
    fs.pin(set, 0).unwrap();
    assert!(matches!(fs.unlink(set, 0), Err(StoreError::Busy)));
    fs.unpin(set, 0);
}

#[test]
fn existing_files_can_be_reattached() {
    let dir = tempdir().unwrap();
    {
        let mut fs = FileSet::new(dir.path(), 8).unwrap();
        let set = fs.register("data", Box::new(|_| Some(4096)));
        fs.create(set, 0).unwrap();
        fs.write_at(set, 0, 0, b"persisted").unwrap();
    }
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register("data", Box::new(|_| Some(4096)));
    assert!(fs.exists(set, 0));
    assert!(!fs.exists(set, 1));
    assert_eq!(fs.open_existing(set, 0).unwrap(), 4096);

    let mut buf = [0u8; 9];
    fs.read_at(set, 0, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persisted");
}

// ---------------------------------------------------------------------------
// Free map growth adapter
// ---------------------------------------------------------------------------

#[test]
fn grow_source_creates_files_on_demand() {
    let dir = tempdir().unwrap();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let mut fs = FileSet::new(dir.path(), 8).unwrap();
    let set = fs.register(
        "grow",
        Box::new(move |i| {
            seen.set(seen.get() + 1);
            if i < 2 { Some(512) } else { None }
        }),
    );

    let mut source = fs.grow_source(set);
    assert_eq!(source.provide(0), Some(512));
    assert_eq!(source.provide(1), Some(512));
    assert_eq!(source.provide(2), None);
    drop(source);

    assert_eq!(calls.get(), 3);
    assert_eq!(fs.file_count(set), 2);
    assert!(dir.path().join("grow.001").exists());
}
