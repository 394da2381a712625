//! Readers hold the snapshot they started with, whatever the writer does.

use burrowdb::Database;

#[test]
fn reader_keeps_its_snapshot_across_a_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("snap.db"))
        .initial_mmap_size(16 << 20)
        .open()
        .unwrap();

    db.update(|tx| {
        tx.create_bucket(b"b")?.put(b"k", b"v1")?;
        Ok(())
    })
    .unwrap();

    let reader = db.begin(false).unwrap();
    let reader_txid = reader.id();
    assert_eq!(reader.bucket(b"b").unwrap().get(b"k").unwrap(), Some(&b"v1"[..]));

    // The writer commits while the reader is live.
    db.update(|tx| {
        tx.bucket_mut(b"b")?.put(b"k", b"v2")?;
        tx.bucket_mut(b"b")?.put(b"extra", b"later")?;
        Ok(())
    })
    .unwrap();

    // Same snapshot: old value, no new key, same txid.
    assert_eq!(reader.id(), reader_txid);
    let bucket = reader.bucket(b"b").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(&b"v1"[..]));
    assert_eq!(bucket.get(b"extra").unwrap(), None);
    drop(reader);

    // A fresh reader sees the new state.
    db.view(|tx| {
        let bucket = tx.bucket(b"b")?;
        assert_eq!(bucket.get(b"k")?, Some(&b"v2"[..]));
        assert_eq!(bucket.get(b"extra")?, Some(&b"later"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn snapshot_survives_deletes_and_bucket_drops() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("snap-del.db"))
        .initial_mmap_size(16 << 20)
        .open()
        .unwrap();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"doomed")?;
        for i in 0..200u32 {
            bucket.put(format!("k{i:03}").as_bytes(), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let reader = db.begin(false).unwrap();

    db.update(|tx| tx.delete_bucket(b"doomed")).unwrap();

    // The reader's tree is intact even though its pages are pending.
    let bucket = reader.bucket(b"doomed").unwrap();
    assert_eq!(bucket.get(b"k000").unwrap(), Some(&0u32.to_le_bytes()[..]));
    assert_eq!(bucket.get(b"k199").unwrap(), Some(&199u32.to_le_bytes()[..]));
    let mut count = 0;
    bucket
        .for_each(|_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(count, 200);
    drop(reader);

    db.view(|tx| {
        assert!(tx.bucket(b"doomed").is_err());
        Ok(())
    })
    .unwrap();
}

#[test]
fn concurrent_reader_and_writer_threads() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("threads.db"))
        .initial_mmap_size(16 << 20)
        .open()
        .unwrap();

    db.update(|tx| {
        tx.create_bucket(b"counts")?.put(b"value", &0u64.to_le_bytes())?;
        Ok(())
    })
    .unwrap();

    std::thread::scope(|scope| {
        let reader = db.begin(false).unwrap();
        let before = u64::from_le_bytes(
            reader
                .bucket(b"counts")
                .unwrap()
                .get(b"value")
                .unwrap()
                .unwrap()
                .try_into()
                .unwrap(),
        );

        let writer = scope.spawn(|| {
            for i in 1..=10u64 {
                db.update(|tx| {
                    tx.bucket_mut(b"counts")?.put(b"value", &i.to_le_bytes())?;
                    Ok(())
                })
                .unwrap();
            }
        });
        writer.join().unwrap();

        // Ten commits later the live reader still sees its snapshot.
        let after = u64::from_le_bytes(
            reader
                .bucket(b"counts")
                .unwrap()
                .get(b"value")
                .unwrap()
                .unwrap()
                .try_into()
                .unwrap(),
        );
        assert_eq!(before, after);
        drop(reader);
    });

    db.view(|tx| {
        assert_eq!(
            tx.bucket(b"counts")?.get(b"value")?,
            Some(&10u64.to_le_bytes()[..])
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn many_parallel_readers() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("parallel.db"))
        .initial_mmap_size(16 << 20)
        .open()
        .unwrap();

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"shared")?;
        for i in 0..100u32 {
            bucket.put(format!("k{i:03}").as_bytes(), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..20 {
                    db.view(|tx| {
                        let bucket = tx.bucket(b"shared")?;
                        assert_eq!(bucket.get(b"k050")?, Some(&50u32.to_le_bytes()[..]));
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });
}
