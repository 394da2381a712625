//! Bucket operations: puts, gets, deletes, limits, nesting, inline
//! promotion, and a randomized check against a reference map.

use std::collections::BTreeMap;

use burrowdb::error::kind_of;
use burrowdb::{Database, Error, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn scratch_db(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(name)).unwrap();
    (dir, db)
}

#[test]
fn two_hundred_entries_survive_commit() {
    let (_dir, db) = scratch_db("200.db");

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        for i in 0..200 {
            bucket.put(format!("k{i}").as_bytes(), format!("value{i}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"b")?;
        assert_eq!(bucket.get(b"k0")?, Some(&b"value0"[..]));
        assert_eq!(bucket.get(b"k199")?, Some(&b"value199"[..]));
        assert_eq!(bucket.get(b"k200")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn key_and_value_limits() {
    let (_dir, db) = scratch_db("limits.db");

    let err = db
        .update(|tx| tx.create_bucket_if_not_exists(b"l")?.put(b"", b"v"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::KeyRequired));

    let long_key = vec![b'k'; MAX_KEY_SIZE + 1];
    let err = db
        .update(|tx| tx.create_bucket_if_not_exists(b"l")?.put(&long_key, b"v"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::KeyTooLarge));

    // Largest legal key is fine.
    db.update(|tx| {
        tx.create_bucket_if_not_exists(b"l")?
            .put(&vec![b'k'; MAX_KEY_SIZE], b"v")
    })
    .unwrap();

    let huge = vec![0u8; MAX_VALUE_SIZE + 1];
    let err = db
        .update(|tx| tx.create_bucket_if_not_exists(b"l")?.put(b"k", &huge))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::ValueTooLarge));
}

#[test]
fn bucket_name_and_key_conflicts() {
    let (_dir, db) = scratch_db("conflicts.db");

    db.update(|tx| {
        let mut root = tx.create_bucket(b"root")?;
        root.put(b"plain", b"1")?;
        root.create_bucket(b"nested")?;
        Ok(())
    })
    .unwrap();

    // Creating an existing bucket.
    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.create_bucket(b"nested").map(|_| ()))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketExists));

    // create_bucket_if_not_exists tolerates it.
    db.update(|tx| {
        tx.bucket_mut(b"root")?
            .create_bucket_if_not_exists(b"nested")
            .map(|_| ())
    })
    .unwrap();

    // A bucket name cannot shadow a plain key and vice versa.
    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.create_bucket(b"plain").map(|_| ()))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketNameConflict));
    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.put(b"nested", b"v"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketNameConflict));
    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.delete(b"nested"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketNameConflict));

    // Lookups distinguish the kinds too.
    db.view(|tx| {
        let root = tx.bucket(b"root")?;
        let err = root.bucket(b"plain").unwrap_err();
        assert_eq!(kind_of(&err), Some(&Error::BucketNameConflict));
        let err = root.bucket(b"absent").unwrap_err();
        assert_eq!(kind_of(&err), Some(&Error::BucketNotFound));
        // A bucket marker never comes back through get().
        assert_eq!(root.get(b"nested")?, None);
        Ok(())
    })
    .unwrap();

    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.delete_bucket(b"plain"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketNameConflict));
    let err = db
        .update(|tx| tx.bucket_mut(b"root")?.delete(b"missing"))
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::NotFound));
}

#[test]
fn writes_are_visible_within_their_own_transaction() {
    let (_dir, db) = scratch_db("self-vis.db");

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        bucket.put(b"x", b"1")?;
        assert_eq!(bucket.get(b"x")?, Some(&b"1"[..]));

        bucket.put(b"x", b"2")?;
        assert_eq!(bucket.get(b"x")?, Some(&b"2"[..]));

        bucket.delete(b"x")?;
        assert_eq!(bucket.get(b"x")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn failed_update_rolls_back() {
    let (_dir, db) = scratch_db("rollback.db");

    db.update(|tx| {
        tx.create_bucket(b"b")?.put(b"keep", b"1")?;
        Ok(())
    })
    .unwrap();

    let err = db
        .update(|tx| {
            tx.bucket_mut(b"b")?.put(b"dropme", b"2")?;
            eyre::bail!("caller changed its mind")
        })
        .unwrap_err();
    assert!(err.to_string().contains("changed its mind"));

    db.view(|tx| {
        let bucket = tx.bucket(b"b")?;
        assert_eq!(bucket.get(b"keep")?, Some(&b"1"[..]));
        assert_eq!(bucket.get(b"dropme")?, None);
        Ok(())
    })
    .unwrap();

    // Dropping an uncommitted transaction rolls back too.
    {
        let mut tx = db.begin(true).unwrap();
        tx.bucket_mut(b"b").unwrap().put(b"dropme", b"3").unwrap();
    }
    db.view(|tx| {
        assert_eq!(tx.bucket(b"b")?.get(b"dropme")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn read_transactions_refuse_mutation() {
    let (_dir, db) = scratch_db("ro-tx.db");
    db.update(|tx| tx.create_bucket(b"b").map(|_| ())).unwrap();

    let mut tx = db.begin(false).unwrap();
    let err = tx.bucket_mut(b"b").unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::TxNotWritable));
    let err = tx.create_bucket(b"c").map(|_| ()).unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::TxNotWritable));
    tx.rollback().unwrap();
}

#[test]
fn nested_buckets_nest_recursively() {
    let (_dir, db) = scratch_db("nested.db");

    db.update(|tx| {
        let mut a = tx.create_bucket(b"a")?;
        let mut b = a.create_bucket(b"b")?;
        let mut c = b.create_bucket(b"c")?;
        c.put(b"deep", b"value")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let c = tx.bucket(b"a")?.bucket(b"b")?.bucket(b"c")?;
        assert_eq!(c.get(b"deep")?, Some(&b"value"[..]));
        Ok(())
    })
    .unwrap();

    // for_each over the top level sees exactly one bucket.
    db.view(|tx| {
        let mut names = Vec::new();
        tx.for_each(|name, _bucket| {
            names.push(name.to_vec());
            Ok(())
        })?;
        assert_eq!(names, vec![b"a".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_reclaims_whole_subtree() {
    let (_dir, db) = scratch_db("delete-bucket.db");

    db.update(|tx| {
        let mut outer = tx.create_bucket(b"outer")?;
        for i in 0..300u32 {
            outer.put(format!("k{i:03}").as_bytes(), &[0u8; 64])?;
        }
        let mut inner = outer.create_bucket(b"inner")?;
        inner.put(b"x", b"y")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| tx.delete_bucket(b"outer")).unwrap();

    db.view(|tx| {
        let err = tx.bucket(b"outer").unwrap_err();
        assert_eq!(kind_of(&err), Some(&Error::BucketNotFound));
        Ok(())
    })
    .unwrap();

    let err = db.update(|tx| tx.delete_bucket(b"outer")).unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::BucketNotFound));

    // The freed pages become reusable once no reader needs them.
    db.update(|tx| tx.create_bucket(b"fresh").map(|_| ())).unwrap();
    assert!(db.stats().free_page_count + db.stats().pending_page_count > 0);
}

#[test]
fn small_buckets_stay_inline_until_they_grow() {
    let (_dir, db) = scratch_db("inline.db");

    db.update(|tx| {
        let mut parent = tx.create_bucket(b"parent")?;
        let mut small = parent.create_bucket(b"small")?;
        small.put(b"a", b"1")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let stats = tx.bucket(b"parent")?.bucket(b"small")?.stats()?;
        assert!(stats.inline);
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.depth, 1);
        Ok(())
    })
    .unwrap();

    // Quarter-page threshold at 4 KiB pages: ~1 KiB of content promotes.
    db.update(|tx| {
        let mut parent = tx.bucket_mut(b"parent")?;
        let mut small = parent.bucket_mut(b"small")?;
        for i in 0..40u32 {
            small.put(format!("grow-{i:02}").as_bytes(), &[7u8; 48])?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let small = tx.bucket(b"parent")?.bucket(b"small")?;
        let stats = small.stats()?;
        assert!(!stats.inline);
        assert_eq!(stats.key_count, 41);
        assert_eq!(small.get(b"a")?, Some(&b"1"[..]));
        assert_eq!(small.get(b"grow-39")?, Some(&[7u8; 48][..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn random_ops_match_reference_model() {
    let (_dir, db) = scratch_db("model.db");
    let mut rng = StdRng::seed_from_u64(0xB0B0_CAFE);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    db.update(|tx| tx.create_bucket(b"m").map(|_| ())).unwrap();

    for _round in 0..20 {
        let mut ops: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for _ in 0..200 {
            let key = format!("k{:03}", rng.gen_range(0..400)).into_bytes();
            if rng.gen_bool(0.7) {
                let value = vec![rng.gen::<u8>(); rng.gen_range(0..64)];
                ops.push((key, Some(value)));
            } else {
                ops.push((key, None));
            }
        }

        for (key, value) in &ops {
            match value {
                Some(v) => {
                    model.insert(key.clone(), v.clone());
                }
                None => {
                    model.remove(key);
                }
            }
        }

        db.update(|tx| {
            let mut bucket = tx.bucket_mut(b"m")?;
            for (key, value) in &ops {
                match value {
                    Some(v) => bucket.put(key, v)?,
                    None => match bucket.delete(key) {
                        Ok(()) => {}
                        Err(e) if kind_of(&e) == Some(&Error::NotFound) => {}
                        Err(e) => return Err(e),
                    },
                }
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket(b"m")?;
            // Every model pair is present with the right value.
            for (key, value) in &model {
                assert_eq!(bucket.get(key)?, Some(value.as_slice()));
            }
            // And the full scan yields nothing beyond the model.
            let mut count = 0usize;
            bucket.for_each(|key, value| {
                let expected = model.get(key).expect("unexpected key in scan");
                assert_eq!(value, Some(expected.as_slice()));
                count += 1;
                Ok(())
            })?;
            assert_eq!(count, model.len());
            Ok(())
        })
        .unwrap();
    }

    // The whole history also survives a reopen.
    let path = db.path().to_owned();
    drop(db);
    let db = Database::open(path).unwrap();
    db.view(|tx| {
        let bucket = tx.bucket(b"m")?;
        let mut count = 0usize;
        bucket.for_each(|key, value| {
            assert_eq!(value, model.get(key).map(Vec::as_slice));
            count += 1;
            Ok(())
        })?;
        assert_eq!(count, model.len());
        Ok(())
    })
    .unwrap();
}
