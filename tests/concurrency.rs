use std::sync::Arc;
use std::time::Duration;
use teseo::{Config, Error, Teseo};
use test_log::test;

fn small_db() -> teseo::Result<Teseo> {
    Config::new()
        .segment_size(64)
        .num_segments_per_leaf(4)
        .async_num_threads(2)
        .async_delay(Duration::from_millis(10))
        .merger_interval(Duration::from_millis(50))
        .gc_interval(Duration::from_millis(20))
        .open()
}

#[test]
fn parallel_disjoint_writers() -> teseo::Result<()> {
    let db = Arc::new(small_db()?);
    let num_threads = 4u64;
    let per_thread = 100u64;

    let mut handles = Vec::new();
    for thread_id in 0..num_threads {
        let db = db.clone();
        handles.push(std::thread::spawn(move || -> teseo::Result<()> {
            for i in 0..per_thread {
                let tx = db.begin();
                tx.insert_vertex(thread_id * per_thread + i)?;
                tx.commit()?;
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    let tx = db.begin();
    assert_eq!(num_threads * per_thread, tx.num_vertices());
    for v in 0..num_threads * per_thread {
        assert!(tx.has_vertex(v)?, "vertex {v} is missing");
    }

    Ok(())
}

#[test]
fn contended_vertex_single_winner() -> teseo::Result<()> {
    let db = Arc::new(small_db()?);
    let num_threads = 8;

    let mut handles = Vec::new();
    for _ in 0..num_threads {
        let db = db.clone();
        handles.push(std::thread::spawn(move || -> teseo::Result<bool> {
            let tx = db.begin();
            match tx.insert_vertex(42) {
                Ok(()) => {
                    tx.commit()?;
                    Ok(true)
                }
                Err(Error::TransactionConflict | Error::VertexAlreadyExists(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.join().expect("writer thread panicked")? {
            winners += 1;
        }
    }

    // exactly one insertion took effect
    assert!(winners >= 1);
    let tx = db.begin();
    assert!(tx.has_vertex(42)?);
    assert_eq!(1, tx.num_vertices());

    Ok(())
}

#[test]
fn readers_run_against_writers() -> teseo::Result<()> {
    let db = Arc::new(small_db()?);

    {
        let tx = db.begin();
        for v in 0..50 {
            tx.insert_vertex(v)?;
        }
        tx.commit()?;
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer = {
        let db = db.clone();
        let stop = stop.clone();
        std::thread::spawn(move || -> teseo::Result<()> {
            let mut v = 50;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let tx = db.begin();
                tx.insert_vertex(v)?;
                tx.commit()?;
                v += 1;
            }
            Ok(())
        })
    };

    // concurrent readers always observe a consistent prefix
    for _ in 0..200 {
        let tx = db.begin_read_only();
        let count = tx.num_vertices();
        assert!(count >= 50);
        for v in 0..50 {
            assert!(tx.has_vertex(v)?);
        }
        drop(tx);
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().expect("writer thread panicked")?;

    Ok(())
}

#[test]
fn snapshot_stability_under_churn() -> teseo::Result<()> {
    let db = Arc::new(small_db()?);

    {
        let tx = db.begin();
        for v in 0..20 {
            tx.insert_vertex(v)?;
        }
        for d in 1..20 {
            tx.insert_edge(0, d, d as f64)?;
        }
        tx.commit()?;
    }

    // pin a snapshot, then churn the graph underneath it
    let pinned = db.begin_read_only();

    {
        let tx = db.begin();
        for v in 5..15 {
            tx.remove_vertex(v)?;
        }
        tx.commit()?;
    }

    assert_eq!(20, pinned.num_vertices());
    assert_eq!(19, pinned.num_edges());
    assert_eq!(19, pinned.degree(0)?);
    for v in 0..20 {
        assert!(pinned.has_vertex(v)?);
    }
    for d in 1..20 {
        assert_eq!(d as f64, pinned.get_weight(0, d)?);
    }

    drop(pinned);

    let tx = db.begin();
    assert_eq!(10, tx.num_vertices());
    assert_eq!(9, tx.degree(0)?);

    Ok(())
}
