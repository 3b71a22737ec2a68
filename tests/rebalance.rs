use std::time::Duration;
use teseo::Config;
use test_log::test;

fn small_db() -> teseo::Result<teseo::Teseo> {
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
fn inserts_across_many_segments() -> teseo::Result<()> {
    let db = small_db()?;

    let tx = db.begin();
    for v in 0..500 {
        tx.insert_vertex(v)?;
    }
    tx.commit()?;

    // the workload vastly exceeds one leaf; splits must have fired
    let tx = db.begin();
    assert_eq!(500, tx.num_vertices());
    for v in 0..500 {
        assert!(tx.has_vertex(v)?, "vertex {v} lost after rebalancing");
    }
    assert!(!tx.has_vertex(500)?);

    Ok(())
}

#[test]
fn high_degree_vertex_upgrades_to_dense() -> teseo::Result<()> {
    let db = small_db()?;

    // vertex 0 accumulates far more edges than a 64-qword sparse file can
    // hold, forcing the dense-file path
    let tx = db.begin();
    for v in 0..200 {
        tx.insert_vertex(v)?;
    }
    for d in 1..200 {
        tx.insert_edge(0, d, d as f64)?;
    }
    tx.commit()?;

    let tx = db.begin();
    assert_eq!(199, tx.degree(0)?);
    for d in 1..200 {
        assert_eq!(d as f64, tx.get_weight(0, d)?);
    }

    let mut previous = 0;
    let mut count = 0;
    tx.scan(0, |_, destination, _| {
        assert!(destination > previous);
        previous = destination;
        count += 1;
        true
    })?;
    assert_eq!(199, count);

    Ok(())
}

#[test]
fn content_survives_background_churn() -> teseo::Result<()> {
    let db = small_db()?;

    for batch in 0..10u64 {
        let tx = db.begin();
        for i in 0..50 {
            tx.insert_vertex(batch * 50 + i)?;
        }
        tx.commit()?;
    }

    // let the asynchronous rebalancer and the merger do their passes
    std::thread::sleep(Duration::from_millis(300));

    let tx = db.begin();
    assert_eq!(500, tx.num_vertices());
    for v in 0..500 {
        assert!(tx.has_vertex(v)?);
    }

    Ok(())
}

#[test]
fn removals_shrink_back() -> teseo::Result<()> {
    let db = small_db()?;

    let tx = db.begin();
    for v in 0..300 {
        tx.insert_vertex(v)?;
    }
    tx.commit()?;

    let tx = db.begin();
    for v in 100..300 {
        tx.remove_vertex(v)?;
    }
    tx.commit()?;

    // give the merger a chance to prune and merge the emptied leaves
    std::thread::sleep(Duration::from_millis(300));

    let tx = db.begin();
    assert_eq!(100, tx.num_vertices());
    for v in 0..100 {
        assert!(tx.has_vertex(v)?);
    }
    for v in 100..300 {
        assert!(!tx.has_vertex(v)?);
    }

    Ok(())
}

#[test]
fn scans_cross_leaf_boundaries() -> teseo::Result<()> {
    let db = small_db()?;

    let tx = db.begin();
    tx.insert_vertex(0)?;
    for d in 1..150 {
        tx.insert_vertex(d)?;
        tx.insert_edge(0, d, d as f64)?;
    }
    tx.commit()?;

    std::thread::sleep(Duration::from_millis(200));

    let tx = db.begin();
    let mut expected = 1;
    tx.scan(0, |_, destination, weight| {
        assert_eq!(expected, destination);
        assert_eq!(expected as f64, weight);
        expected += 1;
        true
    })?;
    assert_eq!(150, expected);

    Ok(())
}
