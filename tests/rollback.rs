use teseo::{Config, Error};
use test_log::test;

#[test]
fn rollback_reverts_everything() -> teseo::Result<()> {
    // small segments, so the workload spans several of them
    let db = Config::new()
        .segment_size(64)
        .num_segments_per_leaf(4)
        .open()?;

    let tx = db.begin();
    for v in 0..20 {
        tx.insert_vertex(v)?;
    }
    for d in 1..20 {
        tx.insert_edge(0, d, d as f64)?;
    }
    tx.rollback()?;

    let tx = db.begin();
    assert_eq!(0, tx.num_vertices());
    assert_eq!(0, tx.num_edges());
    for v in 0..20 {
        assert!(!tx.has_vertex(v)?, "vertex {v} survived the rollback");
    }
    for d in 1..20 {
        assert!(!tx.has_edge(0, d)?);
        assert!(!tx.has_edge(d, 0)?);
    }

    Ok(())
}

#[test]
fn rollback_of_removal_restores_the_edges() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    for v in 0..5 {
        t1.insert_vertex(v)?;
    }
    for d in 1..5 {
        t1.insert_edge(0, d, d as f64)?;
    }
    t1.commit()?;

    let t2 = db.begin();
    assert_eq!(4, t2.remove_vertex(0)?);
    assert!(!t2.has_vertex(0)?);
    t2.rollback()?;

    let t3 = db.begin();
    assert!(t3.has_vertex(0)?);
    assert_eq!(4, t3.degree(0)?);
    for d in 1..5 {
        assert_eq!(d as f64, t3.get_weight(0, d)?);
        assert_eq!(d as f64, t3.get_weight(d, 0)?);
    }
    assert_eq!(5, t3.num_vertices());
    assert_eq!(4, t3.num_edges());

    Ok(())
}

#[test]
fn failed_undirected_insert_leaves_no_leg_behind() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(1)?;
    t1.commit()?;

    // vertex 2 does not exist: the second leg fails, the first is reverted
    let t2 = db.begin();
    assert_eq!(
        Err(Error::VertexDoesNotExist(2)),
        t2.insert_edge(1, 2, 1.0)
    );

    // the transaction remains usable and sees no residue
    assert!(!t2.has_edge(1, 2)?);
    t2.insert_vertex(2)?;
    t2.insert_edge(1, 2, 1.0)?;
    t2.commit()?;

    let t3 = db.begin();
    assert_eq!(1.0, t3.get_weight(1, 2)?);

    Ok(())
}

#[test]
fn remove_vertex_conflict_rolls_back_partially() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    for v in 0..3 {
        t1.insert_vertex(v)?;
    }
    t1.insert_edge(0, 1, 1.0)?;
    t1.insert_edge(0, 2, 2.0)?;
    t1.commit()?;

    // t2 holds the edge (2, 0) through a pending removal
    let t2 = db.begin();
    t2.remove_edge(2, 0)?;

    // t3's vertex removal trips over t2's lock during the fix-up and must
    // revert cleanly
    let t3 = db.begin();
    assert_eq!(Err(Error::TransactionConflict), t3.remove_vertex(0));
    assert!(t3.has_vertex(0)?);
    assert_eq!(2, t3.degree(0)?);

    t2.rollback()?;
    drop(t3);

    // with the conflict gone the removal succeeds
    let t4 = db.begin();
    assert_eq!(2, t4.remove_vertex(0)?);
    t4.commit()?;

    let t5 = db.begin();
    assert!(!t5.has_vertex(0)?);
    assert!(t5.has_vertex(1)?);
    assert!(!t5.has_edge(1, 0)?);

    Ok(())
}

#[test]
fn interleaved_commits_and_rollbacks() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    tx.insert_vertex(1)?;
    tx.commit()?;

    let tx = db.begin();
    tx.rollback()?;

    let tx = db.begin();
    tx.insert_vertex(2)?;
    tx.commit()?;

    let tx = db.begin();
    assert!(tx.has_vertex(2)?);
    assert!(!tx.has_vertex(3)?);

    Ok(())
}
