use teseo::{Config, Error};
use test_log::test;

#[test]
fn vertex_round_trip() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(10)?;
    t1.commit()?;

    let t2 = db.begin();
    assert!(t2.has_vertex(10)?);
    assert_eq!(1, t2.num_vertices());

    let removed = t2.remove_vertex(10)?;
    assert_eq!(0, removed);
    t2.commit()?;

    let t3 = db.begin();
    assert!(!t3.has_vertex(10)?);
    assert_eq!(0, t3.num_vertices());

    Ok(())
}

#[test]
fn edge_self_error() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    tx.insert_vertex(10)?;
    tx.insert_vertex(20)?;

    assert_eq!(Err(Error::EdgeSelf(10)), tx.insert_edge(10, 10, 1.0));

    Ok(())
}

#[test]
fn write_conflict() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(10)?;

    let t2 = db.begin();
    assert_eq!(Err(Error::TransactionConflict), t2.insert_vertex(10));

    t1.rollback()?;
    t2.insert_vertex(10)?;
    t2.commit()?;

    let t3 = db.begin();
    assert!(t3.has_vertex(10)?);

    Ok(())
}

#[test]
fn snapshot_isolation() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t_old = db.begin();

    let t_new = db.begin();
    t_new.insert_vertex(10)?;
    t_new.commit()?;

    // the old snapshot predates the commit
    assert!(!t_old.has_vertex(10)?);
    assert_eq!(0, t_old.num_vertices());

    let t_next = db.begin();
    assert!(t_next.has_vertex(10)?);

    Ok(())
}

#[test]
fn missing_endpoints() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    tx.insert_vertex(10)?;

    assert_eq!(
        Err(Error::VertexDoesNotExist(20)),
        tx.insert_edge(20, 10, 1.0)
    );
    assert_eq!(
        Err(Error::VertexDoesNotExist(20)),
        tx.insert_edge(10, 20, 1.0)
    );

    assert_eq!(Err(Error::EdgeDoesNotExist(10, 20)), tx.remove_edge(10, 20));
    assert_eq!(Err(Error::EdgeDoesNotExist(10, 20)), tx.get_weight(10, 20));
    assert_eq!(Err(Error::VertexDoesNotExist(20)), tx.degree(20));

    Ok(())
}

#[test]
fn duplicate_edge() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    tx.insert_vertex(10)?;
    tx.insert_vertex(20)?;
    tx.insert_edge(10, 20, 1.0)?;

    assert_eq!(
        Err(Error::EdgeAlreadyExists(10, 20)),
        tx.insert_edge(10, 20, 2.0)
    );

    // undirected: the reverse direction exists as well
    assert_eq!(
        Err(Error::EdgeAlreadyExists(20, 10)),
        tx.insert_edge(20, 10, 2.0)
    );

    Ok(())
}

#[test]
fn undirected_stores_both_directions() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(1)?;
    t1.insert_vertex(2)?;
    t1.insert_edge(1, 2, 0.25)?;
    t1.commit()?;

    let t2 = db.begin();
    assert!(t2.has_edge(1, 2)?);
    assert!(t2.has_edge(2, 1)?);
    assert_eq!(0.25, t2.get_weight(1, 2)?);
    assert_eq!(0.25, t2.get_weight(2, 1)?);
    assert_eq!(1, t2.num_edges());

    t2.remove_edge(2, 1)?;
    assert!(!t2.has_edge(1, 2)?);
    assert!(!t2.has_edge(2, 1)?);
    assert_eq!(0, t2.num_edges());

    Ok(())
}

#[test]
fn directed_mode() -> teseo::Result<()> {
    let db = Config::new().directed(true).open()?;

    let tx = db.begin();
    tx.insert_vertex(1)?;
    tx.insert_vertex(2)?;
    tx.insert_edge(1, 2, 1.0)?;

    assert!(tx.has_edge(1, 2)?);
    assert!(!tx.has_edge(2, 1)?);
    assert_eq!(1, tx.degree(1)?);
    assert_eq!(0, tx.degree(2)?);

    Ok(())
}

#[test]
fn counters_follow_commits() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    for v in 0..5 {
        t1.insert_vertex(v)?;
    }
    t1.insert_edge(0, 1, 1.0)?;
    t1.insert_edge(0, 2, 1.0)?;

    // local changes are already reflected in the transaction's own counts
    assert_eq!(5, t1.num_vertices());
    assert_eq!(2, t1.num_edges());

    // but not in a concurrent snapshot
    let observer = db.begin_read_only();
    assert_eq!(0, observer.num_vertices());

    t1.commit()?;

    let t2 = db.begin();
    assert_eq!(5, t2.num_vertices());
    assert_eq!(2, t2.num_edges());

    let removed = t2.remove_vertex(0)?;
    assert_eq!(2, removed);
    assert_eq!(4, t2.num_vertices());
    assert_eq!(0, t2.num_edges());
    t2.commit()?;

    let t3 = db.begin();
    assert_eq!(4, t3.num_vertices());
    assert_eq!(0, t3.num_edges());

    Ok(())
}

#[test]
fn read_only_transactions_reject_writes() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin_read_only();
    assert!(matches!(tx.insert_vertex(10), Err(Error::LogicalError(_))));
    assert!(matches!(tx.remove_vertex(10), Err(Error::LogicalError(_))));
    tx.commit()?;

    Ok(())
}

#[test]
fn dropped_transaction_rolls_back() -> teseo::Result<()> {
    let db = Config::new().open()?;

    {
        let tx = db.begin();
        tx.insert_vertex(10)?;
        // dropped without commit
    }

    let tx = db.begin();
    assert!(!tx.has_vertex(10)?);
    assert_eq!(0, tx.num_vertices());

    Ok(())
}

#[test]
fn weight_updates_via_remove_insert() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(1)?;
    t1.insert_vertex(2)?;
    t1.insert_edge(1, 2, 1.0)?;
    t1.commit()?;

    let t2 = db.begin();
    t2.remove_edge(1, 2)?;
    t2.insert_edge(1, 2, 9.0)?;
    t2.commit()?;

    let t3 = db.begin();
    assert_eq!(9.0, t3.get_weight(1, 2)?);
    assert_eq!(9.0, t3.get_weight(2, 1)?);

    Ok(())
}
