use teseo::{Config, Error};
use test_log::test;

#[test]
fn scan_fan_out() -> teseo::Result<()> {
    let db = Config::new().open()?;

    // vertices 10, 20, ..., 320 and the edges 10 -> {20, 30, ..., 320}
    let tx = db.begin();
    for v in (10..=320).step_by(10) {
        tx.insert_vertex(v)?;
    }
    for (i, d) in (20..=320).step_by(10).enumerate() {
        tx.insert_edge(10, d, 1000.0 + i as f64)?;
    }
    tx.commit()?;

    let tx = db.begin();
    assert_eq!(31, tx.degree(10)?);

    let mut results = Vec::new();
    tx.scan(10, |source, destination, weight| {
        assert_eq!(10, source);
        results.push((destination, weight));
        true
    })?;

    let expected = (20..=320)
        .step_by(10)
        .enumerate()
        .map(|(i, d)| (d, 1000.0 + i as f64))
        .collect::<Vec<_>>();
    assert_eq!(expected, results);

    Ok(())
}

#[test]
fn scan_is_strictly_ordered_and_exact() -> teseo::Result<()> {
    use rand::prelude::*;

    let db = Config::new().open()?;
    let mut rng = rand::rng();

    let mut destinations = (1..=64u64).collect::<Vec<_>>();
    destinations.shuffle(&mut rng);

    let tx = db.begin();
    tx.insert_vertex(0)?;
    for &d in &destinations {
        tx.insert_vertex(d)?;
    }
    for &d in &destinations {
        tx.insert_edge(0, d, d as f64)?;
    }
    tx.commit()?;

    let tx = db.begin();
    let mut previous = None;
    let mut count = 0;
    tx.scan(0, |_, destination, weight| {
        assert!(previous.is_none_or(|p| p < destination), "not ordered");
        assert_eq!(destination as f64, weight);
        previous = Some(destination);
        count += 1;
        true
    })?;
    assert_eq!(64, count);

    Ok(())
}

#[test]
fn scan_stops_on_false() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    for v in 0..8 {
        tx.insert_vertex(v)?;
    }
    for d in 1..8 {
        tx.insert_edge(0, d, 0.0)?;
    }
    tx.commit()?;

    let tx = db.begin();
    let mut seen = 0;
    tx.scan(0, |_, _, _| {
        seen += 1;
        seen < 3
    })?;
    assert_eq!(3, seen);

    Ok(())
}

#[test]
fn scan_missing_vertex() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    assert_eq!(
        Err(Error::VertexDoesNotExist(42)),
        tx.scan(42, |_, _, _| true)
    );

    Ok(())
}

#[test]
fn degree_matches_has_edge() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let tx = db.begin();
    for v in 0..16 {
        tx.insert_vertex(v)?;
    }
    for d in [3, 7, 9, 12] {
        tx.insert_edge(5, d, 1.0)?;
    }
    tx.commit()?;

    let tx = db.begin();
    let mut brute_force = 0;
    for d in 0..16 {
        if d != 5 && tx.has_edge(5, d)? {
            brute_force += 1;
        }
    }
    assert_eq!(brute_force, tx.degree(5)?);

    Ok(())
}

#[test]
fn scan_sees_own_uncommitted_changes() -> teseo::Result<()> {
    let db = Config::new().open()?;

    let t1 = db.begin();
    t1.insert_vertex(1)?;
    t1.insert_vertex(2)?;
    t1.insert_edge(1, 2, 5.0)?;

    let mut seen = Vec::new();
    t1.scan(1, |_, destination, weight| {
        seen.push((destination, weight));
        true
    })?;
    assert_eq!(vec![(2, 5.0)], seen);

    // an edge removed inside the transaction disappears from its scans
    t1.remove_edge(1, 2)?;
    let mut seen = Vec::new();
    t1.scan(1, |_, destination, _| {
        seen.push(destination);
        true
    })?;
    assert!(seen.is_empty());

    Ok(())
}
