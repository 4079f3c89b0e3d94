use super::*;

fn test_db() -> Store {
    Store::open(":memory:").expect("in-memory db")
}

#[test]
fn match_query_quotes_and_prefixes_tokens() {
    assert_eq!(
        build_match_query("  quick  fox ").unwrap().as_deref(),
        Some("\"quick\"* \"fox\"*")
    );
    assert_eq!(
        build_match_query("well-known").unwrap().as_deref(),
        Some("\"well-known\"*")
    );
    assert_eq!(build_match_query("café").unwrap().as_deref(), Some("\"café\"*"));
}

#[test]
fn match_query_empty_or_dash_only_is_none() {
    assert_eq!(build_match_query("").unwrap(), None);
    assert_eq!(build_match_query("   \t ").unwrap(), None);
    assert_eq!(build_match_query("- --").unwrap(), None);
}

#[test]
fn match_query_rejects_operators_and_quotes() {
    for q in ["a\"b", "title:foo", "foo*", "(bar)", "x OR y^", "NEAR(a b)"] {
        assert!(
            matches!(build_match_query(q), Err(FlashError::Validation(_))),
            "{q:?} should be rejected"
        );
    }
}

#[test]
fn match_query_limits() {
    let long = "a".repeat(MAX_QUERY_LEN + 1);
    assert!(matches!(build_match_query(&long), Err(FlashError::Validation(_))));

    let many = vec!["w"; MAX_QUERY_TOKENS + 1].join(" ");
    assert!(matches!(build_match_query(&many), Err(FlashError::Validation(_))));

    let ok = vec!["w"; MAX_QUERY_TOKENS].join(" ");
    assert!(build_match_query(&ok).unwrap().is_some());
}

#[test]
fn search_finds_prefix_and_marks_snippet() {
    let db = test_db();
    let b = db.create(Some("the quick brown fox jumps")).unwrap();

    let results = db.search("qui fox", 10).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, b.id);
    assert!(results[0].snippet.contains("<mark>quick</mark>"));
}

#[test]
fn search_follows_saves_and_deletes() {
    let db = test_db();
    let b = db.create(Some("alpha")).unwrap();
    assert_eq!(db.search("alpha", 10).unwrap().len(), 1);

    db.save(&b.id, "beta").unwrap();
    assert!(db.search("alpha", 10).unwrap().is_empty());
    assert_eq!(db.search("beta", 10).unwrap().len(), 1);

    db.delete(&b.id).unwrap();
    assert!(db.search("beta", 10).unwrap().is_empty());
}

#[test]
fn search_skips_archived() {
    let db = test_db();
    let b = db.create(Some("hidden treasure")).unwrap();
    db.archive(&b.id).unwrap();
    assert!(db.search("treasure", 10).unwrap().is_empty());
}

#[test]
fn search_respects_limit() {
    let db = test_db();
    for i in 0..5 {
        db.create(Some(&format!("common word {i}"))).unwrap();
    }
    assert_eq!(db.search("common", 3).unwrap().len(), 3);
}

#[test]
fn integrity_ok_on_fresh_db() {
    let db = test_db();
    db.create(Some("one")).unwrap();
    db.create(Some("two")).unwrap();
    let report = db.integrity().unwrap();
    assert!(report.ok);
    assert!(report.fts_consistent);
    assert_eq!(report.total, 2);
    assert_eq!(report.indexed, 2);
    assert_eq!(report.schema_version, LATEST_SCHEMA_VERSION);
}

#[test]
fn rebuild_repairs_drifted_index() {
    let db = test_db();
    db.create(Some("needle in haystack")).unwrap();
    {
        // bypass triggers: wipe the index behind the content table's back
        let conn = db.writer().unwrap();
        conn.execute("INSERT INTO buffers_fts(buffers_fts) VALUES ('delete-all')", [])
            .unwrap();
    }
    assert!(db.search("needle", 10).unwrap().is_empty());
    assert!(!db.integrity().unwrap().ok);

    assert_eq!(db.rebuild_index().unwrap(), 1);
    assert_eq!(db.search("needle", 10).unwrap().len(), 1);
    assert!(db.integrity().unwrap().ok);
}
