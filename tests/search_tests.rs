use flashnotes::db::Store;
use flashnotes::error::FlashError;

fn test_db() -> Store {
    Store::open(":memory:").expect("in-memory db")
}

#[test]
fn unique_token_is_found_after_save() {
    let db = test_db();
    let b = db.create(None).unwrap();
    assert!(db.search("zephyr", 20).unwrap().is_empty());

    db.save(&b.id, "meeting notes\nthe zephyr project kickoff").unwrap();
    let results = db.search("zephyr", 20).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, b.id);
    assert!(results[0].snippet.contains("<mark>zephyr</mark>"));
}

#[test]
fn all_terms_must_match() {
    let db = test_db();
    let both = db.create(Some("apple banana")).unwrap();
    db.create(Some("apple only")).unwrap();

    let results = db.search("apple banana", 20).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, both.id);
}

#[test]
fn prefix_matching() {
    let db = test_db();
    db.create(Some("configuration reference")).unwrap();
    assert_eq!(db.search("config", 20).unwrap().len(), 1);
    assert_eq!(db.search("conf ref", 20).unwrap().len(), 1);
}

#[test]
fn hyphenated_terms() {
    let db = test_db();
    db.create(Some("a well-known fact")).unwrap();
    assert_eq!(db.search("well-known", 20).unwrap().len(), 1);
}

#[test]
fn case_insensitive() {
    let db = test_db();
    db.create(Some("Rust Ownership")).unwrap();
    assert_eq!(db.search("rust ownership", 20).unwrap().len(), 1);
    assert_eq!(db.search("RUST", 20).unwrap().len(), 1);
}

#[test]
fn blank_query_returns_nothing() {
    let db = test_db();
    db.create(Some("anything")).unwrap();
    assert!(db.search("", 20).unwrap().is_empty());
    assert!(db.search("   ", 20).unwrap().is_empty());
}

#[test]
fn special_characters_rejected() {
    let db = test_db();
    db.create(Some("anything")).unwrap();
    for q in ["\"", "foo\"", "a*", "col:val", "a AND (b", "x + y", "{a}"] {
        assert!(
            matches!(db.search(q, 20), Err(FlashError::Validation(_))),
            "{q:?} should be rejected"
        );
    }
}

#[test]
fn reserved_words_are_plain_terms() {
    let db = test_db();
    db.create(Some("cats AND dogs OR birds NOT fish")).unwrap();
    // quoted, so these are matched as words rather than operators
    assert_eq!(db.search("AND", 20).unwrap().len(), 1);
    assert_eq!(db.search("cats OR", 20).unwrap().len(), 1);
    assert_eq!(db.search("NEAR", 20).unwrap().len(), 0);
}

#[test]
fn newer_buffer_wins_ties() {
    let db = test_db();
    let older = db.create(Some("same words here")).unwrap();
    let newer = db.create(Some("same words here")).unwrap();
    db.save(&newer.id, "same words here").unwrap();

    let results = db.search("same", 20).unwrap();
    assert_eq!(results.len(), 2);
    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.contains(&older.id.as_str()));
    assert!(ids.contains(&newer.id.as_str()));
    assert!(results[0].updated_at >= results[1].updated_at);
}

#[test]
fn deleted_buffers_leave_the_index() {
    let db = test_db();
    let b = db.create(Some("ephemeral")).unwrap();
    db.delete(&b.id).unwrap();
    assert!(db.search("ephemeral", 20).unwrap().is_empty());
    assert!(db.integrity().unwrap().ok);
}
