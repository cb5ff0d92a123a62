use crate::error::Error;
use crate::path::PathKey;

fn key(raw: &str) -> PathKey {
    PathKey::normalize(raw, false).expect("normalize")
}

#[test]
fn folds_case_when_insensitive() {
    assert_eq!(key("\\Share\\File.TXT"), key("\\share\\file.txt"));
}

#[test]
fn preserves_case_when_sensitive() {
    let upper = PathKey::normalize("\\Share\\F", true).unwrap();
    let lower = PathKey::normalize("\\share\\f", true).unwrap();
    assert_ne!(upper, lower);
}

#[test]
fn normalizes_separators() {
    assert_eq!(key("/share//sub/f"), key("\\share\\sub\\f"));
    assert_eq!(key("share\\sub\\f"), key("\\share\\sub\\f"));
}

#[test]
fn strips_trailing_separator() {
    assert_eq!(key("\\dir\\"), key("\\dir"));
    assert_eq!(key("/").as_str(), "\\");
}

#[test]
fn rejects_empty_path() {
    assert!(matches!(PathKey::normalize("", false), Err(Error::InvalidPath(_))));
}

#[test]
fn rejects_nul_byte() {
    assert!(matches!(PathKey::normalize("\\a\0b", false), Err(Error::InvalidPath(_))));
}

#[test]
fn descendant_is_prefix_plus_separator() {
    let dir = key("\\x");
    assert!(key("\\x\\a").is_descendant_of(&dir));
    assert!(key("\\x\\c\\d").is_descendant_of(&dir));
    assert!(!key("\\x").is_descendant_of(&dir));
    assert!(!key("\\xy\\a").is_descendant_of(&dir));
}

#[test]
fn everything_descends_from_root() {
    let root = key("\\");
    assert!(key("\\a").is_descendant_of(&root));
    assert!(!root.clone().is_descendant_of(&root));
}

#[test]
fn rebase_moves_prefix() {
    let old = key("\\x");
    let new = key("\\y");
    assert_eq!(key("\\x\\c\\d").rebase(&old, &new), Some(key("\\y\\c\\d")));
    assert_eq!(key("\\z\\c").rebase(&old, &new), None);
}
