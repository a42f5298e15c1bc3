// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use rstest::rstest;

use super::{FlatRedirectionTable, RedirectionTable};

#[rstest]
#[case("/game/data/textures.pak", Some("/mods/hd/textures.pak"))]
#[case("/game/data/sounds.pak", None)]
#[case("/game/data", None)]
fn test_query_exact_matches_only(#[case] query: &str, #[case] expected: Option<&str>) {
    let table: FlatRedirectionTable =
        [("/game/data/textures.pak", "/mods/hd/textures.pak")].into_iter().collect();
    assert_eq!(table.query(Path::new(query)), expected.map(PathBuf::from));
}

#[rstest]
fn test_insert_replaces_and_remove_returns_target() {
    let mut table = FlatRedirectionTable::new();
    assert!(table.is_empty());
    assert_eq!(table.insert("/a".into(), "/b".into()), None);
    assert_eq!(
        table.insert("/a".into(), "/c".into()),
        Some(PathBuf::from("/b")),
        "second insert should report the replaced target"
    );
    assert_eq!(table.len(), 1);
    assert_eq!(table.remove(Path::new("/a")), Some(PathBuf::from("/c")));
    assert_eq!(table.remove(Path::new("/a")), None);
    assert!(table.is_empty());
}

#[rstest]
fn test_iter_is_ordered() {
    let table: FlatRedirectionTable = [("/z", "/1"), ("/a", "/2"), ("/m", "/3")]
        .into_iter()
        .collect();
    let order: Vec<_> = table.iter().map(|(from, _)| from.to_owned()).collect();
    assert_eq!(order, vec![PathBuf::from("/a"), "/m".into(), "/z".into()]);
}
