//! Table-driven tests for provider path helpers.
//!
//! Each `#[case]` is isolated: no shared state.

use cloudsync_core::paths;
use rstest::rstest;

#[rstest]
#[case("/a/b/", "/a/b")]
#[case("a/b", "/a/b")]
#[case("/a//b", "/a/b")]
#[case("/a/./b", "/a/b")]
#[case("/a/x/../b", "/a/b")]
#[case("/..", "/")]
fn normalize_cases(#[case] input: &str, #[case] expected: &str) {
    assert_eq!(paths::normalize(input), expected);
}

#[rstest]
#[case("/sync", "/sync/a.txt", true, Some("/a.txt"))]
#[case("/sync", "/sync", true, Some("/"))]
#[case("/sync", "/syncthing/a", true, None)]
#[case("/Sync", "/sync/a", false, Some("/a"))]
#[case("/Sync", "/sync/a", true, None)]
#[case("/", "/anything/at/all", true, Some("/anything/at/all"))]
fn is_subpath_cases(
    #[case] parent: &str,
    #[case] child: &str,
    #[case] case_sensitive: bool,
    #[case] expected: Option<&str>,
) {
    assert_eq!(
        paths::is_subpath(parent, child, case_sensitive).as_deref(),
        expected
    );
}

#[rstest]
#[case("/b.txt", 1, "/b.conflicted.txt")]
#[case("/b.txt", 2, "/b.conflicted-2.txt")]
#[case("/dir/archive.tar.gz", 1, "/dir/archive.tar.conflicted.gz")]
#[case("/noext", 1, "/noext.conflicted")]
#[case("/.hidden", 1, "/.hidden.conflicted")]
fn conflict_path_cases(#[case] path: &str, #[case] attempt: u32, #[case] expected: &str) {
    assert_eq!(paths::conflict_path(path, attempt), expected);
}

#[rstest]
#[case("/a", "/b.txt", "/a/b.txt")]
#[case("/", "/b.txt", "/b.txt")]
#[case("/a/", "b/c", "/a/b/c")]
fn join_cases(#[case] base: &str, #[case] rel: &str, #[case] expected: &str) {
    assert_eq!(paths::join(base, rel), expected);
}

#[test]
fn key_folds_case_only_when_insensitive() {
    assert_eq!(paths::key("/A/B.txt", false), "/a/b.txt");
    assert_eq!(paths::key("/A/B.txt", true), "/A/B.txt");
    assert!(paths::paths_match("/A", "/a/", false));
    assert!(!paths::paths_match("/A", "/a", true));
}
