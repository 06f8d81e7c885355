//! Provider path helpers.
//!
//! Provider paths are absolute, `/`-separated and normalised: no trailing
//! separator, no empty or `.` components, `..` resolved lexically. The root
//! is `/`.

pub const SEP: char = '/';

/// Normalise a provider path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(SEP) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return SEP.to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for p in parts {
        out.push(SEP);
        out.push_str(p);
    }
    out
}

/// Lookup key for a path on a backend with the given case sensitivity.
pub fn key(path: &str, case_sensitive: bool) -> String {
    let norm = normalize(path);
    if case_sensitive {
        norm
    } else {
        norm.to_lowercase()
    }
}

pub fn paths_match(a: &str, b: &str, case_sensitive: bool) -> bool {
    key(a, case_sensitive) == key(b, case_sensitive)
}

/// Split into `(parent, name)`. The root splits into `("/", "")`.
pub fn split(path: &str) -> (String, String) {
    let norm = normalize(path);
    match norm.rfind(SEP) {
        Some(0) if norm.len() == 1 => (SEP.to_string(), String::new()),
        Some(0) => (SEP.to_string(), norm[1..].to_string()),
        Some(idx) => (norm[..idx].to_string(), norm[idx + 1..].to_string()),
        None => (SEP.to_string(), norm),
    }
}

pub fn parent(path: &str) -> String {
    split(path).0
}

pub fn is_root(path: &str) -> bool {
    normalize(path) == "/"
}

/// Join `rel` under `base`. `rel` may be absolute; it is still nested.
pub fn join(base: &str, rel: &str) -> String {
    normalize(&format!("{base}{SEP}{rel}"))
}

/// If `child` is `parent` or lies below it, the remainder as an absolute
/// path (`/` when equal).
pub fn is_subpath(parent: &str, child: &str, case_sensitive: bool) -> Option<String> {
    let p = normalize(parent);
    let c = normalize(child);
    let pc = components(&p);
    let cc = components(&c);
    if cc.len() < pc.len() {
        return None;
    }
    let same = pc.iter().zip(cc.iter()).all(|(a, b)| {
        if case_sensitive {
            a == b
        } else {
            a.to_lowercase() == b.to_lowercase()
        }
    });
    if !same {
        return None;
    }
    Some(format!("{SEP}{}", cc[pc.len()..].join("/")))
}

fn components(path: &str) -> Vec<&str> {
    path.split(SEP).filter(|c| !c.is_empty()).collect()
}

/// Rewrite the `from` prefix of `path` to `to`, if `path` is under `from`.
pub fn replace_prefix(path: &str, from: &str, to: &str, case_sensitive: bool) -> Option<String> {
    is_subpath(from, path, case_sensitive).map(|rest| join(to, &rest))
}

/// Every proper ancestor of `path` below the root, outermost first.
///
/// `/a/b/c.txt` → `["/a", "/a/b"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let norm = normalize(path);
    let mut out = Vec::new();
    let mut current = String::new();
    let comps: Vec<&str> = norm.split(SEP).filter(|c| !c.is_empty()).collect();
    for comp in comps.iter().take(comps.len().saturating_sub(1)) {
        current.push(SEP);
        current.push_str(comp);
        out.push(current.clone());
    }
    out
}

/// Sibling path used to preserve the losing side of a conflict.
///
/// `attempt` 1 gives `/b.conflicted.txt`, 2 gives `/b.conflicted-2.txt`.
pub fn conflict_path(path: &str, attempt: u32) -> String {
    let (dir, name) = split(path);
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name.as_str(), ""),
    };
    let marker = if attempt <= 1 {
        ".conflicted".to_string()
    } else {
        format!(".conflicted-{attempt}")
    };
    join(&dir, &format!("{stem}{marker}{ext}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
