//! Author name matching used when picking mirror-site candidates.
//!
//! Names are split on anything that is not an ASCII letter; the first token is
//! the first name and the longest of the remaining tokens is the last name.
//! Matching is exact, never fuzzy. Romanised CJK names often fail this check.

/// Split a display name into `(first, last)`.
///
/// Returns `None` when the name has fewer than two letter tokens.
pub fn split_name(name: &str) -> Option<(&str, &str)> {
    let mut parts = name
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|p| !p.is_empty());

    let first = parts.next()?;
    let mut last: Option<&str> = None;
    for part in parts {
        match last {
            Some(l) if l.len() >= part.len() => {}
            _ => last = Some(part),
        }
    }
    Some((first, last?))
}

/// Whether two display names plausibly denote the same person.
///
/// If either first name is a single initial, only the initials must agree;
/// otherwise first names must be identical. Last names must always be identical.
pub fn match_names(a: &str, b: &str) -> bool {
    let (Some((first_a, last_a)), Some((first_b, last_b))) = (split_name(a), split_name(b)) else {
        return false;
    };

    if last_a != last_b {
        return false;
    }

    if first_a.len() == 1 || first_b.len() == 1 {
        first_a.chars().next() == first_b.chars().next()
    } else {
        first_a == first_b
    }
}
