//! Set difference of a contact pool against the opt-out registry.

use std::collections::HashSet;

/// Anything that has a recipient address.
pub trait Recipient {
    fn email(&self) -> &str;
}

/// Canonical form used for opt-out comparisons.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Build the lookup set from raw registry entries.
pub fn suppression_set<I, S>(emails: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    emails
        .into_iter()
        .map(|e| normalize_email(e.as_ref()))
        .collect()
}

/// Drop every contact whose email is in `suppressed`.
///
/// `suppressed` must already be normalized (see [`suppression_set`]).
/// Order is preserved and duplicates in `contacts` are kept.
pub fn filter_active<C: Recipient>(contacts: Vec<C>, suppressed: &HashSet<String>) -> Vec<C> {
    if suppressed.is_empty() {
        return contacts;
    }
    contacts
        .into_iter()
        .filter(|c| !suppressed.contains(&normalize_email(c.email())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct C(&'static str);

    impl Recipient for C {
        fn email(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn removes_suppressed_case_insensitively() {
        let pool = vec![C("a@x.io"), C("B@x.io"), C("c@x.io")];
        let suppressed = suppression_set([" b@X.io "]);
        let kept: Vec<_> = filter_active(pool, &suppressed).into_iter().map(|c| c.0).collect();
        assert_eq!(kept, vec!["a@x.io", "c@x.io"]);
    }

    #[test]
    fn keeps_duplicates_and_order() {
        let pool = vec![C("z@x.io"), C("a@x.io"), C("z@x.io")];
        let kept: Vec<_> = filter_active(pool, &HashSet::new())
            .into_iter()
            .map(|c| c.0)
            .collect();
        assert_eq!(kept, vec!["z@x.io", "a@x.io", "z@x.io"]);
    }
}
