// SPDX-License-Identifier: Apache-2.0

/// Components of a VPN full username of the form
/// `user[/resource][@[domain/]realm]`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FullUsername {
    pub username: String,
    pub resource: Option<String>,
    pub domain: Option<String>,
    pub realm: String,
}

/// Parses full usernames, applying the configured default realm when a
/// username carries none.
#[derive(Debug, Clone)]
pub struct UsernameParser {
    default_realm: Option<String>,
}

impl UsernameParser {
    pub fn new(default_realm: Option<String>) -> Self {
        Self { default_realm }
    }

    /// A parse failure (unexpected shape, or no realm and no default)
    /// yields `None`; the caller decides whether that is worth more than
    /// a warning.
    pub fn parse(&self, full_username: &str) -> Option<FullUsername> {
        let (user_part, realm_part) = match split_once_only(
            full_username,
            '@',
        ) {
            Some((user, realm)) => (user, Some(realm)),
            None if full_username.contains('@') => {
                log::warn!(
                    "username in unexpected format: \"{full_username}\""
                );
                return None;
            }
            None => (full_username, None),
        };

        let (username, resource) = match split_field(user_part) {
            Some(ret) => ret,
            None => {
                log::warn!(
                    "username in unexpected format: \"{full_username}\""
                );
                return None;
            }
        };

        let (domain, realm) = match realm_part {
            Some(realm_part) => match split_field(realm_part) {
                // `domain/realm`: the part before the slash is the
                // domain, the part after is the realm.
                Some((first, Some(second))) => (Some(first), Some(second)),
                Some((first, None)) => (None, Some(first)),
                None => {
                    log::warn!(
                        "username in unexpected format: \
                         \"{full_username}\""
                    );
                    return None;
                }
            },
            None => (None, None),
        };

        let realm = match realm {
            Some(realm) => realm,
            None => match self.default_realm.as_ref() {
                Some(default) => {
                    log::debug!(
                        "no realm specified, using default realm \
                         \"{default}\""
                    );
                    default.clone()
                }
                None => {
                    log::warn!(
                        "username contains no realm: \"{full_username}\""
                    );
                    return None;
                }
            },
        };

        Some(FullUsername {
            username,
            resource,
            domain,
            realm,
        })
    }
}

// Split `a[/b]` where both components must be non-empty and free of
// further separators.
fn split_field(field: &str) -> Option<(String, Option<String>)> {
    match split_once_only(field, '/') {
        Some((first, second)) => {
            Some((first.to_string(), Some(second.to_string())))
        }
        None if field.contains('/') => None,
        None if field.is_empty() => None,
        None => Some((field.to_string(), None)),
    }
}

// `split_once` that rejects empty halves and repeated separators.
fn split_once_only<'a>(
    value: &'a str,
    sep: char,
) -> Option<(&'a str, &'a str)> {
    let (first, second) = value.split_once(sep)?;
    if first.is_empty() || second.is_empty() || second.contains(sep) {
        return None;
    }
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> UsernameParser {
        UsernameParser::new(None)
    }

    fn parser_with_default() -> UsernameParser {
        UsernameParser::new(Some("corp".to_string()))
    }

    #[test]
    fn test_plain_username_with_realm() {
        let parsed = parser().parse("alice@corp").unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.resource, None);
        assert_eq!(parsed.domain, None);
        assert_eq!(parsed.realm, "corp");
    }

    #[test]
    fn test_all_components() {
        let parsed = parser().parse("alice/laptop@site/corp").unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.resource.as_deref(), Some("laptop"));
        assert_eq!(parsed.domain.as_deref(), Some("site"));
        assert_eq!(parsed.realm, "corp");
    }

    #[test]
    fn test_resource_without_realm_uses_default() {
        let parsed = parser_with_default().parse("alice/laptop").unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.resource.as_deref(), Some("laptop"));
        assert_eq!(parsed.realm, "corp");
    }

    #[test]
    fn test_missing_realm_without_default_fails() {
        assert!(parser().parse("alice").is_none());
        assert!(parser_with_default().parse("alice").is_some());
    }

    #[test]
    fn test_malformed_usernames_fail() {
        let p = parser_with_default();
        assert!(p.parse("").is_none());
        assert!(p.parse("alice@").is_none());
        assert!(p.parse("@corp").is_none());
        assert!(p.parse("alice@a@b").is_none());
        assert!(p.parse("alice//laptop").is_none());
        assert!(p.parse("alice@site/sub/corp").is_none());
    }
}
