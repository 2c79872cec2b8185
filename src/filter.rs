//! Allow/deny filtering for mount options and encrypted-option references.
//!
//! Used to scope which options and credentials appear on a generated command.
//! The filter is pure and order-independent: the allow-list is applied first,
//! then the deny-list removes any remaining disallowed keys. An *unset*
//! allow-list (`None`) imposes no restriction; an *empty* allow-list keeps
//! nothing. The two states are deliberately distinct.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::EncryptOption;

/// Allow/deny filter over option keys.
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    allow: Option<BTreeSet<String>>,
    deny: BTreeSet<String>,
}

impl KeyFilter {
    /// A filter with no restrictions.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// A filter that keeps nothing.
    pub fn deny_all() -> Self {
        Self {
            allow: Some(BTreeSet::new()),
            deny: BTreeSet::new(),
        }
    }

    /// Restrict to the given keys.
    pub fn allowing<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: Some(keys.into_iter().map(Into::into).collect()),
            deny: BTreeSet::new(),
        }
    }

    /// Additionally deny the given keys.
    pub fn denying<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Whether a key survives this filter.
    pub fn permits(&self, key: &str) -> bool {
        if let Some(allow) = &self.allow {
            if !allow.contains(key) {
                return false;
            }
        }
        !self.deny.contains(key)
    }
}

/// Paired filters for a command's plain option map and encrypted-option list.
///
/// The two are independently configurable: a command may accept an option
/// as a literal but not as a secret reference, or vice versa.
#[derive(Clone, Debug, Default)]
pub struct OptionFilter {
    /// Filter for plain `key=value` options
    pub options: KeyFilter,
    /// Filter for encrypted-option (secret reference) names
    pub encrypt_options: KeyFilter,
}

impl OptionFilter {
    /// Construct from the two underlying key filters.
    pub fn new(options: KeyFilter, encrypt_options: KeyFilter) -> Self {
        Self {
            options,
            encrypt_options,
        }
    }

    /// Filter a plain option map, preserving key order.
    pub fn filter_options(&self, options: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        options
            .iter()
            .filter(|(k, _)| self.options.permits(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Filter an encrypted-option list, preserving order.
    pub fn filter_encrypt_options(&self, encrypt_options: &[EncryptOption]) -> Vec<EncryptOption> {
        encrypt_options
            .iter()
            .filter(|o| self.encrypt_options.permits(&o.name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EncryptOptionSource, SecretKeySelector};

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn encrypt_option(name: &str) -> EncryptOption {
        EncryptOption {
            name: name.to_string(),
            value_from: EncryptOptionSource {
                secret_key_ref: SecretKeySelector {
                    name: format!("{name}-secret"),
                    key: name.to_string(),
                },
            },
        }
    }

    #[test]
    fn unset_allow_list_imposes_no_restriction() {
        let filter = OptionFilter::new(KeyFilter::unrestricted(), KeyFilter::unrestricted());
        let input = options(&[("bucket", "b"), ("storage", "s3")]);
        assert_eq!(filter.filter_options(&input), input);
    }

    #[test]
    fn empty_allow_list_keeps_nothing() {
        let filter = OptionFilter::new(KeyFilter::deny_all(), KeyFilter::deny_all());
        let input = options(&[("bucket", "b"), ("storage", "s3")]);
        assert!(filter.filter_options(&input).is_empty());
        assert!(filter
            .filter_encrypt_options(&[encrypt_option("access-key")])
            .is_empty());
    }

    #[test]
    fn allow_then_deny_is_order_independent() {
        let filter = KeyFilter::allowing(["bucket", "storage", "token"]).denying(["token"]);
        assert!(filter.permits("bucket"));
        assert!(filter.permits("storage"));
        assert!(!filter.permits("token"));
        assert!(!filter.permits("unlisted"));
    }

    #[test]
    fn deny_applies_without_allow_list() {
        let filter = KeyFilter::unrestricted().denying(["quota"]);
        assert!(filter.permits("bucket"));
        assert!(!filter.permits("quota"));
    }

    #[test]
    fn encrypt_filter_is_independent_of_option_filter() {
        let filter = OptionFilter::new(
            KeyFilter::deny_all(),
            KeyFilter::allowing(["access-key", "secret-key"]),
        );
        let kept = filter.filter_encrypt_options(&[
            encrypt_option("access-key"),
            encrypt_option("token"),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "access-key");
    }
}
