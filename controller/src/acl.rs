//! ACL engine over peer identity: an ordered rule list, first full match
//! wins, default deny.
//!
//! An incomplete TLS setup (TLS on, no client CA configured) fails closed
//! rather than bypassing the engine; only an explicit `acl_disabled = true`
//! in configuration does that.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub enum Action {
    #[serde(rename = "allow")]
    Allow,
    #[serde(rename = "deny")]
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(rename = "cert.cn", default)]
    pub cert_cn: Option<String>,
    #[serde(rename = "issuer.cn", default)]
    pub issuer_cn: Option<String>,
    pub action: Action,
}

impl AclRule {
    pub fn allow(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            remote_addr: None,
            cert_cn: None,
            issuer_cn: None,
            action: Action::Allow,
        }
    }

    fn method_matches(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method)
    }

    /// Path prefixes ending in `/` match sub-paths; anything else must
    /// match exactly.
    fn path_matches(&self, path: &str) -> bool {
        if self.path == "*" {
            true
        } else if let Some(prefix) = self.path.strip_suffix('/') {
            path == self.path || path.starts_with(&format!("{prefix}/"))
        } else {
            path == self.path
        }
    }

    fn field_matches(rule_value: &Option<String>, actual: Option<&str>) -> bool {
        match rule_value {
            None => true,
            // A wildcard rule still requires the field to be present --
            // `*` means "any cert", not "no cert needed".
            Some(v) if v == "*" => actual.is_some(),
            Some(v) => actual.map(|a| a == v).unwrap_or(false),
        }
    }
}

/// Identity facts retrieved lazily and cached per-request; retrieval
/// failure is represented as `None` and only fails that one rule's field,
/// not the whole ACL check.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    pub remote_addr: Option<String>,
    pub cert_cn: Option<String>,
    pub issuer_cn: Option<String>,
}

pub struct Acl {
    disabled: bool,
    rules: Vec<AclRule>,
}

impl Acl {
    /// Builds the engine from configuration. `tls_enabled`/`has_ca` pick the
    /// default rule set when none is configured, but never decide bypass on
    /// their own -- see the module doc comment above.
    pub fn new(disabled: bool, rules: Vec<AclRule>, tls_enabled: bool, has_ca: bool) -> Self {
        let rules = if rules.is_empty() {
            Self::default_rules(tls_enabled, has_ca)
        } else {
            rules
        };
        if !disabled && tls_enabled && !has_ca {
            log::warn!(
                "ACL active without a client CA configured; only remote_addr rules can match"
            );
        }
        Self { disabled, rules }
    }

    fn default_rules(tls_enabled: bool, has_ca: bool) -> Vec<AclRule> {
        let mut rules = vec![
            AclRule {
                method: "*".into(),
                path: "/".into(),
                remote_addr: Some("::1".into()),
                cert_cn: None,
                issuer_cn: None,
                action: Action::Allow,
            },
            AclRule {
                method: "*".into(),
                path: "/".into(),
                remote_addr: Some("127.0.0.1".into()),
                cert_cn: None,
                issuer_cn: None,
                action: Action::Allow,
            },
        ];
        if tls_enabled && has_ca {
            rules.push(AclRule {
                method: "*".into(),
                path: "/".into(),
                remote_addr: None,
                cert_cn: Some("*".into()),
                issuer_cn: None,
                action: Action::Allow,
            });
        }
        rules
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns true when the request should proceed. Default deny if no
    /// rule matches or the engine is empty.
    pub fn check(&self, method: &str, path: &str, peer: &PeerIdentity) -> bool {
        if self.disabled {
            return true;
        }
        for rule in &self.rules {
            if !rule.method_matches(method) || !rule.path_matches(path) {
                continue;
            }
            if !AclRule::field_matches(&rule.remote_addr, peer.remote_addr.as_deref())
                || !AclRule::field_matches(&rule.cert_cn, peer.cert_cn.as_deref())
                || !AclRule::field_matches(&rule.issuer_cn, peer.issuer_cn.as_deref())
            {
                continue;
            }
            return matches!(rule.action, Action::Allow);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> PeerIdentity {
        PeerIdentity {
            remote_addr: Some(addr.to_string()),
            cert_cn: None,
            issuer_cn: None,
        }
    }

    #[test]
    fn allow_all_reaches_handler() {
        let acl = Acl::new(false, vec![AclRule::allow("*", "*")], false, false);
        assert!(acl.check("GET", "/anything", &PeerIdentity::default()));
    }

    #[test]
    fn deny_all_via_default_rules_blocks_unknown_peers() {
        let acl = Acl::new(false, vec![], false, false);
        assert!(!acl.check("GET", "/x", &peer("10.0.0.5")));
        assert!(acl.check("GET", "/x", &peer("127.0.0.1")));
    }

    #[test]
    fn tls_without_ca_is_not_silently_bypassed() {
        // REDESIGN: no explicit acl_disabled, so even with TLS on and no CA,
        // the engine still enforces (fails closed) rather than bypassing.
        let acl = Acl::new(false, vec![], true, false);
        assert!(!acl.check("GET", "/x", &peer("10.0.0.5")));
        assert!(!acl.is_disabled());
    }

    #[test]
    fn tls_wildcard_cn_rule_requires_a_presented_cert() {
        // The TLS+CA default rule set installs a `cert.cn = "*"` allow rule.
        // A peer that completed the handshake with no client certificate at
        // all must still be denied -- `*` means "any cert", not "no cert".
        let acl = Acl::new(false, vec![], true, true);
        assert!(!acl.check("GET", "/x", &PeerIdentity::default()));

        let mut p = PeerIdentity::default();
        p.cert_cn = Some("svc-a".to_string());
        assert!(acl.check("GET", "/x", &p));
    }

    #[test]
    fn explicit_disable_bypasses_everything() {
        let acl = Acl::new(true, vec![AclRule::allow("*", "/never/")], false, false);
        assert!(acl.check("GET", "/anything", &peer("10.0.0.5")));
    }

    #[test]
    fn cert_cn_rule_matches_subject() {
        let rule = AclRule {
            method: "*".into(),
            path: "/".into(),
            remote_addr: None,
            cert_cn: Some("svc-a".into()),
            issuer_cn: None,
            action: Action::Allow,
        };
        let acl = Acl::new(false, vec![rule], true, true);
        let mut p = PeerIdentity::default();
        p.cert_cn = Some("svc-a".to_string());
        assert!(acl.check("GET", "/x", &p));
        p.cert_cn = Some("svc-b".to_string());
        assert!(!acl.check("GET", "/x", &p));
    }

    #[test]
    fn path_prefix_requires_trailing_slash_to_match_subpaths() {
        let rules = vec![AclRule::allow("*", "/admin/")];
        let acl = Acl::new(false, rules, false, false);
        assert!(acl.check("GET", "/admin/", &PeerIdentity::default()));
        assert!(acl.check("GET", "/admin/x", &PeerIdentity::default()));
        assert!(!acl.check("GET", "/admin", &PeerIdentity::default()));
    }
}
