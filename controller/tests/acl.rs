//! With an ACL rule allowing only `cert.cn=svc-a`, a peer presenting that
//! CN reaches the handler and a peer presenting a different CN gets a 403
//! with the canned JSON error body.
//!
//! `controller::tls::peer_cert_cn` is a stub (real X.509 CN extraction
//! would need an `x509-parser` dependency this crate doesn't carry), so
//! this drives `Acl::check` directly against hand-built `PeerIdentity`
//! values rather than a full mTLS handshake — the same decision path the
//! ACL engine takes once a real handshake has supplied a CN.

use controller::acl::{Acl, AclRule, Action, PeerIdentity};
use controller::error::CtrlError;

fn peer_with_cn(cn: &str) -> PeerIdentity {
    PeerIdentity {
        remote_addr: Some("10.1.2.3".to_string()),
        cert_cn: Some(cn.to_string()),
        issuer_cn: None,
    }
}

fn svc_a_only_acl() -> Acl {
    let rule = AclRule {
        method: "*".into(),
        path: "/".into(),
        remote_addr: None,
        cert_cn: Some("svc-a".into()),
        issuer_cn: None,
        action: Action::Allow,
    };
    Acl::new(false, vec![rule], true, true)
}

#[test]
fn matching_cn_reaches_the_handler() {
    let acl = svc_a_only_acl();
    assert!(acl.check("GET", "/widgets", &peer_with_cn("svc-a")));
}

#[test]
fn mismatched_cn_is_denied_with_canned_error_body() {
    let acl = svc_a_only_acl();
    assert!(!acl.check("GET", "/widgets", &peer_with_cn("svc-b")));

    let err = CtrlError::Forbidden("/widgets".to_string());
    assert_eq!(err.status(), 403);
    assert_eq!(
        err.to_json(),
        "{\"error\":{\"status\":\"403\",\"message\":\"Forbidden (/widgets)\"}}"
    );
}

#[test]
fn peer_with_no_cert_is_denied() {
    let acl = svc_a_only_acl();
    assert!(!acl.check("GET", "/widgets", &PeerIdentity::default()));
}
