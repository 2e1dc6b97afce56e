//! Consortium mTLS gate.
//!
//! The CA bundle is loaded and parsed once at host construction (fail-fast);
//! established connections present their DER chain to [`CaPool::verify_peer_chain`],
//! which checks validity windows, issuer linkage down to a pool anchor, the
//! intermediate policy, and the optional CN / organization allowlists. A
//! failed verification closes the connection.

use crate::types::NetworkError;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Verification policy applied on top of chain validation.
#[derive(Debug, Clone, Default)]
pub struct MtlsPolicy {
    /// Permit intermediate certificates between the leaf and a pool anchor.
    pub allow_intermediates: bool,
    /// Allowed leaf common names; empty allows any.
    pub cn_allowlist: Vec<String>,
    /// Allowed leaf organizations; empty allows any.
    pub org_allowlist: Vec<String>,
}

/// Parsed CA pool plus verification policy.
pub struct CaPool {
    /// DER-encoded trust anchors.
    anchors: Vec<Vec<u8>>,
    policy: MtlsPolicy,
}

impl CaPool {
    /// Parse a PEM CA bundle. An unreadable or unparseable bundle is a
    /// construction failure, never a silent fallback.
    pub fn load(path: &std::path::Path, policy: MtlsPolicy) -> Result<Self, NetworkError> {
        let bytes = std::fs::read(path).map_err(|e| {
            NetworkError::HostBuildFailed(format!(
                "p2p.ca_bundle_path {}: unreadable: {e}",
                path.display()
            ))
        })?;
        Self::from_pem(&bytes, policy).map_err(|e| {
            NetworkError::HostBuildFailed(format!("p2p.ca_bundle_path {}: {e}", path.display()))
        })
    }

    /// Parse a PEM bundle from memory.
    pub fn from_pem(bytes: &[u8], policy: MtlsPolicy) -> Result<Self, String> {
        let mut anchors = Vec::new();
        for pem in x509_parser::pem::Pem::iter_from_buffer(bytes) {
            let pem = pem.map_err(|e| format!("bad PEM block: {e}"))?;
            if pem.label != "CERTIFICATE" {
                continue;
            }
            // Parse eagerly so a corrupt anchor fails at load time.
            X509Certificate::from_der(&pem.contents)
                .map_err(|e| format!("bad certificate in bundle: {e}"))?;
            anchors.push(pem.contents.clone());
        }
        if anchors.is_empty() {
            return Err("bundle contains no certificates".into());
        }
        Ok(Self { anchors, policy })
    }

    /// Number of trust anchors.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// True when no anchors are loaded (unreachable after `load`).
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Verify a peer's DER certificate chain, leaf first.
    pub fn verify_peer_chain(&self, chain_der: &[Vec<u8>]) -> Result<(), NetworkError> {
        let reject = |reason: String| NetworkError::Transient(format!("mtls: {reason}"));

        let leaf_der = chain_der
            .first()
            .ok_or_else(|| reject("peer presented no certificate".into()))?;
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| reject(format!("leaf does not parse: {e}")))?;

        if !leaf.validity().is_valid() {
            return Err(reject("leaf certificate outside its validity window".into()));
        }
        self.check_allowlists(&leaf)?;

        // Walk issuer links from the leaf toward a pool anchor.
        let mut current_der = leaf_der.clone();
        let mut hops = 0usize;
        loop {
            let (_, current) = X509Certificate::from_der(&current_der)
                .map_err(|e| reject(format!("chain cert does not parse: {e}")))?;

            if self.signed_by_anchor(&current)? {
                return Ok(());
            }

            if !self.policy.allow_intermediates {
                return Err(reject(
                    "leaf is not signed by a configured CA and intermediates are not permitted"
                        .into(),
                ));
            }
            if hops >= chain_der.len() {
                return Err(reject("no path to a configured CA".into()));
            }

            // Find the intermediate that issued `current` among the
            // remaining presented certificates.
            let issuer_der = chain_der
                .iter()
                .skip(1)
                .find(|der| {
                    X509Certificate::from_der(der)
                        .map(|(_, cand)| {
                            cand.subject() == current.issuer()
                                && cand.validity().is_valid()
                                && current.verify_signature(Some(cand.public_key())).is_ok()
                        })
                        .unwrap_or(false)
                })
                .ok_or_else(|| reject("no path to a configured CA".into()))?;
            current_der = issuer_der.clone();
            hops += 1;
        }
    }

    fn signed_by_anchor(&self, cert: &X509Certificate<'_>) -> Result<bool, NetworkError> {
        for anchor_der in &self.anchors {
            let (_, anchor) = X509Certificate::from_der(anchor_der)
                .map_err(|e| NetworkError::Internal(format!("mtls anchor re-parse: {e}")))?;
            if anchor.subject() == cert.issuer()
                && anchor.validity().is_valid()
                && cert.verify_signature(Some(anchor.public_key())).is_ok()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_allowlists(&self, leaf: &X509Certificate<'_>) -> Result<(), NetworkError> {
        if !self.policy.cn_allowlist.is_empty() {
            let cn = leaf
                .subject()
                .iter_common_name()
                .next()
                .and_then(|a| a.as_str().ok())
                .unwrap_or_default();
            if !self.policy.cn_allowlist.iter().any(|allowed| allowed == cn) {
                return Err(NetworkError::Transient(format!(
                    "mtls: common name {cn:?} not in allowlist"
                )));
            }
        }
        if !self.policy.org_allowlist.is_empty() {
            let org = leaf
                .subject()
                .iter_organization()
                .next()
                .and_then(|a| a.as_str().ok())
                .unwrap_or_default();
            if !self.policy.org_allowlist.iter().any(|allowed| allowed == org) {
                return Err(NetworkError::Transient(format!(
                    "mtls: organization {org:?} not in allowlist"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBvjCCAWWgAwIBAgIUMT37elcWMtUS+F4XDxx1HRpWwGQwCgYIKoZIzj0EAwIw
NTEaMBgGA1UEAwwRd2VzLWNvbnNvcnRpdW0tY2ExFzAVBgNVBAoMDldFUyBDb25z
b3J0aXVtMB4XDTI2MDgwMTEwMjUxNloXDTM2MDcyOTEwMjUxNlowNTEaMBgGA1UE
AwwRd2VzLWNvbnNvcnRpdW0tY2ExFzAVBgNVBAoMDldFUyBDb25zb3J0aXVtMFkw
EwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAERl+Pb0UtLlyBSKh8q2/qE9gkagxL2iHa
DOZtYy5YQ4OD2CdpB6fP114oNiGlxU0xamrKpna+9+M5pnsvo3iUTaNTMFEwHQYD
VR0OBBYEFIFbuMTc63JYlmcaQF/JV69gTJEDMB8GA1UdIwQYMBaAFIFbuMTc63JY
lmcaQF/JV69gTJEDMA8GA1UdEwEB/wQFMAMBAf8wCgYIKoZIzj0EAwIDRwAwRAIg
U5KsAw+9GY4DyjTCLW8YTYbaAfpsrRN4edo/sC/aQy4CIH+sDrFhgYEeQlcoxe/Q
VsK2jdqSeNylwiHrKANqml6v
-----END CERTIFICATE-----
";

    const LEAF_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBXDCCAQMCFAWaf8Ok9sOsu8dB78fCCf04rublMAoGCCqGSM49BAMCMDUxGjAY
BgNVBAMMEXdlcy1jb25zb3J0aXVtLWNhMRcwFQYDVQQKDA5XRVMgQ29uc29ydGl1
bTAeFw0yNjA4MDExMDI1MTZaFw0zNjA3MjkxMDI1MTZaMC0xEjAQBgNVBAMMCW5v
ZGUxLndlczEXMBUGA1UECgwOV0VTIENvbnNvcnRpdW0wWTATBgcqhkjOPQIBBggq
hkjOPQMBBwNCAASkBJ3YyiI3OfLhuKSmXa8sgk5sZoQVW9JrynxN03WYhHUHE1yD
uOkXCwpT6kbkKkTHfIINCGHT0Lb3CFU8tbJDMAoGCCqGSM49BAMCA0cAMEQCICxG
/NvuEAQHFcBKKXLC7rdEvHmR88hauzSE8Prxh9uCAiBndfHSDp6DLJjeeiws3XPT
hVHLbtASG9TDBGFJwzNTpA==
-----END CERTIFICATE-----
";

    const ROGUE_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBQzCB6QIUK6V+IQkR+17i7P0qCzD6D+LkyQQwCgYIKoZIzj0EAwIwIzERMA8G
A1UEAwwIcm9ndWUtY2ExDjAMBgNVBAoMBVJvZ3VlMB4XDTI2MDgwMTEwMjUxNloX
DTM2MDcyOTEwMjUxNlowJTETMBEGA1UEAwwKcm9ndWUubm9kZTEOMAwGA1UECgwF
Um9ndWUwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAATDYglwRCrUavBTufhHBMZV
Kn4vj5/yugMXURHyck0CMlYVYiXc3OLx9KekYmroOF/dWo+yLsaUwXwDWqUsZDMG
MAoGCCqGSM49BAMCA0kAMEYCIQC0vQyvfKUXhu7ZEM6je3b6FsP0cidqenrhcPQN
4V+NEQIhANPrb6z02Bdel55hLWHQ4JXdF5QTa+a27CocOSNxXptp
-----END CERTIFICATE-----
";

    fn der_of(pem: &str) -> Vec<u8> {
        x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .contents
    }

    #[test]
    fn bundle_load_and_counts() {
        let pool = CaPool::from_pem(CA_PEM.as_bytes(), MtlsPolicy::default()).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn garbage_bundle_rejected() {
        assert!(CaPool::from_pem(b"not pem at all", MtlsPolicy::default()).is_err());
    }

    #[test]
    fn leaf_signed_by_pool_ca_passes() {
        let pool = CaPool::from_pem(CA_PEM.as_bytes(), MtlsPolicy::default()).unwrap();
        pool.verify_peer_chain(&[der_of(LEAF_PEM)]).unwrap();
    }

    #[test]
    fn leaf_from_unknown_ca_rejected() {
        let pool = CaPool::from_pem(CA_PEM.as_bytes(), MtlsPolicy::default()).unwrap();
        assert!(pool.verify_peer_chain(&[der_of(ROGUE_PEM)]).is_err());
    }

    #[test]
    fn empty_chain_rejected() {
        let pool = CaPool::from_pem(CA_PEM.as_bytes(), MtlsPolicy::default()).unwrap();
        assert!(pool.verify_peer_chain(&[]).is_err());
    }

    #[test]
    fn cn_allowlist_enforced() {
        let accept = CaPool::from_pem(
            CA_PEM.as_bytes(),
            MtlsPolicy {
                cn_allowlist: vec!["node1.wes".into()],
                ..MtlsPolicy::default()
            },
        )
        .unwrap();
        accept.verify_peer_chain(&[der_of(LEAF_PEM)]).unwrap();

        let deny = CaPool::from_pem(
            CA_PEM.as_bytes(),
            MtlsPolicy {
                cn_allowlist: vec!["other.wes".into()],
                ..MtlsPolicy::default()
            },
        )
        .unwrap();
        assert!(deny.verify_peer_chain(&[der_of(LEAF_PEM)]).is_err());
    }

    #[test]
    fn org_allowlist_enforced() {
        let deny = CaPool::from_pem(
            CA_PEM.as_bytes(),
            MtlsPolicy {
                org_allowlist: vec!["Somebody Else".into()],
                ..MtlsPolicy::default()
            },
        )
        .unwrap();
        assert!(deny.verify_peer_chain(&[der_of(LEAF_PEM)]).is_err());
    }
}
