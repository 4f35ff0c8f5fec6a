//! Algorithm negotiation over exchanged KEXINIT lists.
//!
//! The matching rule is asymmetric: the chosen name is always the first
//! entry of the *server's* list that the client also supports. Expressed
//! from each side's point of view:
//!
//! - as server: first of our preference list present in the peer's list
//! - as client: first of the peer's list present in our list
//!
//! Encryption, MAC and compression are negotiated per direction
//! (client-to-server and server-to-client separately); key exchange and
//! host key are session-wide.

use skiff_platform::{SkiffError, SkiffResult};
use tracing::debug;

use crate::kex::KexInit;

/// The complete outcome of one negotiation.
///
/// Directional fields are named from the wire's perspective, not the local
/// side's: `cipher_c2s` is the client-to-server cipher whichever side we
/// are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Server host key type.
    pub host_key: String,
    /// Client-to-server cipher.
    pub cipher_c2s: String,
    /// Server-to-client cipher.
    pub cipher_s2c: String,
    /// Client-to-server MAC.
    pub mac_c2s: String,
    /// Server-to-client MAC.
    pub mac_s2c: String,
    /// Client-to-server compression.
    pub compression_c2s: String,
    /// Server-to-client compression.
    pub compression_s2c: String,
}

impl NegotiatedAlgorithms {
    /// Outbound cipher name from the local side's point of view.
    pub fn cipher_out(&self, is_server: bool) -> &str {
        if is_server {
            &self.cipher_s2c
        } else {
            &self.cipher_c2s
        }
    }

    /// Inbound cipher name from the local side's point of view.
    pub fn cipher_in(&self, is_server: bool) -> &str {
        if is_server {
            &self.cipher_c2s
        } else {
            &self.cipher_s2c
        }
    }

    /// Outbound MAC name from the local side's point of view.
    pub fn mac_out(&self, is_server: bool) -> &str {
        if is_server {
            &self.mac_s2c
        } else {
            &self.mac_c2s
        }
    }

    /// Inbound MAC name from the local side's point of view.
    pub fn mac_in(&self, is_server: bool) -> &str {
        if is_server {
            &self.mac_c2s
        } else {
            &self.mac_s2c
        }
    }

    /// Outbound compression name from the local side's point of view.
    pub fn compression_out(&self, is_server: bool) -> &str {
        if is_server {
            &self.compression_s2c
        } else {
            &self.compression_c2s
        }
    }

    /// Inbound compression name from the local side's point of view.
    pub fn compression_in(&self, is_server: bool) -> &str {
        if is_server {
            &self.compression_c2s
        } else {
            &self.compression_s2c
        }
    }
}

/// Picks one algorithm for one category.
///
/// # Errors
///
/// [`SkiffError::NoCompatibleAlgorithm`] naming the category when the
/// lists do not intersect.
pub fn agree(
    category: &'static str,
    ours: &[String],
    theirs: &[String],
    is_server: bool,
) -> SkiffResult<String> {
    let (server_order, filter): (&[String], &[String]) = if is_server {
        (ours, theirs)
    } else {
        (theirs, ours)
    };
    server_order
        .iter()
        .find(|name| filter.contains(name))
        .cloned()
        .ok_or(SkiffError::NoCompatibleAlgorithm { category })
}

/// Runs the full negotiation over both sides' KEXINIT contents.
///
/// `ours` carries the local preference lists, `theirs` the peer's. Both
/// must be the already-parsed KEXINIT bodies; the local one should already
/// be filtered to host key types we can actually serve when acting as the
/// server.
pub fn negotiate(
    ours: &KexInit,
    theirs: &KexInit,
    is_server: bool,
) -> SkiffResult<NegotiatedAlgorithms> {
    // Directional lists are labelled c2s/s2c on the wire; map our local
    // out/in lists onto those labels per role.
    let (c2s_ciphers_ours, s2c_ciphers_ours) = (&ours.ciphers_c2s, &ours.ciphers_s2c);
    let (c2s_ciphers_theirs, s2c_ciphers_theirs) = (&theirs.ciphers_c2s, &theirs.ciphers_s2c);

    let result = NegotiatedAlgorithms {
        kex: agree("kex", &ours.kex_algorithms, &theirs.kex_algorithms, is_server)?,
        host_key: agree(
            "host key",
            &ours.server_host_key_algorithms,
            &theirs.server_host_key_algorithms,
            is_server,
        )?,
        cipher_c2s: agree("cipher", c2s_ciphers_ours, c2s_ciphers_theirs, is_server)?,
        cipher_s2c: agree("cipher", s2c_ciphers_ours, s2c_ciphers_theirs, is_server)?,
        mac_c2s: agree("mac", &ours.macs_c2s, &theirs.macs_c2s, is_server)?,
        mac_s2c: agree("mac", &ours.macs_s2c, &theirs.macs_s2c, is_server)?,
        compression_c2s: agree(
            "compression",
            &ours.compression_c2s,
            &theirs.compression_c2s,
            is_server,
        )?,
        compression_s2c: agree(
            "compression",
            &ours.compression_s2c,
            &theirs.compression_s2c,
            is_server,
        )?,
    };
    debug!(
        kex = %result.kex,
        host_key = %result.host_key,
        cipher_c2s = %result.cipher_c2s,
        cipher_s2c = %result.cipher_s2c,
        "algorithms negotiated"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_server_order_wins_as_server() {
        // As server our own preference order drives, however the client
        // orders its offer.
        let ours = names(&["aes128-ctr", "aes256-cbc"]);
        let theirs = names(&["aes256-cbc", "aes128-ctr"]);
        let choice = agree("cipher", &ours, &theirs, true).unwrap();
        assert_eq!(choice, "aes128-ctr");
    }

    #[test]
    fn test_client_defers_to_server_order() {
        // Same lists from the client's seat: the peer's order decides.
        let ours = names(&["aes128-ctr", "aes256-cbc"]);
        let theirs = names(&["aes256-cbc", "aes128-ctr"]);
        let choice = agree("cipher", &ours, &theirs, false).unwrap();
        assert_eq!(choice, "aes256-cbc");
    }

    #[test]
    fn test_no_intersection_names_category() {
        let ours = names(&["curve25519-sha256"]);
        let theirs = names(&["diffie-hellman-group1-sha1"]);
        let err = agree("kex", &ours, &theirs, false).unwrap_err();
        match err {
            SkiffError::NoCompatibleAlgorithm { category } => assert_eq!(category, "kex"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_empty_peer_list() {
        let ours = names(&["hmac-sha2-256"]);
        assert!(agree("mac", &ours, &[], true).is_err());
        assert!(agree("mac", &ours, &[], false).is_err());
    }

    #[test]
    fn test_full_negotiation_directional() {
        let mut client = KexInit::with_lists(
            names(&["curve25519-sha256", "diffie-hellman-group14-sha256"]),
            names(&["ssh-ed25519"]),
        );
        client.ciphers_c2s = names(&["aes128-ctr"]);
        client.ciphers_s2c = names(&["aes256-ctr", "aes128-ctr"]);
        client.macs_c2s = names(&["hmac-sha2-256"]);
        client.macs_s2c = names(&["hmac-sha2-512", "hmac-sha2-256"]);
        client.compression_c2s = names(&["none"]);
        client.compression_s2c = names(&["zlib", "none"]);

        let mut server = KexInit::with_lists(
            names(&["diffie-hellman-group14-sha256", "curve25519-sha256"]),
            names(&["ssh-ed25519"]),
        );
        server.ciphers_c2s = names(&["aes256-ctr", "aes128-ctr"]);
        server.ciphers_s2c = names(&["aes256-ctr", "aes128-ctr"]);
        server.macs_c2s = names(&["hmac-sha2-256", "hmac-sha2-512"]);
        server.macs_s2c = names(&["hmac-sha2-512", "hmac-sha2-256"]);
        server.compression_c2s = names(&["none", "zlib"]);
        server.compression_s2c = names(&["zlib", "none"]);

        // Both sides must converge on identical results.
        let at_server = negotiate(&server, &client, true).unwrap();
        let at_client = negotiate(&client, &server, false).unwrap();
        assert_eq!(at_server, at_client);

        assert_eq!(at_server.kex, "diffie-hellman-group14-sha256");
        assert_eq!(at_server.cipher_c2s, "aes128-ctr");
        assert_eq!(at_server.cipher_s2c, "aes256-ctr");
        assert_eq!(at_server.mac_c2s, "hmac-sha2-256");
        assert_eq!(at_server.mac_s2c, "hmac-sha2-512");
        assert_eq!(at_server.compression_c2s, "none");
        assert_eq!(at_server.compression_s2c, "zlib");
    }

    #[test]
    fn test_local_view_helpers() {
        let n = NegotiatedAlgorithms {
            kex: "curve25519-sha256".into(),
            host_key: "ssh-ed25519".into(),
            cipher_c2s: "aes128-ctr".into(),
            cipher_s2c: "aes256-ctr".into(),
            mac_c2s: "hmac-sha2-256".into(),
            mac_s2c: "hmac-sha2-512".into(),
            compression_c2s: "none".into(),
            compression_s2c: "zlib".into(),
        };
        // Client sends c2s, receives s2c.
        assert_eq!(n.cipher_out(false), "aes128-ctr");
        assert_eq!(n.cipher_in(false), "aes256-ctr");
        // Server is the mirror image.
        assert_eq!(n.cipher_out(true), "aes256-ctr");
        assert_eq!(n.mac_in(true), "hmac-sha2-256");
        assert_eq!(n.compression_out(true), "zlib");
    }
}
