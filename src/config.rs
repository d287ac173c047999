//! SSH algorithm configuration constants.
//!
//! This module contains lists of supported key exchange, cipher, MAC and
//! compression algorithms, grouped by [`SecurityLevel`]: `SECURE_*` offers
//! only modern, currently-recommended algorithms, `BALANCED_*` widens that
//! to include still-common but aging ones, and `LEGACY_*` widens further for
//! compatibility with older or embedded SSH servers. [`ALL_*`] lists every
//! algorithm this crate knows how to negotiate, for diagnostics and tests.

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};

/// All key exchange algorithms this crate can negotiate, in preference order.
pub const ALL_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G18_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G15_SHA512,
    kex::DH_G17_SHA512,
    kex::NONE,
];

/// All cipher algorithms this crate can negotiate.
pub static ALL_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CLEAR,
    cipher::NONE,
];

/// All MAC (Message Authentication Code) algorithms this crate can negotiate.
pub const ALL_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
    mac::NONE,
];

/// All compression algorithms this crate can negotiate.
pub const ALL_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

/// All host key algorithms this crate can verify.
pub const ALL_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::SkEd25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// Modern algorithms only. No CBC ciphers, no SHA-1 MACs, no DH group 1/14-SHA1.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
];

pub static SECURE_CIPHERS: &[cipher::Name] = &[cipher::AES_256_GCM, cipher::CHACHA20_POLY1305];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM];

pub const SECURE_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::SkEd25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

/// Default level: secure algorithms plus a handful of still-common ones.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G18_SHA512,
    kex::DH_G14_SHA256,
];

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
];

pub const BALANCED_COMPRESSION_ALGORITHMS: &[compression::Name] =
    &[compression::NONE, compression::ZLIB];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::SkEd25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
];

/// Everything, including SHA-1 MACs, CBC ciphers and DH group 1/14-SHA1, for
/// talking to old or embedded SSH servers that offer nothing better.
pub const LEGACY_KEX_ORDER: &[kex::Name] = ALL_KEX_ORDER;

pub static LEGACY_CIPHERS: &[cipher::Name] = ALL_CIPHERS;

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = ALL_MAC_ALGORITHMS;

pub const LEGACY_COMPRESSION_ALGORITHMS: &[compression::Name] = ALL_COMPRESSION_ALGORITHMS;

pub const LEGACY_KEY_TYPES: &[Algorithm] = ALL_KEY_TYPES;

/// Default compression offered regardless of security level negotiation order.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = BALANCED_COMPRESSION_ALGORITHMS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_is_subset_of_balanced_is_subset_of_legacy() {
        for k in SECURE_KEX_ORDER {
            assert!(BALANCED_KEX_ORDER.contains(k));
        }
        for k in BALANCED_KEX_ORDER {
            assert!(LEGACY_KEX_ORDER.contains(k));
        }
    }
}
