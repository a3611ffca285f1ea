//! Algorithm-qualified content digests.
//!
//! A digest is written `"<algorithm>:<hex>"`, e.g.
//! `sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9`.
//! Parsing validates both parts once so that comparisons and map lookups
//! never need to re-examine the string.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

use crate::errors::{ContentError, Result};

/// The hash algorithms this crate can compute and verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the registry default.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The canonical lowercase name used in digest strings and on-disk
    /// layout directories.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding of this algorithm's output.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Starts a streaming hasher for this algorithm.
    pub fn digester(&self) -> Digester {
        match self {
            Algorithm::Sha256 => Digester {
                inner: Hasher::Sha256(Sha256::new()),
            },
            Algorithm::Sha512 => Digester {
                inner: Hasher::Sha512(Sha512::new()),
            },
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(ContentError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

/// An algorithm-qualified digest, validated at construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parses and validates a digest string of the form `<algorithm>:<hex>`.
    pub fn parse(s: &str) -> Result<Digest> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| ContentError::InvalidDigest {
            digest: s.to_owned(),
            reason: "missing ':' separator",
        })?;
        let algorithm: Algorithm = algorithm.parse()?;
        if hex.len() != algorithm.hex_len() {
            return Err(ContentError::InvalidDigest {
                digest: s.to_owned(),
                reason: "hex length does not match the algorithm",
            });
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ContentError::InvalidDigest {
                digest: s.to_owned(),
                reason: "hex contains characters outside [0-9a-f]",
            });
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }

    /// Computes the digest of an in-memory byte slice.
    pub fn from_bytes(algorithm: Algorithm, bytes: &[u8]) -> Digest {
        let mut digester = algorithm.digester();
        digester.update(bytes);
        digester.finalize()
    }

    /// Computes the digest of everything `reader` yields.
    pub async fn from_reader<R>(algorithm: Algorithm, mut reader: R) -> Result<Digest>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        let mut digester = algorithm.digester();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await.map_err(ContentError::Io)?;
            if n == 0 {
                return Ok(digester.finalize());
            }
            digester.update(&buf[..n]);
        }
    }

    /// The algorithm half of the digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex half of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Clone for Hasher {
    fn clone(&self) -> Self {
        match self {
            Hasher::Sha256(h) => Hasher::Sha256(h.clone()),
            Hasher::Sha512(h) => Hasher::Sha512(h.clone()),
        }
    }
}

/// A streaming hasher producing a [`Digest`].
#[derive(Clone)]
pub struct Digester {
    inner: Hasher,
}

impl Digester {
    /// Feeds more bytes into the hash state.
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    /// Consumes the hasher and returns the digest of everything fed so far.
    pub fn finalize(self) -> Digest {
        match self.inner {
            Hasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }

    /// The digest of the bytes fed so far, without consuming the hasher.
    pub fn current(&self) -> Digest {
        self.clone().finalize()
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.inner {
            Hasher::Sha256(_) => Algorithm::Sha256,
            Hasher::Sha512(_) => Algorithm::Sha512,
        };
        f.debug_struct("Digester").field("algorithm", &algorithm).finish()
    }
}

/// Pairs a streaming hasher with a declared digest.
///
/// Feed the stream through [`Verifier::update`]; [`Verifier::verified`]
/// reports whether the bytes so far hash to the declared digest. Until the
/// full content has been fed it simply returns `false`.
#[derive(Clone, Debug)]
pub struct Verifier {
    digester: Digester,
    expected: Digest,
}

impl Verifier {
    /// Creates a verifier for the given declared digest.
    pub fn new(expected: Digest) -> Verifier {
        Verifier {
            digester: expected.algorithm().digester(),
            expected,
        }
    }

    /// Resumes verification with a digester already seeded with a prefix of
    /// the content.
    pub fn resume(expected: Digest, digester: Digester) -> Verifier {
        Verifier { digester, expected }
    }

    /// Feeds more content bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.digester.update(bytes);
    }

    /// The digest the verifier was constructed with.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// The digest of the bytes fed so far.
    pub fn computed(&self) -> Digest {
        self.digester.current()
    }

    /// Whether the bytes fed so far hash to the declared digest.
    pub fn verified(&self) -> bool {
        self.computed() == self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str =
        "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_SHA512: &str = "sha512:309ecc489c12d6eb4cc40f50c902f2b4d0ed77ee511a7c7a9bcd3ca86d4cd86f989dd35bc5ff499670da34255b45b0cfd830e81f605dcf7dc5542e93ae9cd76f";

    #[test]
    fn parses_and_round_trips_both_algorithms() {
        for s in [HELLO_SHA256, HELLO_SHA512] {
            let digest = Digest::parse(s).expect("digest should parse");
            assert_eq!(s, digest.to_string());
        }
        let digest = Digest::parse(HELLO_SHA256).unwrap();
        assert_eq!(Algorithm::Sha256, digest.algorithm());
        assert_eq!(64, digest.hex().len());
    }

    #[test]
    fn rejects_malformed_digests() {
        let err = Digest::parse("sha256_nocolon").unwrap_err();
        assert!(matches!(err, ContentError::InvalidDigest { .. }));

        let err = Digest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap_err();
        assert!(matches!(err, ContentError::UnsupportedAlgorithm(_)));

        let err = Digest::parse("sha256:abc123").unwrap_err();
        assert!(matches!(err, ContentError::InvalidDigest { .. }));

        let upper = HELLO_SHA256.to_uppercase().replace("SHA256", "sha256");
        let err = Digest::parse(&upper).unwrap_err();
        assert!(matches!(err, ContentError::InvalidDigest { .. }));
    }

    #[tokio::test]
    async fn digests_a_reader() -> anyhow::Result<()> {
        let digest =
            Digest::from_reader(Algorithm::Sha256, std::io::Cursor::new(&b"hello world"[..]))
                .await?;
        assert_eq!(HELLO_SHA256, digest.to_string());
        Ok(())
    }

    #[test]
    fn digests_bytes() {
        let digest = Digest::from_bytes(Algorithm::Sha256, b"hello world");
        assert_eq!(HELLO_SHA256, digest.to_string());

        let digest = Digest::from_bytes(Algorithm::Sha512, b"hello world");
        assert_eq!(HELLO_SHA512, digest.to_string());
    }

    #[test]
    fn verifier_flips_only_at_end_of_content() {
        let expected = Digest::parse(HELLO_SHA256).unwrap();
        let mut verifier = Verifier::new(expected);
        verifier.update(b"hello ");
        assert!(!verifier.verified());
        verifier.update(b"world");
        assert!(verifier.verified());
        verifier.update(b"!");
        assert!(!verifier.verified());
    }

    #[test]
    fn serde_round_trip() {
        let digest = Digest::parse(HELLO_SHA256).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(format!("\"{}\"", HELLO_SHA256), json);
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }
}
