use std::fmt;

use serde::{Deserialize, Serialize};

/// Key family plus signature digest used for both the CA and minted leaf certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ec256Sha256,
    Ec384Sha384,
    #[serde(alias = "ecp512_sha512")]
    Ec521Sha512,
    Rsa2048Sha256,
    Rsa3072Sha384,
    Rsa4096Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Ec,
    Rsa,
}

impl KeyAlgorithm {
    pub const ALL: [KeyAlgorithm; 6] = [
        KeyAlgorithm::Ec256Sha256,
        KeyAlgorithm::Ec384Sha384,
        KeyAlgorithm::Ec521Sha512,
        KeyAlgorithm::Rsa2048Sha256,
        KeyAlgorithm::Rsa3072Sha384,
        KeyAlgorithm::Rsa4096Sha512,
    ];

    pub fn family(self) -> KeyFamily {
        match self {
            Self::Ec256Sha256 | Self::Ec384Sha384 | Self::Ec521Sha512 => KeyFamily::Ec,
            Self::Rsa2048Sha256 | Self::Rsa3072Sha384 | Self::Rsa4096Sha512 => KeyFamily::Rsa,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ec256Sha256 => "ec256_sha256",
            Self::Ec384Sha384 => "ec384_sha384",
            Self::Ec521Sha512 => "ec521_sha512",
            Self::Rsa2048Sha256 => "rsa2048_sha256",
            Self::Rsa3072Sha384 => "rsa3072_sha384",
            Self::Rsa4096Sha512 => "rsa4096_sha512",
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::Ec256Sha256
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
