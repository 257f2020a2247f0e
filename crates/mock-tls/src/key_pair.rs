use std::fmt;

use mock_core::{KeyAlgorithm, KeyFamily};
use rcgen::{KeyPair, KeyUsagePurpose, RsaKeySize, SignatureAlgorithm};
use rustls::pki_types::PrivatePkcs8KeyDer;
use uuid::Uuid;

use crate::TlsError;

/// Signature algorithm and key size behind one [`KeyAlgorithm`] value.
#[derive(Clone, Copy)]
pub struct AlgorithmSpec {
    pub algorithm: KeyAlgorithm,
    pub signature: &'static SignatureAlgorithm,
    pub key_bits: u32,
}

pub fn algorithm_spec(algorithm: KeyAlgorithm) -> AlgorithmSpec {
    let (signature, key_bits): (&'static SignatureAlgorithm, u32) = match algorithm {
        KeyAlgorithm::Ec256Sha256 => (&rcgen::PKCS_ECDSA_P256_SHA256, 256),
        KeyAlgorithm::Ec384Sha384 => (&rcgen::PKCS_ECDSA_P384_SHA384, 384),
        KeyAlgorithm::Ec521Sha512 => (&rcgen::PKCS_ECDSA_P521_SHA512, 521),
        KeyAlgorithm::Rsa2048Sha256 => (&rcgen::PKCS_RSA_SHA256, 2048),
        KeyAlgorithm::Rsa3072Sha384 => (&rcgen::PKCS_RSA_SHA384, 3072),
        KeyAlgorithm::Rsa4096Sha512 => (&rcgen::PKCS_RSA_SHA512, 4096),
    };
    AlgorithmSpec {
        algorithm,
        signature,
        key_bits,
    }
}

/// One key family's generation routine and certificate key usages.
pub trait KeyPairProvider: Send + Sync {
    fn family(&self) -> KeyFamily;

    fn generate(&self, spec: &AlgorithmSpec) -> Result<KeyPair, rcgen::Error>;

    fn leaf_key_usages(&self) -> Vec<KeyUsagePurpose>;
}

pub struct EcKeyPairProvider;

impl KeyPairProvider for EcKeyPairProvider {
    fn family(&self) -> KeyFamily {
        KeyFamily::Ec
    }

    fn generate(&self, spec: &AlgorithmSpec) -> Result<KeyPair, rcgen::Error> {
        KeyPair::generate_for(spec.signature)
    }

    fn leaf_key_usages(&self) -> Vec<KeyUsagePurpose> {
        vec![KeyUsagePurpose::DigitalSignature]
    }
}

pub struct RsaKeyPairProvider;

impl KeyPairProvider for RsaKeyPairProvider {
    fn family(&self) -> KeyFamily {
        KeyFamily::Rsa
    }

    fn generate(&self, spec: &AlgorithmSpec) -> Result<KeyPair, rcgen::Error> {
        let key_size = match spec.key_bits {
            2048 => RsaKeySize::_2048,
            3072 => RsaKeySize::_3072,
            4096 => RsaKeySize::_4096,
            _ => return Err(rcgen::Error::KeyGenerationUnavailable),
        };
        KeyPair::generate_rsa_for(spec.signature, key_size)
    }

    fn leaf_key_usages(&self) -> Vec<KeyUsagePurpose> {
        vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ]
    }
}

static EC_PROVIDER: EcKeyPairProvider = EcKeyPairProvider;
static RSA_PROVIDER: RsaKeyPairProvider = RsaKeyPairProvider;

pub fn provider_for(family: KeyFamily) -> &'static dyn KeyPairProvider {
    match family {
        KeyFamily::Ec => &EC_PROVIDER,
        KeyFamily::Rsa => &RSA_PROVIDER,
    }
}

/// A freshly generated key pair tagged with a unique id.
pub struct AsymmetricKeyPair {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub key_pair: KeyPair,
}

impl AsymmetricKeyPair {
    pub fn private_key_der(&self) -> PrivatePkcs8KeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_pair.serialize_der())
    }

    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }
}

impl fmt::Debug for AsymmetricKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsymmetricKeyPair")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

pub fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<AsymmetricKeyPair, TlsError> {
    let spec = algorithm_spec(algorithm);
    let key_pair = provider_for(algorithm.family())
        .generate(&spec)
        .map_err(|source| TlsError::KeyGeneration { algorithm, source })?;
    Ok(AsymmetricKeyPair {
        key_id: Uuid::new_v4().to_string(),
        algorithm,
        key_pair,
    })
}
