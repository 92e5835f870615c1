//! Ed25519 signing for a fixed set of named validators.

use crate::{
    tbft::types::{Endorsement, ValidatorId},
    AccessControl,
};
use bytes::Bytes;
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use std::{collections::HashMap, sync::Arc};

#[derive(Clone)]
pub struct Access {
    me: ValidatorId,
    key: SigningKey,
    directory: Arc<HashMap<Bytes, ValidatorId>>,
}

impl Access {
    /// Derive a key for each name (deterministically from its position) and share a
    /// directory mapping keys to names.
    pub fn generate(names: &[&str]) -> Vec<Self> {
        let keys: Vec<SigningKey> = (0..names.len() as u64)
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[..8].copy_from_slice(&i.to_be_bytes());
                SigningKey::from(seed)
            })
            .collect();
        let directory: HashMap<_, _> = names
            .iter()
            .zip(&keys)
            .map(|(name, key)| {
                let signer = Bytes::copy_from_slice(&key.verification_key().to_bytes());
                (signer, ValidatorId::from(*name))
            })
            .collect();
        let directory = Arc::new(directory);
        names
            .iter()
            .zip(keys)
            .map(|(name, key)| Self {
                me: ValidatorId::from(*name),
                key,
                directory: directory.clone(),
            })
            .collect()
    }
}

impl AccessControl for Access {
    fn me(&self) -> ValidatorId {
        self.me.clone()
    }

    fn sign(&mut self, message: &[u8]) -> Endorsement {
        let signature = self.key.sign(message);
        Endorsement {
            signer: Bytes::copy_from_slice(&self.key.verification_key().to_bytes()),
            signature: Bytes::copy_from_slice(&signature.to_bytes()),
        }
    }

    fn verify(&self, endorsement: &Endorsement, message: &[u8]) -> bool {
        let Ok(signer) = <[u8; 32]>::try_from(endorsement.signer.as_ref()) else {
            return false;
        };
        let Ok(key) = VerificationKey::try_from(signer) else {
            return false;
        };
        let Ok(signature) = <[u8; 64]>::try_from(endorsement.signature.as_ref()) else {
            return false;
        };
        key.verify(&Signature::from(signature), message).is_ok()
    }

    fn resolve(&self, signer: &Bytes) -> Option<ValidatorId> {
        self.directory.get(signer).cloned()
    }
}
