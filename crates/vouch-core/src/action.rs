//! Actions: signed, reversible intents to mutate one entity's state for one service.
//!
//! An [`Action`] is a plain value. Its behaviour (apply, reverse, interference,
//! visibility) is supplied by the module registered for its type tag; see
//! [`crate::module::ModuleRegistry`].

use crate::errors::CoreResult;
use crate::identifiers::{ActionId, EntityId, ModuleId, ServiceId};
use crate::serialization;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Opaque signature bytes
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// Signs actions before they leave the client.
///
/// The credential and signature algorithms live outside this crate.
pub trait ActionSigner: Send + Sync {
    fn sign(&self, message: &[u8]) -> Signature;
    fn verify(&self, message: &[u8], signature: &Signature) -> bool;
}

/// A typed intent to mutate state of `entity` within `service`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Assigned at creation; shared by an action and its compensations
    pub id: ActionId,
    pub entity: EntityId,
    pub service: ServiceId,
    /// Optional counterpart entity (e.g. the contact being added)
    pub recipient: Option<EntityId>,
    /// Type tag, resolved to a module by the registry
    pub module: ModuleId,
    /// Module-specific operation bytes
    pub payload: Vec<u8>,
    /// True for a compensating action produced by reversal
    pub compensating: bool,
    pub signature: Option<Signature>,
}

#[derive(Serialize)]
struct SigningView<'a> {
    id: &'a ActionId,
    entity: &'a EntityId,
    service: &'a ServiceId,
    recipient: &'a Option<EntityId>,
    module: &'a ModuleId,
    payload: &'a [u8],
    compensating: bool,
}

impl Action {
    pub fn new(
        entity: EntityId,
        service: ServiceId,
        module: ModuleId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: ActionId::new_random(),
            entity,
            service,
            recipient: None,
            module,
            payload,
            compensating: false,
            signature: None,
        }
    }

    /// Build an action from a typed module operation
    pub fn typed<Op: Serialize>(
        entity: EntityId,
        service: ServiceId,
        module: ModuleId,
        op: &Op,
    ) -> CoreResult<Self> {
        Ok(Self::new(entity, service, module, serialization::to_vec(op)?))
    }

    pub fn with_recipient(mut self, recipient: EntityId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Decode the payload as a module operation
    pub fn op<Op: DeserializeOwned>(&self) -> CoreResult<Op> {
        serialization::from_slice(&self.payload)
    }

    /// Compensating action carrying `payload`; applying this action's
    /// compensation's compensation is equivalent to applying this action.
    pub fn compensate(&self, payload: Vec<u8>) -> Action {
        Action {
            id: self.id,
            entity: self.entity,
            service: self.service.clone(),
            recipient: self.recipient,
            module: self.module.clone(),
            payload,
            compensating: !self.compensating,
            signature: None,
        }
    }

    /// True if both values describe the same intent, ignoring signatures
    pub fn same_intent(&self, other: &Action) -> bool {
        self.id == other.id
            && self.compensating == other.compensating
            && self.entity == other.entity
            && self.service == other.service
            && self.module == other.module
            && self.payload == other.payload
    }

    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> CoreResult<Vec<u8>> {
        serialization::to_vec(&SigningView {
            id: &self.id,
            entity: &self.entity,
            service: &self.service,
            recipient: &self.recipient,
            module: &self.module,
            payload: &self.payload,
            compensating: self.compensating,
        })
    }

    pub fn sign(&mut self, signer: &dyn ActionSigner) -> CoreResult<()> {
        let message = self.signing_bytes()?;
        self.signature = Some(signer.sign(&message));
        Ok(())
    }

    /// Unsigned actions never verify
    pub fn verify(&self, signer: &dyn ActionSigner) -> CoreResult<bool> {
        match &self.signature {
            Some(signature) => Ok(signer.verify(&self.signing_bytes()?, signature)),
            None => Ok(false),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorSigner(u8);

    impl ActionSigner for XorSigner {
        fn sign(&self, message: &[u8]) -> Signature {
            Signature(vec![message.iter().fold(self.0, |acc, b| acc ^ b)])
        }

        fn verify(&self, message: &[u8], signature: &Signature) -> bool {
            self.sign(message) == *signature
        }
    }

    fn sample() -> Action {
        Action::typed(
            EntityId::from_name("alice"),
            ServiceId::from("profile"),
            ModuleId::from("counter"),
            &7i64,
        )
        .unwrap()
    }

    #[test]
    fn compensate_twice_is_same_intent() {
        let action = sample();
        let reversed = action.compensate(vec![1]);
        assert!(reversed.compensating);
        let restored = reversed.compensate(action.payload.clone());
        assert!(restored.same_intent(&action));
    }

    #[test]
    fn signature_covers_payload() {
        let signer = XorSigner(0x5a);
        let mut action = sample();
        assert!(!action.verify(&signer).unwrap());
        action.sign(&signer).unwrap();
        assert!(action.verify(&signer).unwrap());

        action.payload.push(0xff);
        assert!(!action.verify(&signer).unwrap());
    }

    #[test]
    fn typed_payload_roundtrips() {
        assert_eq!(sample().op::<i64>().unwrap(), 7);
    }
}
