//! Action encoding.
//!
//! Decoding binds an action to the role that will act on it and rejects
//! malformed payloads, unknown type tags, types the service does not serve and
//! actions addressed to a different entity.

use crate::action::Action;
use crate::errors::{CoreError, CoreResult};
use crate::identifiers::RoleBinding;
use crate::module::ModuleRegistry;
use crate::serialization;
use std::sync::Arc;

pub trait ActionCodec: Send + Sync {
    fn encode(&self, action: &Action) -> CoreResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8], role: &RoleBinding) -> CoreResult<Action>;
}

/// bincode codec that validates against a module registry
#[derive(Debug, Clone)]
pub struct RegistryCodec {
    registry: Arc<ModuleRegistry>,
}

impl RegistryCodec {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }
}

impl ActionCodec for RegistryCodec {
    fn encode(&self, action: &Action) -> CoreResult<Vec<u8>> {
        serialization::to_vec(action)
    }

    fn decode(&self, bytes: &[u8], role: &RoleBinding) -> CoreResult<Action> {
        let action: Action = serialization::from_slice(bytes)?;
        if action.entity != role.entity {
            return Err(CoreError::WrongEntity {
                expected: role.entity,
                actual: action.entity,
            });
        }
        self.registry.resolve(&action)?.validate(&action)?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::identifiers::{EntityId, ModuleId, RoleId, ServiceId};
    use crate::module::{ApplyOutcome, Module};
    use crate::visibility::Visibility;

    struct Flag;

    impl Module for Flag {
        type State = bool;
        type Op = bool;

        fn id(&self) -> ModuleId {
            ModuleId::from("flag")
        }

        fn apply(&self, state: &mut bool, op: &bool) -> ApplyOutcome {
            *state = *op;
            ApplyOutcome::Applied
        }

        fn reverse(&self, op: &bool) -> bool {
            !op
        }

        fn interferes_with(&self, _pending: &bool, _incoming: &bool) -> bool {
            true
        }

        fn required_visibility(&self, _action: &Action, _op: &bool) -> Visibility {
            Visibility::public()
        }
    }

    fn codec() -> RegistryCodec {
        let mut registry = ModuleRegistry::new();
        registry.register("settings", Flag);
        RegistryCodec::new(Arc::new(registry))
    }

    fn binding(entity: &str) -> RoleBinding {
        RoleBinding::new(RoleId::from_name("phone"), EntityId::from_name(entity))
    }

    fn flag_action(module: &str, payload: Vec<u8>) -> Action {
        Action::new(
            EntityId::from_name("alice"),
            ServiceId::from("settings"),
            ModuleId::from(module),
            payload,
        )
    }

    #[test]
    fn decode_accepts_registered_type() {
        let codec = codec();
        let action = flag_action("flag", vec![1]);
        let bytes = codec.encode(&action).unwrap();
        assert_eq!(codec.decode(&bytes, &binding("alice")).unwrap(), action);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let codec = codec();
        let bytes = codec.encode(&flag_action("mystery", vec![1])).unwrap();
        assert!(matches!(
            codec.decode(&bytes, &binding("alice")),
            Err(CoreError::UnknownType { .. })
        ));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let codec = codec();
        let bytes = codec.encode(&flag_action("flag", vec![])).unwrap();
        assert!(matches!(
            codec.decode(&bytes, &binding("alice")),
            Err(CoreError::Malformed { .. })
        ));
        assert!(matches!(
            codec.decode(&[0xde, 0xad], &binding("alice")),
            Err(CoreError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_rejects_foreign_entity() {
        let codec = codec();
        let bytes = codec.encode(&flag_action("flag", vec![1])).unwrap();
        assert!(matches!(
            codec.decode(&bytes, &binding("bob")),
            Err(CoreError::WrongEntity { .. })
        ));
    }
}
