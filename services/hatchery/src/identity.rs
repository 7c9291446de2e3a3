//! The hatchery's own registration record.
//!
//! Static fields come from the configuration; the job server assigns the id.
//! An id of zero means the hatchery must register (again).

use std::sync::atomic::{AtomicI64, Ordering};

use hatchery_sdk::{GroupId, HatcheryId, HatcheryIdentity, ModelType};

use crate::config::Config;

/// Identity shared by every loop of one engine.
#[derive(Debug)]
pub struct Identity {
    id: AtomicI64,
    name: String,
    group_id: GroupId,
    model_type: ModelType,
    shared_infra: bool,
    public_key: String,
}

impl Identity {
    pub fn new(config: &Config, public_key: String) -> Self {
        Self {
            id: AtomicI64::new(0),
            name: config.name.clone(),
            group_id: config.group_id,
            model_type: config.model_type,
            shared_infra: config.shared_infra,
            public_key,
        }
    }

    pub fn id(&self) -> HatcheryId {
        HatcheryId::new(self.id.load(Ordering::SeqCst))
    }

    pub fn is_registered(&self) -> bool {
        !self.id().is_unset()
    }

    pub fn set_id(&self, id: HatcheryId) {
        self.id.store(id.get(), Ordering::SeqCst);
    }

    /// Forget the registration; the next heartbeat registers again.
    pub fn reset(&self) {
        self.id.store(0, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Record sent to the job server on registration.
    pub fn to_record(&self) -> HatcheryIdentity {
        HatcheryIdentity {
            id: self.id(),
            name: self.name.clone(),
            group_id: self.group_id,
            model_type: self.model_type,
            shared_infra: self.shared_infra,
            public_key: self.public_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_starts_unregistered() {
        let identity = Identity::new(&Config::default(), "pk".to_string());
        assert!(!identity.is_registered());

        identity.set_id(HatcheryId::new(12));
        assert!(identity.is_registered());
        assert_eq!(identity.to_record().id, HatcheryId::new(12));
        assert_eq!(identity.to_record().public_key, "pk");

        identity.reset();
        assert!(!identity.is_registered());
    }
}
