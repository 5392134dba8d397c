//! Class registry.
//!
//! Built once per service from the service's class metadata, then frozen.
//! [`RegistryBuilder::build`] consumes the builder, so a registry that is in
//! use can no longer gain classes.

use crate::error::RuntimeResult;
use crate::instance::Instance;
use crate::keys::{ClassKey, ClassKind, InstanceKey, ServiceIdentity};
use std::collections::HashMap;
use thiserror::Error;

/// Class registration and lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another class of the same kind already uses the id.
    #[error("duplicate {kind} class id {class_id}")]
    DuplicateClassId {
        /// Kind namespace.
        kind: ClassKind,
        /// Offending id.
        class_id: u32,
    },

    /// Another class already uses the name.
    #[error("duplicate class name `{0}`")]
    DuplicateName(String),

    /// No class of the kind has the id.
    #[error("unknown {kind} class id {class_id}")]
    UnknownClassId {
        /// Kind namespace.
        kind: ClassKind,
        /// Requested id.
        class_id: u32,
    },

    /// No class has the name.
    #[error("unknown class `{0}`")]
    UnknownName(String),

    /// The class exists but is of another kind.
    #[error("class `{name}` is a {actual} class, expected {expected}")]
    WrongKind {
        /// Class name.
        name: String,
        /// Kind the caller asked for.
        expected: ClassKind,
        /// Registered kind.
        actual: ClassKind,
    },

    /// The key belongs to another service.
    #[error("{key} does not belong to {service}")]
    ForeignService {
        /// Display form of the key.
        key: String,
        /// This registry's service.
        service: String,
    },
}

/// A registered class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Application-facing name.
    pub name: String,
    /// Class key.
    pub key: ClassKey,
}

/// Collects class registrations for one service.
#[derive(Debug)]
pub struct RegistryBuilder {
    service: ServiceIdentity,
    classes: Vec<ClassInfo>,
    by_id: HashMap<(ClassKind, u32), usize>,
    by_name: HashMap<String, usize>,
}

impl RegistryBuilder {
    /// Starts an empty registry for `service`.
    pub fn new(service: ServiceIdentity) -> Self {
        Self {
            service,
            classes: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registers a class.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate name, or a duplicate id within the kind.
    pub fn register(
        mut self,
        name: impl Into<String>,
        kind: ClassKind,
        class_id: u32,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        if self.by_id.contains_key(&(kind, class_id)) {
            return Err(RegistryError::DuplicateClassId { kind, class_id });
        }
        let index = self.classes.len();
        self.by_id.insert((kind, class_id), index);
        self.by_name.insert(name.clone(), index);
        self.classes.push(ClassInfo {
            name,
            key: ClassKey::new(self.service.clone(), class_id, kind),
        });
        Ok(self)
    }

    /// Registers a record class.
    pub fn record(self, name: impl Into<String>, class_id: u32) -> Result<Self, RegistryError> {
        self.register(name, ClassKind::Record, class_id)
    }

    /// Registers a session class.
    pub fn session(self, name: impl Into<String>, class_id: u32) -> Result<Self, RegistryError> {
        self.register(name, ClassKind::Session, class_id)
    }

    /// Registers a callable class.
    pub fn callable(self, name: impl Into<String>, class_id: u32) -> Result<Self, RegistryError> {
        self.register(name, ClassKind::Callable, class_id)
    }

    /// Registers an event class.
    pub fn event(self, name: impl Into<String>, class_id: u32) -> Result<Self, RegistryError> {
        self.register(name, ClassKind::Event, class_id)
    }

    /// Freezes the registry.
    pub fn build(self) -> ClassRegistry {
        ClassRegistry {
            service: self.service,
            classes: self.classes,
            by_id: self.by_id,
            by_name: self.by_name,
        }
    }
}

/// Frozen class table for one service.
#[derive(Debug)]
pub struct ClassRegistry {
    service: ServiceIdentity,
    classes: Vec<ClassInfo>,
    by_id: HashMap<(ClassKind, u32), usize>,
    by_name: HashMap<String, usize>,
}

impl ClassRegistry {
    /// Starts a builder.
    pub fn builder(service: ServiceIdentity) -> RegistryBuilder {
        RegistryBuilder::new(service)
    }

    /// The service this registry describes.
    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True if no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Looks up a class by kind and id.
    pub fn by_id(&self, kind: ClassKind, class_id: u32) -> Result<&ClassInfo, RegistryError> {
        self.by_id
            .get(&(kind, class_id))
            .map(|&i| &self.classes[i])
            .ok_or(RegistryError::UnknownClassId { kind, class_id })
    }

    /// Looks up a class by name.
    pub fn by_name(&self, name: &str) -> Result<&ClassInfo, RegistryError> {
        self.by_name
            .get(name)
            .map(|&i| &self.classes[i])
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))
    }

    /// Looks up a class by name, requiring `kind`.
    pub fn class_key(&self, name: &str, kind: ClassKind) -> Result<&ClassKey, RegistryError> {
        let info = self.by_name(name)?;
        if info.key.kind != kind {
            return Err(RegistryError::WrongKind {
                name: name.to_string(),
                expected: kind,
                actual: info.key.kind,
            });
        }
        Ok(&info.key)
    }

    /// Key of an object in this service.
    pub fn instance_key(
        &self,
        kind: ClassKind,
        class_id: u32,
        primary_key: impl Into<String>,
    ) -> Result<InstanceKey, RegistryError> {
        Ok(self.by_id(kind, class_id)?.key.instance(primary_key))
    }

    /// Creates a bare object for `key`: primary key and kind, no properties.
    ///
    /// # Errors
    ///
    /// Fails if the key's class is not registered here.
    pub fn create_instance(&self, key: InstanceKey) -> RuntimeResult<Instance> {
        if key.service() != &self.service {
            return Err(RegistryError::ForeignService {
                key: key.to_string(),
                service: self.service.to_string(),
            }
            .into());
        }
        self.by_id(key.kind(), key.class.class_id)?;
        Ok(Instance::new(key))
    }

    /// Iterates registered classes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    fn service() -> ServiceIdentity {
        ServiceIdentity::new("svc", "v1")
    }

    #[test]
    fn ids_are_scoped_per_kind() {
        let registry = ClassRegistry::builder(service())
            .record("User", 5)
            .unwrap()
            .callable("Api", 5)
            .unwrap()
            .build();
        assert_eq!(registry.by_id(ClassKind::Record, 5).unwrap().name, "User");
        assert_eq!(registry.by_id(ClassKind::Callable, 5).unwrap().name, "Api");
        assert_eq!(
            registry.by_id(ClassKind::Session, 5),
            Err(RegistryError::UnknownClassId {
                kind: ClassKind::Session,
                class_id: 5
            })
        );
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = ClassRegistry::builder(service())
            .record("User", 5)
            .unwrap()
            .record("Account", 5)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateClassId {
                kind: ClassKind::Record,
                class_id: 5
            }
        );

        let err = ClassRegistry::builder(service())
            .record("User", 5)
            .unwrap()
            .event("User", 1)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("User".into()));
    }

    #[test]
    fn wrong_kind_lookup() {
        let registry = ClassRegistry::builder(service())
            .session("Chat", 2)
            .unwrap()
            .build();
        assert!(matches!(
            registry.class_key("Chat", ClassKind::Record),
            Err(RegistryError::WrongKind { .. })
        ));
        assert_eq!(
            registry.class_key("Chat", ClassKind::Session).unwrap().class_id,
            2
        );
    }

    #[test]
    fn create_instance_is_bare() {
        let registry = ClassRegistry::builder(service())
            .record("User", 5)
            .unwrap()
            .build();
        let key = registry.instance_key(ClassKind::Record, 5, "u1").unwrap();
        let instance = registry.create_instance(key.clone()).unwrap();
        assert_eq!(instance.key(), &key);
        assert!(instance.view().is_empty());

        let foreign = ClassKey::new(ServiceIdentity::new("other", "v1"), 5, ClassKind::Record)
            .instance("u1");
        assert!(matches!(
            registry.create_instance(foreign),
            Err(RuntimeError::Registry(RegistryError::ForeignService { .. }))
        ));
    }
}
