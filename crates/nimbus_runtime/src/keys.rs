//! Identity keys for services, classes, remote objects, and event streams.

use std::fmt;
use std::sync::Arc;

/// One deployed service build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    id: Arc<str>,
    version: Arc<str>,
}

impl ServiceIdentity {
    /// Creates a service identity.
    pub fn new(id: impl Into<Arc<str>>, version: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Service id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Service build version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// True if a message addressed to `(id, version)` targets this build.
    pub fn matches(&self, id: &str, version: &str) -> bool {
        *self.id == *id && *self.version == *version
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// What a class describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Versioned, persisted record.
    Record,
    /// Opaque session handle.
    Session,
    /// Remote object exposing methods.
    Callable,
    /// Notification type.
    Event,
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClassKind::Record => "record",
            ClassKind::Session => "session",
            ClassKind::Callable => "callable",
            ClassKind::Event => "event",
        })
    }
}

/// A class within a service. Class ids are scoped per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    /// Owning service.
    pub service: ServiceIdentity,
    /// Service-scoped id.
    pub class_id: u32,
    /// Kind of class.
    pub kind: ClassKind,
}

impl ClassKey {
    /// Creates a class key.
    pub fn new(service: ServiceIdentity, class_id: u32, kind: ClassKind) -> Self {
        Self {
            service,
            class_id,
            kind,
        }
    }

    /// Key of the object with `primary_key` in this class.
    pub fn instance(&self, primary_key: impl Into<String>) -> InstanceKey {
        InstanceKey::new(self.clone(), primary_key)
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.service, self.kind, self.class_id)
    }
}

/// One remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// Class of the object.
    pub class: ClassKey,
    /// Primary key, or session id for sessions.
    pub primary_key: String,
}

impl InstanceKey {
    /// Creates an instance key.
    pub fn new(class: ClassKey, primary_key: impl Into<String>) -> Self {
        Self {
            class,
            primary_key: primary_key.into(),
        }
    }

    /// Kind of the object.
    pub fn kind(&self) -> ClassKind {
        self.class.kind
    }

    /// Owning service.
    pub fn service(&self) -> &ServiceIdentity {
        &self.class.service
    }

    /// Records and callables are version-tracked; sessions are not.
    pub fn is_version_tracked(&self) -> bool {
        matches!(self.class.kind, ClassKind::Record | ClassKind::Callable)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.primary_key)
    }
}

/// One subscribable event stream: an event class raised by one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventChannelKey {
    /// Event class.
    pub event_class: ClassKey,
    /// Record or callable raising the event.
    pub source: InstanceKey,
}

impl EventChannelKey {
    /// Creates a channel key.
    pub fn new(event_class: ClassKey, source: InstanceKey) -> Self {
        Self {
            event_class,
            source,
        }
    }
}

impl fmt::Display for EventChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.event_class, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_compare_by_value() {
        let svc = ServiceIdentity::new("svc", "v1");
        let users = ClassKey::new(svc.clone(), 5, ClassKind::Record);
        let a = users.instance("u1");
        let b = ClassKey::new(ServiceIdentity::new("svc", "v1"), 5, ClassKind::Record).instance("u1");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        // Same id, different kind.
        let callable = ClassKey::new(svc, 5, ClassKind::Callable).instance("u1");
        assert!(!set.contains(&callable));
    }

    #[test]
    fn display_forms() {
        let key = ClassKey::new(ServiceIdentity::new("svc", "v2"), 5, ClassKind::Record).instance("u1");
        assert_eq!(key.to_string(), "svc@v2/record:5/u1");
        assert!(key.is_version_tracked());
    }

    #[test]
    fn service_matching() {
        let svc = ServiceIdentity::new("svc", "v2");
        assert!(svc.matches("svc", "v2"));
        assert!(!svc.matches("svc", "v1"));
        assert!(!svc.matches("other", "v2"));
    }
}
