use std::sync::Arc;
use std::time::SystemTime;

/// A live runtime object paired with the configuration it was built from.
///
/// Registries (clusters, listeners, route configurations) store one of these
/// per name so admin dumps can show what is running and since when.
pub struct ObjectConfig<T, C> {
    pub object: T,
    pub config: Arc<C>,
    pub last_updated: SystemTime,
}

impl<T, C> ObjectConfig<T, C> {
    pub fn new(object: T, config: C) -> Self {
        Self {
            object,
            config: Arc::new(config),
            last_updated: SystemTime::now(),
        }
    }

    /// Seconds since the unix epoch, for dumps.
    pub fn last_updated_secs(&self) -> u64 {
        self.last_updated
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl<T: Clone, C> Clone for ObjectConfig<T, C> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            config: self.config.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Static = 0,
    Dynamic = 3,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Static => "static",
            ObjectKind::Dynamic => "dynamic",
        }
    }
}
