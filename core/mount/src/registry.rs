//! Backend registry mapping mount modes to backend factories.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{CommandRunner, MountBackend};
use crate::backends::{EncfsBackend, SshBackend, SshEncfsBackend};
use crate::spec::{MountMode, MountSpec};
use snapkeep_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(&MountSpec) -> Result<Box<dyn MountBackend>> + Send + Sync>;

/// Registry for mount backend factories.
///
/// Resolved once when the orchestrator is built; afterwards every mount
/// attempt asks it for a fresh backend.
pub struct BackendRegistry {
    factories: HashMap<MountMode, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the sshfs and encfs backends, all sharing `runner`.
    pub fn with_defaults(runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self::new();

        let ssh_runner = runner.clone();
        registry.factories.insert(
            MountMode::Ssh,
            Box::new(move |spec: &MountSpec| -> Result<Box<dyn MountBackend>> {
                Ok(Box::new(SshBackend::from_spec(spec, ssh_runner.clone())?))
            }),
        );

        let encfs_runner = runner.clone();
        registry.factories.insert(
            MountMode::LocalEncfs,
            Box::new(move |spec: &MountSpec| -> Result<Box<dyn MountBackend>> {
                Ok(Box::new(EncfsBackend::from_spec(spec, encfs_runner.clone())?))
            }),
        );

        registry.factories.insert(
            MountMode::SshEncfs,
            Box::new(move |spec: &MountSpec| -> Result<Box<dyn MountBackend>> {
                Ok(Box::new(SshEncfsBackend::from_spec(spec, runner.clone())?))
            }),
        );

        registry
    }

    /// Register a backend factory.
    ///
    /// # Preconditions
    /// - `mode` must need a mount
    /// - `mode` must not be registered yet
    ///
    /// # Errors
    /// - `InvalidInput` for modes that never mount
    /// - `AlreadyExists` if the mode is already registered
    pub fn register(&mut self, mode: MountMode, factory: BackendFactory) -> Result<()> {
        if !mode.needs_mount() {
            return Err(Error::InvalidInput(format!(
                "Mode '{}' does not mount anything",
                mode
            )));
        }
        if self.factories.contains_key(&mode) {
            return Err(Error::AlreadyExists(format!(
                "Backend for '{}' is already registered",
                mode
            )));
        }
        self.factories.insert(mode, factory);
        Ok(())
    }

    /// Create the backend for a spec.
    ///
    /// # Errors
    /// - No backend registered for the spec's mode
    /// - Spec parameters do not fit the backend
    pub fn resolve(&self, spec: &MountSpec) -> Result<Box<dyn MountBackend>> {
        let mode = spec.mode();
        let factory = self.factories.get(&mode).ok_or_else(|| {
            Error::NotFound(format!("No backend registered for mode '{}'", mode))
        })?;
        factory(spec)
    }

    /// Registered modes.
    pub fn modes(&self) -> Vec<MountMode> {
        let mut modes: Vec<MountMode> = self.factories.keys().copied().collect();
        modes.sort();
        modes
    }

    /// Check if a mode has a backend.
    pub fn has_backend(&self, mode: MountMode) -> bool {
        self.factories.contains_key(&mode)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeMounts, RecordingRunner};
    use crate::spec::{MountParams, SshParams};
    use std::path::PathBuf;

    fn ssh_spec() -> MountSpec {
        MountSpec::new(
            MountParams::Ssh {
                ssh: SshParams {
                    host: "h".to_string(),
                    port: 22,
                    user: "u".to_string(),
                    path: "/p".to_string(),
                    cipher: "default".to_string(),
                    private_key_file: String::new(),
                },
            },
            0,
        )
    }

    #[test]
    fn test_defaults_cover_every_mounting_mode() {
        let registry = BackendRegistry::with_defaults(Arc::new(RecordingRunner::default()));
        assert_eq!(
            registry.modes(),
            vec![MountMode::Ssh, MountMode::LocalEncfs, MountMode::SshEncfs]
        );
        assert!(!registry.has_backend(MountMode::Local));
        assert_eq!(registry.resolve(&ssh_spec()).unwrap().mode(), MountMode::Ssh);
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = BackendRegistry::new();
        let mounts = FakeMounts::default();
        registry
            .register(
                MountMode::Ssh,
                Box::new(move |_: &MountSpec| -> Result<Box<dyn MountBackend>> {
                    Ok(Box::new(FakeBackend::new(MountMode::Ssh, mounts.clone())))
                }),
            )
            .unwrap();

        assert!(registry.resolve(&ssh_spec()).is_ok());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = BackendRegistry::with_defaults(Arc::new(RecordingRunner::default()));
        let result = registry.register(
            MountMode::Ssh,
            Box::new(|_: &MountSpec| -> Result<Box<dyn MountBackend>> {
                Ok(Box::new(FakeBackend::new(MountMode::Ssh, FakeMounts::default())))
            }),
        );
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_local_mode_cannot_be_registered_or_resolved() {
        let mut registry = BackendRegistry::new();
        let result = registry.register(
            MountMode::Local,
            Box::new(|_: &MountSpec| -> Result<Box<dyn MountBackend>> {
                Ok(Box::new(FakeBackend::new(MountMode::Local, FakeMounts::default())))
            }),
        );
        assert!(result.is_err());

        let local = MountSpec::new(
            MountParams::Local {
                path: PathBuf::from("/backups"),
            },
            0,
        );
        assert!(matches!(registry.resolve(&local), Err(Error::NotFound(_))));
    }
}
