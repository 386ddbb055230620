//! Entry point for mounting snapshot storage of a profile.
//!
//! [`MountManager`] picks the backend for a mode, retries hash collisions
//! with a fresh salt, and decides whether a profile switch can reuse the
//! existing mount.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{CommandRunner, SystemRunner};
use crate::control::{MountContext, MountControl, MountOptions, UmountOutcome};
use crate::layout::MountLayout;
use crate::password_cache::{ensure_password_cache, PasswordCache, PidFilePasswordCache};
use crate::process::SystemProbe;
use crate::registry::BackendRegistry;
use crate::salt::SaltStore;
use crate::settings::{Settings, DEFAULT_MAX_COLLISION_RETRIES};
use crate::spec::{MountHandle, MountParams, MountSpec};
use snapkeep_common::{Error, ProfileId, Result};

struct PasswordCacheHook {
    cache: Box<dyn PasswordCache>,
    runner: Arc<dyn CommandRunner>,
    start_command: Vec<String>,
}

/// Mounts, unmounts and switches the storage of one profile.
pub struct MountManager {
    ctx: Arc<MountContext>,
    registry: BackendRegistry,
    profile: ProfileId,
    tmp_mount: bool,
    symlink_subfolder: Option<PathBuf>,
    max_collision_retries: u32,
    current: Option<MountHandle>,
    password_cache: Option<PasswordCacheHook>,
}

impl MountManager {
    /// Create a manager for `profile`.
    pub fn new(ctx: Arc<MountContext>, registry: BackendRegistry, profile: ProfileId) -> Self {
        Self {
            ctx,
            registry,
            profile,
            tmp_mount: false,
            symlink_subfolder: None,
            max_collision_retries: DEFAULT_MAX_COLLISION_RETRIES,
            current: None,
            password_cache: None,
        }
    }

    /// Build a manager backed by the real system from loaded settings.
    ///
    /// # Errors
    /// - `Config` if the collision salt file is corrupt
    pub fn from_settings(
        settings: &Settings,
        settings_path: &Path,
        pid: u32,
        profile: ProfileId,
    ) -> Result<Self> {
        let probe = Arc::new(SystemProbe);
        let salt = SaltStore::load(settings.salt_path(settings_path))?;
        let ctx = MountContext::new(
            MountLayout::new(&settings.mount_root),
            pid,
            probe.clone(),
            Arc::new(salt),
        )
        .with_lock_timing(settings.lock_timeout(), settings.lock_poll_interval());

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let subfolder = settings
            .profiles
            .get(&profile)
            .and_then(|p| p.symlink_subfolder.clone());

        let mut manager = Self::new(
            Arc::new(ctx),
            BackendRegistry::with_defaults(runner.clone()),
            profile,
        )
        .with_symlink_subfolder(subfolder)
        .with_max_collision_retries(settings.max_collision_retries);

        if settings.password_cache.enabled {
            manager = manager.with_password_cache(
                Box::new(PidFilePasswordCache::new(&settings.password_cache, probe)),
                runner,
                settings.password_cache.start_command.clone(),
            );
        }
        Ok(manager)
    }

    /// Use trial locks and symlinks.
    pub fn with_tmp_mount(mut self, tmp_mount: bool) -> Self {
        self.tmp_mount = tmp_mount;
        self
    }

    /// Point the profile symlink at a folder inside the mount.
    pub fn with_symlink_subfolder(mut self, subfolder: Option<PathBuf>) -> Self {
        self.symlink_subfolder = subfolder;
        self
    }

    /// Cap on salted retries after hash collisions.
    pub fn with_max_collision_retries(mut self, retries: u32) -> Self {
        self.max_collision_retries = retries;
        self
    }

    /// Make sure the password cache runs before password protected mounts.
    pub fn with_password_cache(
        mut self,
        cache: Box<dyn PasswordCache>,
        runner: Arc<dyn CommandRunner>,
        start_command: Vec<String>,
    ) -> Self {
        self.password_cache = Some(PasswordCacheHook {
            cache,
            runner,
            start_command,
        });
        self
    }

    /// Change the symlink subfolder used by later mounts.
    pub fn set_symlink_subfolder(&mut self, subfolder: Option<PathBuf>) {
        self.symlink_subfolder = subfolder;
    }

    pub fn profile(&self) -> &ProfileId {
        &self.profile
    }

    /// Handle of the last successful mount.
    pub fn current(&self) -> Option<MountHandle> {
        self.current
    }

    pub fn layout(&self) -> &MountLayout {
        &self.ctx.layout
    }

    /// Collision salt the next mount will use.
    pub fn salt(&self) -> u32 {
        self.ctx.salt.current()
    }

    fn options(&self, profile: &ProfileId) -> MountOptions {
        MountOptions {
            profile: profile.clone(),
            tmp_mount: self.tmp_mount,
            symlink: true,
            symlink_subfolder: self.symlink_subfolder.clone(),
        }
    }

    fn control(&self, spec: MountSpec, profile: &ProfileId) -> Result<MountControl> {
        let backend = self.registry.resolve(&spec)?;
        MountControl::new(self.ctx.clone(), spec, backend, self.options(profile))
    }

    fn control_for(&self, params: &MountParams, profile: &ProfileId) -> Result<MountControl> {
        let spec = MountSpec::new(params.clone(), self.ctx.salt.current());
        self.control(spec, profile)
    }

    /// Mount `params` for the current profile.
    ///
    /// Modes without a mount return [`MountHandle::Local`] right away.
    /// Hash collisions are retried with the bumped salt and without the
    /// pre-mount check, which already passed.
    ///
    /// # Errors
    /// - `CollisionRetriesExhausted` once the retry cap is exceeded
    /// - Any non-collision error of the attempt, unchanged
    pub async fn mount(&mut self, params: MountParams, check: bool) -> Result<MountHandle> {
        let mode = params.mode();
        if !mode.needs_mount() {
            debug!("Mode {} needs no mount", mode);
            self.current = Some(MountHandle::Local);
            return Ok(MountHandle::Local);
        }

        if mode.requires_password() {
            if let Some(hook) = &self.password_cache {
                ensure_password_cache(
                    hook.cache.as_ref(),
                    hook.runner.as_ref(),
                    &hook.start_command,
                )
                .await?;
            }
        }

        let mut check = check;
        let mut collisions = 0u32;
        loop {
            let mut control = self.control_for(&params, &self.profile)?;
            match control.mount(check).await {
                Ok(hash_id) => {
                    let handle = MountHandle::Hashed(hash_id);
                    self.current = Some(handle);
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() => {
                    collisions += 1;
                    if collisions > self.max_collision_retries {
                        return Err(Error::CollisionRetriesExhausted {
                            attempts: collisions,
                        });
                    }
                    debug!("Retrying mount after {} ({} so far)", e, collisions);
                    check = false;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unmount `handle`, or the current mount when `None`.
    ///
    /// The backend is rebuilt from the persisted umount info, so this works
    /// for mounts made by other processes too.
    pub async fn umount(&mut self, handle: Option<MountHandle>) -> Result<UmountOutcome> {
        let Some(handle) = handle.or(self.current) else {
            info!("Nothing mounted for profile {}", self.profile);
            return Ok(UmountOutcome::NotMounted);
        };
        let outcome = self.umount_handle(handle).await?;
        if self.current == Some(handle) {
            self.current = None;
        }
        Ok(outcome)
    }

    async fn umount_handle(&self, handle: MountHandle) -> Result<UmountOutcome> {
        let MountHandle::Hashed(hash_id) = handle else {
            return Ok(UmountOutcome::NotMounted);
        };

        let spec = match self.ctx.layout.read_umount_info(hash_id) {
            Ok(spec) => spec,
            Err(Error::NotFound(_)) => {
                info!("No umount info for {}, nothing to unmount", hash_id);
                return Ok(UmountOutcome::NotMounted);
            }
            Err(e) => return Err(e),
        };

        let mut control = self.control(spec, &self.profile)?;
        if control.hash_id() != hash_id {
            return Err(Error::Mount(format!(
                "umount info of {} belongs to {}",
                hash_id,
                control.hash_id()
            )));
        }
        control.umount().await
    }

    /// Switch to `new_profile` mounted with `params`.
    ///
    /// When the new spec is already mounted as `old` only the symlink moves;
    /// otherwise `old` is unmounted and `params` mounted.
    pub async fn remount(
        &mut self,
        new_profile: ProfileId,
        params: MountParams,
        old: Option<MountHandle>,
    ) -> Result<MountHandle> {
        let old = old.or(self.current);

        if !params.mode().needs_mount() {
            if let Some(old) = old {
                self.umount(Some(old)).await?;
            }
            self.profile = new_profile;
            self.current = Some(MountHandle::Local);
            return Ok(MountHandle::Local);
        }

        let old_id = match old {
            Some(MountHandle::Hashed(id)) => id,
            _ => {
                self.profile = new_profile;
                return self.mount(params, true).await;
            }
        };

        let control = self.control_for(&params, &new_profile)?;
        if control.compare_remount(old_id)? {
            info!(
                "Profile {} reuses mount {} of profile {}",
                new_profile, old_id, self.profile
            );
            control.swap_symlink(&self.profile).await?;
            self.profile = new_profile;
            self.current = Some(MountHandle::Hashed(old_id));
            return Ok(MountHandle::Hashed(old_id));
        }

        self.umount(Some(MountHandle::Hashed(old_id))).await?;
        self.profile = new_profile;
        self.mount(params, true).await
    }

    /// Validate `params` with the backend's pre-mount check only.
    pub async fn pre_mount_check(&self, params: MountParams, first_run: bool) -> Result<()> {
        if !params.mode().needs_mount() {
            return Ok(());
        }
        let spec = MountSpec::new(params, self.ctx.salt.current());
        self.registry
            .resolve(&spec)?
            .pre_mount_check(first_run)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeMounts, RecordingRunner};
    use crate::backend::{MountBackend, MountTarget};
    use crate::process::fake::FakeProbe;
    use crate::spec::{MountMode, SshParams};
    use async_trait::async_trait;
    use snapkeep_common::{HashId, Password};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const ME: u32 = 100;
    const OTHER: u32 = 200;

    fn ssh(key: &str) -> MountParams {
        MountParams::Ssh {
            ssh: SshParams {
                host: "nas".to_string(),
                port: 22,
                user: "bob".to_string(),
                path: "/srv".to_string(),
                cipher: "default".to_string(),
                private_key_file: key.to_string(),
            },
        }
    }

    fn local() -> MountParams {
        MountParams::Local {
            path: PathBuf::from("/backups"),
        }
    }

    fn fake_registry(mounts: &FakeMounts, fail_pre_check: bool) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for mode in [MountMode::Ssh, MountMode::LocalEncfs, MountMode::SshEncfs] {
            let mounts = mounts.clone();
            registry
                .register(
                    mode,
                    Box::new(move |spec: &MountSpec| -> Result<Box<dyn MountBackend>> {
                        let mut backend = FakeBackend::new(spec.mode(), mounts.clone());
                        backend.fail_pre_check = fail_pre_check;
                        Ok(Box::new(backend))
                    }),
                )
                .unwrap();
        }
        registry
    }

    fn context(root: &Path, pid: u32, probe: &FakeProbe) -> Arc<MountContext> {
        Arc::new(
            MountContext::new(
                MountLayout::new(root),
                pid,
                Arc::new(probe.clone()),
                Arc::new(SaltStore::in_memory(0)),
            )
            .with_lock_timing(Duration::from_millis(200), Duration::from_millis(10)),
        )
    }

    fn manager(
        root: &Path,
        pid: u32,
        probe: &FakeProbe,
        mounts: &FakeMounts,
        profile: &str,
    ) -> MountManager {
        MountManager::new(
            context(root, pid, probe),
            fake_registry(mounts, false),
            ProfileId::new(profile).unwrap(),
        )
    }

    fn link_exists(root: &Path, name: &str) -> bool {
        fs::symlink_metadata(root.join(name)).is_ok()
    }

    #[tokio::test]
    async fn test_local_mode_returns_sentinel() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        assert_eq!(manager.mount(local(), true).await.unwrap(), MountHandle::Local);
        assert_eq!(manager.current(), Some(MountHandle::Local));
        assert_eq!(mounts.mount_count(), 0);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
        assert_eq!(manager.umount(None).await.unwrap(), UmountOutcome::NotMounted);
    }

    #[tokio::test]
    async fn test_profiles_with_equal_specs_share_one_mount() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME, OTHER]);
        let mounts = FakeMounts::default();

        let first = manager(dir.path(), OTHER, &probe, &mounts, "1")
            .mount(ssh("/k"), true)
            .await
            .unwrap();
        let second = manager(dir.path(), ME, &probe, &mounts, "2")
            .mount(ssh("/k"), true)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(mounts.mount_count(), 1);
        assert!(link_exists(dir.path(), "1_200"));
        assert!(link_exists(dir.path(), "2_100"));
    }

    #[tokio::test]
    async fn test_collision_moves_to_salted_hash() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME, OTHER]);
        let mounts = FakeMounts::default();

        let mut first = manager(dir.path(), OTHER, &probe, &mounts, "1");
        let taken = first.mount(ssh("/k"), true).await.unwrap();
        let taken_id = taken.hash_id().unwrap();
        // A different spec now owns the directory the next mount hashes to.
        first
            .layout()
            .write_umount_info(taken_id, &MountSpec::new(ssh("/other"), 0))
            .unwrap();

        let mut second = manager(dir.path(), ME, &probe, &mounts, "1");
        let handle = second.mount(ssh("/k"), true).await.unwrap();
        let hash_id = handle.hash_id().unwrap();

        assert_ne!(handle, taken);
        assert_eq!(second.salt(), 1);
        assert_eq!(mounts.mount_count(), 2);
        assert_eq!(
            second.layout().read_umount_info(hash_id).unwrap(),
            MountSpec::new(ssh("/k"), 1)
        );
        assert!(second.layout().mount_lock_file(hash_id, ME, false).exists());
    }

    struct AlwaysMounted {
        runner: RecordingRunner,
    }

    #[async_trait]
    impl MountBackend for AlwaysMounted {
        fn mode(&self) -> MountMode {
            MountMode::Ssh
        }

        fn runner(&self) -> &dyn CommandRunner {
            &self.runner
        }

        fn is_mounted(&self, _mountpoint: &Path) -> Result<bool> {
            Ok(true)
        }

        async fn do_mount(&self, _target: &MountTarget) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_collision_retries_are_bounded() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mut registry = BackendRegistry::new();
        registry
            .register(
                MountMode::Ssh,
                Box::new(|_: &MountSpec| -> Result<Box<dyn MountBackend>> {
                    Ok(Box::new(AlwaysMounted {
                        runner: RecordingRunner::default(),
                    }))
                }),
            )
            .unwrap();
        let mut manager = MountManager::new(
            context(dir.path(), ME, &probe),
            registry,
            ProfileId::new("1").unwrap(),
        )
        .with_max_collision_retries(3);

        let err = manager.mount(ssh("/k"), true).await.unwrap_err();

        assert!(matches!(err, Error::CollisionRetriesExhausted { attempts: 4 }));
        assert_eq!(manager.salt(), 4);
        assert_eq!(manager.current(), None);
    }

    #[tokio::test]
    async fn test_umount_defaults_to_current_mount() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        let handle = manager.mount(ssh("/k"), true).await.unwrap();
        let outcome = manager.umount(None).await.unwrap();

        assert_eq!(outcome, UmountOutcome::Unmounted);
        assert_eq!(mounts.umount_count(), 1);
        assert_eq!(manager.current(), None);
        assert!(!link_exists(dir.path(), "1_100"));
        assert!(!manager
            .layout()
            .mount_lock_file(handle.hash_id().unwrap(), ME, false)
            .exists());
    }

    #[tokio::test]
    async fn test_umount_of_foreign_handle_uses_persisted_spec() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME, OTHER]);
        let mounts = FakeMounts::default();

        let handle = manager(dir.path(), OTHER, &probe, &mounts, "1")
            .mount(ssh("/k"), true)
            .await
            .unwrap();
        probe.kill(OTHER);

        let mut mine = manager(dir.path(), ME, &probe, &mounts, "1");
        assert_eq!(
            mine.umount(Some(handle)).await.unwrap(),
            UmountOutcome::Unmounted
        );
        assert_eq!(mounts.umount_count(), 1);
        assert!(!link_exists(dir.path(), "1_200"));
    }

    #[tokio::test]
    async fn test_umount_of_unknown_handle_is_noop() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        let outcome = manager
            .umount(Some(MountHandle::Hashed(HashId::from_checksum(7))))
            .await
            .unwrap();
        assert_eq!(outcome, UmountOutcome::NotMounted);
    }

    #[tokio::test]
    async fn test_remount_with_equal_spec_only_swaps_symlink() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        let old = manager.mount(ssh("/k"), true).await.unwrap();
        let new = manager
            .remount(ProfileId::new("2").unwrap(), ssh("/k"), None)
            .await
            .unwrap();

        assert_eq!(old, new);
        assert_eq!(mounts.mount_count(), 1);
        assert_eq!(mounts.umount_count(), 0);
        assert!(!link_exists(dir.path(), "1_100"));
        assert!(link_exists(dir.path(), "2_100"));
        assert_eq!(manager.profile().as_str(), "2");
    }

    #[tokio::test]
    async fn test_remount_with_other_spec_cycles_mount() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        let old = manager.mount(ssh("/k"), true).await.unwrap();
        let new = manager
            .remount(ProfileId::new("2").unwrap(), ssh("/other"), Some(old))
            .await
            .unwrap();

        assert_ne!(old, new);
        assert_eq!(mounts.mount_count(), 2);
        assert_eq!(mounts.umount_count(), 1);
        assert!(!link_exists(dir.path(), "1_100"));
        assert!(link_exists(dir.path(), "2_100"));
        assert_eq!(manager.current(), Some(new));
    }

    #[tokio::test]
    async fn test_remount_to_local_unmounts_old() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        manager.mount(ssh("/k"), true).await.unwrap();
        let new = manager
            .remount(ProfileId::new("2").unwrap(), local(), None)
            .await
            .unwrap();

        assert_eq!(new, MountHandle::Local);
        assert_eq!(mounts.umount_count(), 1);
        assert!(!link_exists(dir.path(), "1_100"));
    }

    #[tokio::test]
    async fn test_remount_from_local_mounts_new() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1");

        let new = manager
            .remount(ProfileId::new("2").unwrap(), ssh("/k"), Some(MountHandle::Local))
            .await
            .unwrap();

        assert!(new.hash_id().is_some());
        assert_eq!(mounts.mount_count(), 1);
        assert!(link_exists(dir.path(), "2_100"));
    }

    #[tokio::test]
    async fn test_pre_mount_check_delegates_to_backend() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let manager = MountManager::new(
            context(dir.path(), ME, &probe),
            fake_registry(&mounts, true),
            ProfileId::new("1").unwrap(),
        );

        assert!(manager.pre_mount_check(ssh("/k"), true).await.is_err());
        assert!(manager.pre_mount_check(local(), true).await.is_ok());
        assert_eq!(mounts.mount_count(), 0);
    }

    struct StoppedCache;

    impl PasswordCache for StoppedCache {
        fn status(&self) -> bool {
            false
        }

        fn check_version(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_password_modes_start_password_cache() {
        let dir = TempDir::new().unwrap();
        let probe = FakeProbe::with_alive(&[ME]);
        let mounts = FakeMounts::default();
        let runner = RecordingRunner::default();
        let mut manager = manager(dir.path(), ME, &probe, &mounts, "1").with_password_cache(
            Box::new(StoppedCache),
            Arc::new(runner.clone()),
            vec!["snapkeep-pwcache".to_string(), "start".to_string()],
        );

        manager.mount(ssh("/k"), true).await.unwrap();
        assert!(runner.lines().is_empty());

        let encfs = MountParams::LocalEncfs {
            path: PathBuf::from("/crypt"),
            password: None,
        }
        .with_password(Password::new("secret"));
        manager.mount(encfs, true).await.unwrap();
        assert_eq!(runner.lines(), vec!["snapkeep-pwcache start".to_string()]);
    }

    #[test]
    fn test_from_settings_reads_salt_and_subfolder() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        fs::write(dir.path().join("hash_collision"), "3").unwrap();
        let mut settings = Settings {
            mount_root: dir.path().join("mnt"),
            ..Settings::default()
        };
        settings.profiles.insert(
            ProfileId::new("1").unwrap(),
            crate::settings::ProfileSettings {
                params: ssh("/k"),
                symlink_subfolder: Some(PathBuf::from("host/user/1")),
            },
        );

        let manager =
            MountManager::from_settings(&settings, &settings_path, ME, ProfileId::new("1").unwrap())
                .unwrap();

        assert_eq!(manager.salt(), 3);
        assert_eq!(manager.layout().root(), dir.path().join("mnt").as_path());
        assert_eq!(
            manager.symlink_subfolder,
            Some(PathBuf::from("host/user/1"))
        );
    }
}
