//! snapkeep CLI - mount snapshot storage from scripts and cron jobs.
//!
//! Every invocation acts as its own process for locking purposes: mount
//! locks and symlinks are named after this process's pid.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use snapkeep_common::{Password, ProfileId};
use snapkeep_mount::{
    compute_hash, MountHandle, MountManager, MountParams, MountSpec, Settings, UmountOutcome,
};

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "snapkeep - Mount snapshot storage for backup profiles")]
#[command(version)]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/snapkeep/settings.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the storage of a profile.
    Mount {
        /// Profile to mount.
        #[arg(short, long)]
        profile: String,

        /// Skip the pre-mount check.
        #[arg(long)]
        no_check: bool,

        /// Trial mount with separate locks and symlinks.
        #[arg(long)]
        tmp: bool,

        /// Stay alive until Ctrl+C, then unmount.
        #[arg(long)]
        hold: bool,
    },

    /// Unmount the storage of a profile.
    Umount {
        /// Profile whose symlink is removed.
        #[arg(short, long)]
        profile: String,

        /// Mount handle ("local" or hash id); derived from the profile if omitted.
        #[arg(long)]
        hash: Option<String>,
    },

    /// Switch from one profile's mount to another's.
    Remount {
        /// Profile currently mounted.
        #[arg(long)]
        from_profile: String,

        /// Profile to switch to.
        #[arg(short, long)]
        profile: String,

        /// Handle of the current mount; derived from the old profile if omitted.
        #[arg(long)]
        from: Option<String>,
    },

    /// Validate a profile's configuration without mounting.
    Check {
        /// Profile to check.
        #[arg(short, long)]
        profile: String,

        /// Treat this as the first use of the storage.
        #[arg(long)]
        first_run: bool,
    },

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "snapkeep", &mut io::stdout());
        return Ok(());
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => Settings::default_path().context("Failed to locate settings")?,
    };
    let settings = Settings::load(&config_path).context("Failed to load settings")?;

    match cli.command {
        Commands::Mount {
            profile,
            no_check,
            tmp,
            hold,
        } => cmd_mount(&settings, &config_path, &profile, !no_check, tmp, hold).await,

        Commands::Umount { profile, hash } => {
            cmd_umount(&settings, &config_path, &profile, hash.as_deref()).await
        }

        Commands::Remount {
            from_profile,
            profile,
            from,
        } => cmd_remount(&settings, &config_path, &from_profile, &profile, from.as_deref()).await,

        Commands::Check { profile, first_run } => {
            cmd_check(&settings, &config_path, &profile, first_run).await
        }

        Commands::Completions { .. } => Ok(()),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Password> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Password::new(password))
}

fn parse_profile(id: &str) -> Result<ProfileId> {
    ProfileId::new(id).context("Invalid profile id")
}

/// Parameters of a profile, with the password asked for when needed.
fn profile_params(settings: &Settings, profile: &ProfileId) -> Result<MountParams> {
    let params = settings
        .profile(profile)
        .context("Unknown profile")?
        .params
        .clone();
    if params.mode().requires_password() && params.password().is_none() {
        let password = prompt_password(&format!("Password for profile {}: ", profile))?;
        return Ok(params.with_password(password));
    }
    Ok(params)
}

fn manager(settings: &Settings, config_path: &Path, profile: ProfileId) -> Result<MountManager> {
    MountManager::from_settings(settings, config_path, std::process::id(), profile)
        .context("Failed to set up mount manager")
}

/// Handle given on the command line, or the one the profile would mount as.
fn resolve_handle(
    manager: &MountManager,
    settings: &Settings,
    profile: &ProfileId,
    given: Option<&str>,
) -> Result<MountHandle> {
    if let Some(text) = given {
        return text.parse::<MountHandle>().context("Invalid mount handle");
    }
    let params = settings.profile(profile).context("Unknown profile")?.params.clone();
    if !params.mode().needs_mount() {
        return Ok(MountHandle::Local);
    }
    let spec = MountSpec::new(params, manager.salt());
    Ok(MountHandle::Hashed(
        compute_hash(&spec).context("Failed to compute hash id")?,
    ))
}

/// Mount a profile.
async fn cmd_mount(
    settings: &Settings,
    config_path: &Path,
    profile: &str,
    check: bool,
    tmp: bool,
    hold: bool,
) -> Result<()> {
    let profile = parse_profile(profile)?;
    let params = profile_params(settings, &profile)?;
    let mut manager = manager(settings, config_path, profile.clone())?.with_tmp_mount(tmp);

    info!("Mounting profile {}", profile);
    let handle = manager
        .mount(params, check)
        .await
        .context("Failed to mount")?;
    println!("{}", handle);

    if hold {
        println!("Press Ctrl+C to unmount.");
        tokio::signal::ctrl_c().await?;
        manager
            .umount(Some(handle))
            .await
            .context("Failed to unmount")?;
    }
    Ok(())
}

/// Unmount a profile's storage.
async fn cmd_umount(
    settings: &Settings,
    config_path: &Path,
    profile: &str,
    hash: Option<&str>,
) -> Result<()> {
    let profile = parse_profile(profile)?;
    let mut manager = manager(settings, config_path, profile.clone())?;
    let handle = resolve_handle(&manager, settings, &profile, hash)?;

    let outcome = manager
        .umount(Some(handle))
        .await
        .context("Failed to unmount")?;
    match outcome {
        UmountOutcome::Unmounted => println!("Unmounted {}", handle),
        UmountOutcome::NotMounted => println!("{} was not mounted", handle),
        UmountOutcome::StillInUse => println!("{} is still in use, kept mounted", handle),
    }
    Ok(())
}

/// Switch from one profile to another.
async fn cmd_remount(
    settings: &Settings,
    config_path: &Path,
    from_profile: &str,
    profile: &str,
    from: Option<&str>,
) -> Result<()> {
    let from_profile = parse_profile(from_profile)?;
    let profile = parse_profile(profile)?;
    let params = profile_params(settings, &profile)?;

    let mut manager = manager(settings, config_path, from_profile.clone())?;
    let old = resolve_handle(&manager, settings, &from_profile, from)?;
    manager.set_symlink_subfolder(
        settings
            .profile(&profile)
            .context("Unknown profile")?
            .symlink_subfolder
            .clone(),
    );

    let handle = manager
        .remount(profile, params, Some(old))
        .await
        .context("Failed to remount")?;
    println!("{}", handle);
    Ok(())
}

/// Validate a profile's configuration.
async fn cmd_check(
    settings: &Settings,
    config_path: &Path,
    profile: &str,
    first_run: bool,
) -> Result<()> {
    let profile = parse_profile(profile)?;
    let params = profile_params(settings, &profile)?;
    let manager = manager(settings, config_path, profile.clone())?;

    manager
        .pre_mount_check(params, first_run)
        .await
        .context("Check failed")?;
    println!("Profile {} is ready to mount", profile);
    Ok(())
}
