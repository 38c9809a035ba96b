//! One-time process bootstrap run before the job engine is built:
//! daemonization, privilege drop and the PID file.
use fs2::FileExt;
use nix::{
    sys::stat::{Mode, umask},
    unistd::{Group, User, geteuid, setgid, setuid},
};
use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::io::IntoRawFd,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const PID_FILE_NAME: &str = "marched.pid";

/// Errors raised while preparing the daemon process.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("another instance holds {}", .0.display())]
    AlreadyRunning(PathBuf),
}

/// Switches to the configured group and user when running as root.
///
/// The group is changed first, while we still have the privilege to do so.
pub fn set_user(user: Option<&str>, group: Option<&str>) -> Result<(), BootstrapError> {
    if !geteuid().is_root() {
        debug!("not running as root; keeping current user");
        return Ok(());
    }

    if let Some(group) = group {
        let entry =
            Group::from_name(group)?.ok_or_else(|| BootstrapError::UnknownGroup(group.into()))?;
        setgid(entry.gid)?;
    }

    if let Some(user) = user {
        let entry =
            User::from_name(user)?.ok_or_else(|| BootstrapError::UnknownUser(user.into()))?;
        setuid(entry.uid)?;
        if env::var_os("HOME").is_some() {
            unsafe {
                env::set_var("HOME", &entry.dir);
            }
        }
    }

    Ok(())
}

/// Detaches from the controlling terminal with the classic double fork.
pub fn daemonize() -> Result<(), BootstrapError> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    let _ = umask(Mode::from_bits_truncate(0o002));
    nix::unistd::setsid()?;

    match unsafe { libc::fork() } {
        pid if pid > 0 => std::process::exit(0),
        pid if pid < 0 => warn!("second fork failed: {}", io::Error::last_os_error()),
        _ => {}
    }

    let devnull = File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}

/// Locked `marched.pid`, removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Creates the PID file in `dir`, failing if another process holds it.
    pub fn acquire(dir: &Path) -> Result<Self, BootstrapError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(PID_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        FileExt::try_lock_exclusive(&file)
            .map_err(|_| BootstrapError::AlreadyRunning(path.clone()))?;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), err);
        }
    }
}
