//! Child process handles and launchers

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// A process the watcher or the server supervises.
pub trait ChildProcess: Send {
    fn pid(&self) -> u32;

    /// Exit code once the process has exited, `None` while it runs.
    /// Death by signal reports `-1`.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Stop immediately and reap.
    fn kill(&mut self) -> io::Result<()>;

    /// Ask the process to exit on its own.
    fn terminate(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

/// Starts a fresh child.
pub trait Launcher: Send {
    fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>>;
}

/// A direct child of this process.
#[derive(Debug)]
pub struct SystemChild {
    child: Child,
}

impl SystemChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ChildProcess for SystemChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        send_signal(self.pid(), Signal::Terminate)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
    Terminate,
    Kill,
}

pub(crate) fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    #[cfg(unix)]
    {
        let signal = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let result = unsafe { libc::kill(pid as i32, signal) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }
}

/// Runs `program args...` with this process's environment.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
    die_with_parent: bool,
}

impl CommandLauncher {
    pub fn new<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            die_with_parent: false,
        }
    }

    /// `prefix...` followed by this executable and `args`, e.g. to run the
    /// watcher under `sudo -E`.
    pub fn current_exe<I, S>(prefix: &[String], args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let exe: PathBuf = std::env::current_exe()?;
        let mut argv: Vec<OsString> = prefix.iter().map(OsString::from).collect();
        argv.push(exe.into_os_string());
        argv.extend(args.into_iter().map(Into::into));
        let program = argv.remove(0);
        Ok(Self::new(program, argv))
    }

    /// Have the kernel kill the child when this process dies (Linux only).
    pub fn die_with_parent(mut self) -> Self {
        self.die_with_parent = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(target_os = "linux")]
        if self.die_with_parent {
            use std::os::unix::process::CommandExt;
            // SAFETY: prctl is async-signal-safe and touches no memory of the parent.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

impl Launcher for CommandLauncher {
    fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>> {
        let child = self.command().spawn()?;
        tracing::info!(
            pid = child.id(),
            program = %self.program.to_string_lossy(),
            "Spawned child process"
        );
        Ok(Box::new(SystemChild::new(child)))
    }
}

/// SIGTERM, wait up to `grace` for the process to exit, then SIGKILL.
pub async fn shutdown_gracefully(child: &mut dyn ChildProcess, grace: Duration) -> io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    let pid = child.pid();
    if let Err(e) = child.terminate() {
        tracing::debug!(pid, error = %e, "SIGTERM failed, killing");
        return child.kill();
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            tracing::debug!(pid, "Child exited after SIGTERM");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tracing::warn!(pid, "Child ignored SIGTERM, killing");
    child.kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_launch_and_reap() {
        let mut launcher = CommandLauncher::new("sh", ["-c", "exit 3"]);
        let mut child = launcher.launch().unwrap();
        let code = loop {
            if let Some(code) = child.try_wait().unwrap() {
                break code;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(code, 3);
        assert!(!child.is_running());
        child.kill().unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_terminates() {
        let mut launcher = CommandLauncher::new("sleep", ["30"]);
        let mut child = launcher.launch().unwrap();
        assert!(child.is_running());

        shutdown_gracefully(child.as_mut(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!child.is_running());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_escalates() {
        let mut launcher = CommandLauncher::new("sh", ["-c", "trap '' TERM; sleep 30"]);
        let mut child = launcher.launch().unwrap();
        // let the shell install its trap
        std::thread::sleep(Duration::from_millis(200));

        shutdown_gracefully(child.as_mut(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!child.is_running());
    }
}
