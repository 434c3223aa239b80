use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::{CheckpointError, CheckpointHandle, Checkpointer};
use crate::supervisor::process::{send_signal, Signal};
use crate::supervisor::ChildProcess;

const PIDFILE: &str = "restored.pid";

/// Snapshots through the `criu` command line tool. Images live under
/// `<root>/<sequence_id>/`.
#[derive(Debug, Clone)]
pub struct CriuCheckpointer {
    criu: PathBuf,
    root: PathBuf,
}

impl CriuCheckpointer {
    /// Use `criu_path`, or find `criu` on `PATH`.
    pub fn new(criu_path: Option<PathBuf>, root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let criu = match criu_path {
            Some(path) if path.exists() => path,
            Some(_) => return Err(CheckpointError::Unavailable),
            None => which::which("criu").map_err(|_| CheckpointError::Unavailable)?,
        };
        Ok(Self {
            criu,
            root: root.into(),
        })
    }

    fn image_dir(&self, sequence_id: i64) -> PathBuf {
        self.root.join(sequence_id.to_string())
    }
}

impl Checkpointer for CriuCheckpointer {
    fn snapshot(&mut self, pid: u32, sequence_id: i64) -> Result<CheckpointHandle, CheckpointError> {
        let dir = self.image_dir(sequence_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let output = Command::new(&self.criu)
            .arg("dump")
            .arg("-t")
            .arg(pid.to_string())
            .arg("-D")
            .arg(&dir)
            .args(["--leave-running", "--shell-job", "--file-locks"])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(CheckpointError::Failed {
                action: "dump",
                sequence_id,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(pid, sequence_id, dir = %dir.display(), "Dumped process");
        Ok(CheckpointHandle {
            sequence_id,
            location: Some(dir),
        })
    }

    fn restore(
        &mut self,
        handle: &CheckpointHandle,
    ) -> Result<Box<dyn ChildProcess>, CheckpointError> {
        let dir = handle
            .location
            .clone()
            .unwrap_or_else(|| self.image_dir(handle.sequence_id));
        if !dir.is_dir() {
            return Err(CheckpointError::Missing(handle.sequence_id));
        }
        let pidfile = dir.join(PIDFILE);
        match fs::remove_file(&pidfile) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        // criu stays in the foreground as the parent of the restored tree
        let criu = Command::new(&self.criu)
            .arg("restore")
            .arg("-D")
            .arg(&dir)
            .args(["--shell-job", "--file-locks", "--pidfile"])
            .arg(&pidfile)
            .stdin(Stdio::null())
            .spawn()?;

        tracing::info!(
            sequence_id = handle.sequence_id,
            criu_pid = criu.id(),
            "Restoring checkpoint"
        );
        Ok(Box::new(RestoredChild { criu, pidfile }))
    }

    fn find(&self, sequence_id: i64) -> Option<CheckpointHandle> {
        let dir = self.image_dir(sequence_id);
        let populated = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        populated.then_some(CheckpointHandle {
            sequence_id,
            location: Some(dir),
        })
    }

    fn wipe(&mut self) -> Result<(), CheckpointError> {
        wipe_dir(&self.root)?;
        Ok(())
    }
}

fn wipe_dir(root: &Path) -> io::Result<()> {
    match fs::remove_dir_all(root) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    fs::create_dir_all(root)
}

/// A process tree restored by a foreground `criu restore`.
struct RestoredChild {
    criu: Child,
    pidfile: PathBuf,
}

impl RestoredChild {
    fn restored_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pidfile).ok()?.trim().parse().ok()
    }
}

impl ChildProcess for RestoredChild {
    /// The restored process once criu has written it, criu's own pid before
    fn pid(&self) -> u32 {
        self.restored_pid().unwrap_or_else(|| self.criu.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .criu
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.criu.try_wait()?.is_some() {
            return Ok(());
        }
        if let Some(pid) = self.restored_pid() {
            if let Err(e) = send_signal(pid, Signal::Kill) {
                tracing::debug!(pid, error = %e, "Restored process already gone");
            }
        }
        // criu exits once its restored tree is gone
        self.criu.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_binary_is_unavailable() {
        let dir = tempdir().unwrap();
        let result = CriuCheckpointer::new(Some(dir.path().join("no-criu")), dir.path());
        assert!(matches!(result, Err(CheckpointError::Unavailable)));
    }

    #[test]
    fn test_find_and_wipe_follow_image_dirs() {
        let dir = tempdir().unwrap();
        let fake = dir.path().join("criu");
        fs::write(&fake, "").unwrap();
        let root = dir.path().join("checkpoints");
        let mut criu = CriuCheckpointer::new(Some(fake), &root).unwrap();

        fs::create_dir_all(root.join("3")).unwrap();
        assert_eq!(criu.find(3), None, "empty image dir is not a checkpoint");
        fs::write(root.join("3/core-1.img"), b"img").unwrap();
        assert_eq!(
            criu.find(3),
            Some(CheckpointHandle {
                sequence_id: 3,
                location: Some(root.join("3")),
            })
        );

        criu.wipe().unwrap();
        assert_eq!(criu.find(3), None);
        assert!(root.is_dir());
    }

    #[test]
    fn test_restore_without_images_is_missing() {
        let dir = tempdir().unwrap();
        let fake = dir.path().join("criu");
        fs::write(&fake, "").unwrap();
        let mut criu = CriuCheckpointer::new(Some(fake), dir.path().join("checkpoints")).unwrap();
        let handle = CheckpointHandle {
            sequence_id: 9,
            location: None,
        };
        assert!(matches!(
            criu.restore(&handle),
            Err(CheckpointError::Missing(9))
        ));
    }
}
