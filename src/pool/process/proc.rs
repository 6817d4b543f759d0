//! Handle to one worker process and its protocol pipes.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

/// One line read from a worker.
#[derive(Debug)]
pub enum Incoming {
    Response(WorkResponse),
    /// Something that is not a protocol message, e.g. a stray `println!`.
    Stray(String),
}

pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    reaped: bool,
}

impl Proc {
    /// Take ownership of a spawned child and its stdin/stdout pipes.
    ///
    /// The child is reaped through `waitpid` from here on, not through
    /// `std::process::Child`.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(OwnedFd::from(stdin))),
            reader: LineReader::new(PipeFd::new(OwnedFd::from(stdout))),
            reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Read the next line from the worker. `None` on EOF.
    pub fn recv(&mut self) -> Result<Option<Incoming>> {
        match self.reader.read_line() {
            Ok(Some(line)) => Ok(Some(match WorkResponse::from_line(line) {
                Ok(response) => Incoming::Response(response),
                Err(_) => Incoming::Stray(line.to_string()),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(PoolError::Worker(format!(
                "Failed to receive from worker: {}",
                e
            ))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        let status = waitpid(self.pid, None)?;
        self.reaped = true;
        Ok(status)
    }

    /// Non-blocking wait. `None` while the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.reaped = true;
                Ok(Some(status))
            }
        }
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<WaitStatus> {
        if !self.reaped {
            signal::kill(self.pid, Signal::SIGKILL)?;
        }
        self.wait()
    }

    /// Ask the worker to exit, then kill it if it has not within `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> Result<WaitStatus> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }

        let _ = self.send(&WorkRequest::Exit);

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pid = self.pid.as_raw(), "Worker ignored exit request, killing");
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn");
        Proc::from_child(child).expect("Failed to create Proc")
    }

    #[test]
    fn test_echo_through_cat() {
        let mut proc = spawn("cat", &[]);
        proc.send(&WorkRequest::Exit).unwrap();
        match proc.recv().unwrap() {
            Some(Incoming::Stray(line)) => assert_eq!(line, "{\"type\":\"exit\"}"),
            other => panic!("unexpected {:?}", other),
        }
        // cat ignores the exit request; stop falls back to SIGKILL.
        let status = proc.stop(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            status,
            WaitStatus::Signaled(_, Signal::SIGKILL, _)
        ));
    }

    #[test]
    fn test_kill_reaps() {
        let mut proc = spawn("sleep", &["60"]);
        assert!(proc.try_wait().unwrap().is_none());
        proc.kill().unwrap();
        assert!(proc.try_wait().is_err());
    }

    #[test]
    fn test_recv_eof() {
        let mut proc = spawn("true", &[]);
        assert!(proc.recv().unwrap().is_none());
        assert_eq!(
            proc.wait().unwrap(),
            WaitStatus::Exited(proc.pid(), 0)
        );
    }
}
