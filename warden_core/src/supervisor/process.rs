use crate::lock;
use crate::protocol::{Request, RequestBody, Response, ResponseBody, WireError, read_frame, write_frame};
use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No response arrived in time. The worker is still running.
    Timeout(Duration),
    /// The worker's output closed before the response arrived.
    Disconnected,
    /// The request could not be framed.
    Transport(String),
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, Sender<Response>>,
}

/// A spawned `warden-worker` and the thread routing its responses.
pub struct WorkerProcess {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerProcess {
    pub fn spawn(argv: &[String], working_dir: Option<&Path>) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty worker command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("worker pipes were not captured"));
            }
        };

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name(format!("warden-worker-{pid}"))
                .spawn(move || route_responses(pid, stdout, pending))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Self {
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while the process runs and its response stream is open.
    pub fn is_alive(&self) -> bool {
        if lock(&self.pending).closed {
            return false;
        }
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Sends `body` and blocks the calling thread until its response
    /// arrives or `timeout` expires. Other callers are not blocked.
    pub fn call(&self, body: RequestBody, timeout: Duration) -> Result<ResponseBody, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(CallError::Disconnected);
            }
            pending.waiters.insert(id, tx);
        }

        let request = Request { id, body };
        let written = match lock(&self.stdin).as_mut() {
            Some(stdin) => write_frame(stdin, &request),
            None => Err(WireError::Io(io::Error::from(io::ErrorKind::BrokenPipe))),
        };
        if let Err(e) = written {
            lock(&self.pending).waiters.remove(&id);
            return Err(match e {
                WireError::Io(_) => CallError::Disconnected,
                other => CallError::Transport(other.to_string()),
            });
        }

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response.body),
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).waiters.remove(&id);
                Err(CallError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CallError::Disconnected),
        }
    }

    /// Force-kills the worker and reaps it.
    pub fn kill(&self) -> String {
        let mut child = lock(&self.child);
        if let Ok(Some(status)) = child.try_wait() {
            return describe_exit(status);
        }
        if let Err(e) = child.kill() {
            log::warn!("failed to kill worker {}: {e}", self.pid);
        }
        match child.wait() {
            Ok(status) => describe_exit(status),
            Err(e) => format!("Error waiting for worker: {e}"),
        }
    }

    /// Waits up to `grace` for the worker to exit on its own, then kills it.
    pub fn reap(&self, grace: Duration) -> String {
        match self.wait_for_exit(grace) {
            Some(status) => describe_exit(status),
            None => self.kill(),
        }
    }

    /// Asks the worker to stop, closes its input and kills it if it is
    /// still running once `grace` has passed in total.
    pub fn shutdown(&self, grace: Duration) -> String {
        let deadline = Instant::now() + grace;
        if let Err(e) = self.call(RequestBody::StopProcess, grace) {
            log::debug!("worker {} did not acknowledge stop: {e:?}", self.pid);
        }
        lock(&self.stdin).take();
        let status = self.reap(deadline.saturating_duration_since(Instant::now()));
        if let Some(reader) = lock(&self.reader).take() {
            if reader.join().is_err() {
                log::error!("response reader of worker {} panicked", self.pid);
            }
        }
        status
    }

    fn wait_for_exit(&self, grace: Duration) -> Option<ExitStatus> {
        let start_time = Instant::now();
        loop {
            match lock(&self.child).try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if start_time.elapsed() >= grace => return None,
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    log::warn!("error waiting for worker {}: {e}", self.pid);
                    return None;
                }
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let status = self.kill();
        log::debug!("worker {} released: {status}", self.pid);
        if let Some(reader) = lock(&self.reader).take() {
            let _ = reader.join();
        }
    }
}

fn route_responses(pid: u32, stdout: ChildStdout, pending: Arc<Mutex<Pending>>) {
    let mut stdout = BufReader::new(stdout);
    loop {
        match read_frame::<_, Response>(&mut stdout) {
            Ok(Some(response)) => {
                let waiter = lock(&pending).waiters.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => log::warn!(
                        "worker {pid} answered unknown or abandoned request #{}",
                        response.id
                    ),
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::error!("unreadable response stream from worker {pid}: {e}");
                break;
            }
        }
    }
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.waiters.clear();
}

pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn spawn_failure_is_reported() {
        assert!(WorkerProcess::spawn(&["/nonexistent/warden-worker".into()], None).is_err());
        assert!(WorkerProcess::spawn(&[], None).is_err());
    }

    #[test]
    fn silent_process_times_out_and_is_killed() {
        let process = WorkerProcess::spawn(&sh("exec sleep 30"), None).unwrap();
        let start = Instant::now();
        let result = process.call(RequestBody::Warmup, Duration::from_millis(100));
        assert_eq!(result, Err(CallError::Timeout(Duration::from_millis(100))));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(process.is_alive(), "a slow worker is not a dead one");
        assert!(process.kill().contains("signal 9"));
        assert!(!process.is_alive());
    }

    #[test]
    fn shutdown_of_an_unresponsive_process_takes_one_grace_period() {
        let process = WorkerProcess::spawn(&sh("exec sleep 30"), None).unwrap();
        let grace = Duration::from_millis(400);
        let start = Instant::now();
        let status = process.shutdown(grace);
        let elapsed = start.elapsed();
        assert!(status.contains("signal 9"), "{status}");
        assert!(elapsed >= grace);
        assert!(elapsed < grace * 2 - Duration::from_millis(100), "took {elapsed:?}");
    }

    #[test]
    fn exited_process_disconnects_callers() {
        let process = WorkerProcess::spawn(&sh("exit 3"), None).unwrap();
        let status = process.reap(Duration::from_secs(5));
        assert_eq!(status, "Exited with code 3");
        assert!(!process.is_alive());
        let result = process.call(RequestBody::Warmup, Duration::from_secs(5));
        assert_eq!(result, Err(CallError::Disconnected));
    }
}
