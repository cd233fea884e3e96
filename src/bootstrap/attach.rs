//! Dynamic attach to a HotSpot JVM.
//!
//! The JVM starts its attach listener when it receives `SIGQUIT` while a
//! `.attach_pid<pid>` file exists in its working directory (or tmp). The
//! listener then serves a Unix socket `.java_pid<pid>` in the tmp directory,
//! speaking a tiny NUL-separated protocol:
//!
//! ```text
//! request:  "1\0" <command> "\0" <arg0> "\0" <arg1> "\0" <arg2> "\0"
//! reply:    <status>\n [return code: <n>\n] [message...]
//! ```

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::Options;
use crate::error::{Error, Result};

const PROTOCOL_VERSION: &str = "1";
const MAX_ATTEMPTS: u32 = 10;
const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// What to load into the target VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachCommand {
    /// A Java agent jar; its `Agent-Class` runs with an `Instrumentation`.
    JavaAgent { jar: PathBuf, args: String },
    /// A native agent library; its `Agent_OnAttach` runs with the `JavaVM`.
    NativeAgent { library: PathBuf, args: String },
}

impl AttachCommand {
    /// The three arguments of the `load` command.
    fn load_args(&self) -> [String; 3] {
        match self {
            AttachCommand::JavaAgent { jar, args } => {
                let jar = jar.display().to_string();
                let options = if args.is_empty() { jar } else { format!("{jar}={args}") };
                ["instrument".to_string(), "false".to_string(), options]
            }
            AttachCommand::NativeAgent { library, args } => [
                library.display().to_string(),
                "true".to_string(),
                args.clone(),
            ],
        }
    }

    /// The full request as written to the socket.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in std::iter::once(PROTOCOL_VERSION.to_string())
            .chain(std::iter::once("load".to_string()))
            .chain(self.load_args())
        {
            out.extend_from_slice(part.as_bytes());
            out.push(0);
        }
        out
    }
}

/// Loads agents into a running JVM.
pub trait AttachProvider: Send + Sync {
    fn attach(&self, pid: u32, command: &AttachCommand) -> Result<()>;
}

/// The HotSpot (OpenJDK) attach mechanism over Unix domain sockets.
#[derive(Debug, Clone)]
pub struct HotSpotAttach {
    extra_dirs: Vec<PathBuf>,
    attempts: u32,
    initial_delay: Duration,
}

impl HotSpotAttach {
    pub fn new(options: &Options) -> Self {
        Self {
            extra_dirs: options.tools_path.iter().cloned().collect(),
            attempts: MAX_ATTEMPTS,
            initial_delay: INITIAL_DELAY,
        }
    }

    pub fn with_backoff(mut self, attempts: u32, initial_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.initial_delay = initial_delay;
        self
    }

    /// Directories searched for `.java_pid<pid>`, in order.
    pub fn socket_dirs(&self, pid: u32) -> Vec<PathBuf> {
        let mut dirs = self.extra_dirs.clone();
        if let Some(tmp) = std::env::var_os("TMPDIR") {
            dirs.push(PathBuf::from(tmp));
        }
        dirs.push(PathBuf::from("/tmp"));
        dirs.push(PathBuf::from(format!("/proc/{pid}/root/tmp")));
        dirs.dedup();
        dirs
    }

    fn find_socket(&self, pid: u32) -> Option<PathBuf> {
        self.socket_dirs(pid)
            .into_iter()
            .map(|dir| dir.join(format!(".java_pid{pid}")))
            .find(|path| path.exists())
    }

    /// Drops the trigger file and signals the VM.
    fn trigger(&self, pid: u32) -> Result<PathBuf> {
        let file_name = format!(".attach_pid{pid}");
        let candidates = [
            PathBuf::from(format!("/proc/{pid}/cwd")).join(&file_name),
            std::env::temp_dir().join(&file_name),
        ];
        let trigger = candidates
            .iter()
            .find(|path| fs::write(path, b"").is_ok())
            .cloned()
            .ok_or_else(|| Error::AttachFailure(format!("cannot create {file_name}")))?;

        #[cfg(unix)]
        {
            // SAFETY: plain syscall on a pid we were given.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGQUIT) };
            if rc != 0 {
                let _ = fs::remove_file(&trigger);
                return Err(Error::AttachFailure(format!(
                    "cannot signal process {pid}: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(trigger)
    }

    fn wait_for_socket(&self, pid: u32) -> Option<PathBuf> {
        let mut delay = self.initial_delay;
        for attempt in 0..self.attempts {
            if let Some(socket) = self.find_socket(pid) {
                return Some(socket);
            }
            tracing::trace!(pid, attempt, "waiting for attach listener");
            thread::sleep(delay);
            delay = delay.saturating_mul(2);
        }
        self.find_socket(pid)
    }

    #[cfg(unix)]
    fn send(&self, socket: &Path, command: &AttachCommand) -> Result<()> {
        use std::os::unix::net::UnixStream;

        let mut stream = UnixStream::connect(socket)
            .map_err(|e| Error::AttachFailure(format!("connect {}: {e}", socket.display())))?;
        stream
            .write_all(&command.encode())
            .map_err(|e| Error::AttachFailure(format!("send load command: {e}")))?;
        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .map_err(|e| Error::AttachFailure(format!("read attach reply: {e}")))?;
        parse_reply(&reply)
    }

    #[cfg(not(unix))]
    fn send(&self, socket: &Path, _command: &AttachCommand) -> Result<()> {
        Err(Error::AttachFailure(format!(
            "attach over {} is only supported on Unix",
            socket.display()
        )))
    }
}

impl AttachProvider for HotSpotAttach {
    fn attach(&self, pid: u32, command: &AttachCommand) -> Result<()> {
        let socket = match self.find_socket(pid) {
            Some(socket) => socket,
            None => {
                let trigger = self.trigger(pid)?;
                let socket = self.wait_for_socket(pid);
                let _ = fs::remove_file(&trigger);
                socket.ok_or_else(|| {
                    Error::AttachFailure(format!("attach listener of process {pid} did not start"))
                })?
            }
        };
        tracing::debug!(pid, socket = %socket.display(), ?command, "attaching agent");
        self.send(&socket, command)
    }
}

/// Interprets the listener's reply to `load`.
///
/// The first line is the command status. Newer JDKs follow it with
/// `return code: <n>`, older ones with a bare number; both are the agent's
/// `Agent_OnAttach` result.
pub fn parse_reply(reply: &str) -> Result<()> {
    let mut lines = reply.lines();
    let status = lines
        .next()
        .map(str::trim)
        .ok_or_else(|| Error::AttachFailure("empty reply from attach listener".into()))?;
    let status: i32 = status
        .parse()
        .map_err(|_| Error::AttachFailure(format!("unexpected attach reply: {reply:?}")))?;
    let rest: Vec<&str> = lines.collect();
    if status != 0 {
        return Err(Error::AttachFailure(format!("status {status}: {}", rest.join(" ").trim())));
    }
    let code = rest.first().and_then(|line| {
        let line = line.trim();
        line.strip_prefix("return code:").unwrap_or(line).trim().parse::<i32>().ok()
    });
    match code {
        Some(code) if code != 0 => Err(Error::AttachFailure(format!(
            "agent failed to initialize (return code {code}): {}",
            rest.get(1..).map(|r| r.join(" ")).unwrap_or_default().trim()
        ))),
        _ => Ok(()),
    }
}
