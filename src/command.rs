// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{IoSliceMut, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::sys::socket::{
    getsockopt, sockopt::PeerCredentials, ControlMessageOwned, MsgFlags,
};
use serde::Deserialize;

use crate::{
    ovpn::ServerId, realm::Realm, ErrorKind, VleaseError,
};

const MAX_MSG_SIZE: usize = 1024;
const MAX_NUM_FDS: usize = 8;

// Deferred status protocol: the hook writes "2" (deferred) before
// calling us; we overwrite with the outcome.
const STATUS_FAILED: &[u8] = b"0";
const STATUS_SUCCEEDED: &[u8] = b"1";

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub(crate) struct ConnId(pub(crate) u64);

/// The deferred-status file handed over by the connect hook. If the
/// owning request dies without a verdict, dropping this writes FAILED so
/// the hook never hangs on a stale "deferred".
#[derive(Debug)]
pub(crate) struct DeferredStatusFile {
    file: File,
    wrote: bool,
}

impl DeferredStatusFile {
    pub(crate) fn new(file: File) -> Self {
        Self { file, wrote: false }
    }

    pub(crate) fn write_status(
        &mut self,
        succeeded: bool,
    ) -> Result<(), VleaseError> {
        let val = if succeeded {
            STATUS_SUCCEEDED
        } else {
            STATUS_FAILED
        };
        log::debug!(
            "Writing deferred return value {}",
            String::from_utf8_lossy(val)
        );
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(val)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.wrote = true;
        Ok(())
    }
}

impl Drop for DeferredStatusFile {
    fn drop(&mut self) {
        if !self.wrote {
            if let Err(e) = self.write_status(false) {
                log::debug!(
                    "Failed to write deferred failure status: {e}"
                );
            }
        }
    }
}

/// A `request` command that was accepted and now waits for its DHCP
/// transaction; holds the two descriptors the hook passed along.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) full_username: String,
    pub(crate) realm: Rc<Realm>,
    pub(crate) server: ServerId,
    pub(crate) status_file: DeferredStatusFile,
    pub(crate) config_file: File,
}

/// One inbound JSON command. Everything except `cmd` is optional at the
/// protocol level; each command checks for its own parameters.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandMessage {
    pub(crate) cmd: String,
    pub(crate) full_username: Option<String>,
    pub(crate) ret_file_idx: Option<String>,
    pub(crate) config_file_idx: Option<String>,
    pub(crate) daemon_name: Option<String>,
}

pub(crate) enum CommandRead {
    /// Socket would block; spurious wakeup.
    Nothing,
    /// Peer closed the connection.
    Closed,
    /// A message arrived but was not valid JSON.
    Malformed,
    Message(CommandMessage, Vec<File>),
}

/// Accepts hook connections on a filesystem-named stream socket.
#[derive(Debug)]
pub(crate) struct CommandListener {
    socket: UnixListener,
    path: PathBuf,
}

impl AsRawFd for CommandListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl CommandListener {
    pub(crate) fn new(
        path: &Path,
        mode: u32,
    ) -> Result<Self, VleaseError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                VleaseError::new(
                    ErrorKind::BindFailed,
                    format!(
                        "Failed to remove stale socket {}: {e}",
                        path.display()
                    ),
                )
            })?;
        }
        let socket = UnixListener::bind(path).map_err(|e| {
            VleaseError::new(
                ErrorKind::BindFailed,
                format!(
                    "Failed to bind command socket {}: {e}",
                    path.display()
                ),
            )
        })?;
        std::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(mode),
        )?;
        socket.set_nonblocking(true)?;
        log::debug!("Listening on socket {}", path.display());
        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn accept(&self) -> Option<UnixStream> {
        match self.socket.accept() {
            Ok((stream, _)) => {
                log::debug!(
                    "Received a new connection on {}",
                    self.path.display()
                );
                Some(stream)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::error!(
                    "Failed to accept on {}: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

}

/// Uid/gid allow-lists for command-socket peers. With both lists empty
/// no filtering happens at all.
#[derive(Debug, Default)]
pub(crate) struct PeerFilter {
    uids: Vec<u32>,
    gids: Vec<u32>,
}

impl PeerFilter {
    pub(crate) fn new(uids: Vec<u32>, gids: Vec<u32>) -> Self {
        Self { uids, gids }
    }

    pub(crate) fn allows(&self, stream: &UnixStream) -> bool {
        if self.uids.is_empty() && self.gids.is_empty() {
            return true;
        }
        let cred = match getsockopt(stream, PeerCredentials) {
            Ok(cred) => cred,
            Err(e) => {
                log::error!("Failed to read peer credentials: {e}");
                return false;
            }
        };
        if self.uids.contains(&cred.uid())
            || self.gids.contains(&cred.gid())
        {
            return true;
        }
        log::info!(
            "Rejecting command connection from PID {} (UID {}, GID {})",
            cred.pid(),
            cred.uid(),
            cred.gid()
        );
        false
    }
}

/// One hook connection. The stream may be gone (peer hung up) while a
/// request outcome is still owed; the record then lives on until the
/// outcome is delivered and the descriptors are released.
#[derive(Debug)]
pub(crate) struct CommandConnection {
    stream: Option<UnixStream>,
    pub(crate) pending: Option<PendingRequest>,
}

impl CommandConnection {
    pub(crate) fn new(stream: UnixStream) -> Result<Self, VleaseError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: Some(stream),
            pending: None,
        })
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn take_stream(&mut self) -> Option<UnixStream> {
        self.stream.take()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.stream.is_none() && self.pending.is_none()
    }

    /// Read one message and its attached descriptors. One message per
    /// wakeup; messages are single JSON objects, one transport write
    /// each, without framing.
    pub(crate) fn recv(&mut self) -> CommandRead {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return CommandRead::Nothing,
        };
        let (data, files) = match recv_with_fds(stream) {
            Ok(Some(ret)) => ret,
            Ok(None) => return CommandRead::Nothing,
            Err(e) => {
                log::warn!("Failed to read command: {e}");
                return CommandRead::Closed;
            }
        };
        if data.is_empty() {
            log::debug!("Closing cmd socket due to EOF");
            return CommandRead::Closed;
        }
        log::debug!(
            "Parsing command \"{}\"",
            String::from_utf8_lossy(&data)
        );
        match serde_json::from_slice::<CommandMessage>(&data) {
            Ok(msg) => CommandRead::Message(msg, files),
            Err(e) => {
                log::warn!(
                    "Failed to parse command \"{}\": {e}",
                    String::from_utf8_lossy(&data)
                );
                CommandRead::Malformed
            }
        }
    }

    /// One JSON object per reply, sent as a single write.
    pub(crate) fn send_reply(&mut self, cmd: &str) {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        let reply = serde_json::json!({ "cmd": cmd }).to_string();
        if let Err(e) = stream.write_all(reply.as_bytes()) {
            log::warn!("Failed to send reply to command client: {e}");
        }
    }
}

fn recv_with_fds(
    stream: &UnixStream,
) -> Result<Option<(Vec<u8>, Vec<File>)>, VleaseError> {
    let mut buf = [0u8; MAX_MSG_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_NUM_FDS]);
    let msg = match nix::sys::socket::recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    ) {
        Ok(msg) => msg,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // The kernel allocated these for us; we own them now.
                files.push(unsafe { File::from_raw_fd(fd) });
            }
        }
    }
    let len = msg.bytes;
    let data = iov[0][..len].to_vec();
    Ok(Some((data, files)))
}
