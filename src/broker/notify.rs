//! Grant and revoke delivery.
//!
//! An owner in this process is reached through its broker mailbox. An owner in another
//! process is reached through its resource fifo, `voice_resource_<user id>` in the
//! configured fifo directory, which carries one little-endian `u32` message type per
//! notification.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tokio::net::unix::pipe;

use super::region::{Notice, NoticeKind};
use super::{BrokerMessage, LocalBrokers};

/// Wire value of a broker message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum MessageType {
    Request = 0,
    Release = 1,
    Grant = 2,
    Revoke = 3,
    Terminate = 4,
}

impl MessageType {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Request),
            1 => Some(Self::Release),
            2 => Some(Self::Grant),
            3 => Some(Self::Revoke),
            4 => Some(Self::Terminate),
            _ => None,
        }
    }

    pub(crate) fn encode(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }
}

impl From<NoticeKind> for MessageType {
    fn from(kind: NoticeKind) -> Self {
        match kind {
            NoticeKind::Grant => Self::Grant,
            NoticeKind::Revoke => Self::Revoke,
        }
    }
}

/// Path of the resource fifo of `user_id`.
pub(crate) fn fifo_path(dir: &Path, user_id: u8) -> PathBuf {
    dir.join(format!("voice_resource_{user_id}"))
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let name = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mkfifo(name.as_ptr(), 0o666) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Creates (or recreates) the resource fifo of a user and opens its read end.
///
/// The fifo is opened read-write so it never reports end of file while no writer has it
/// open. Must be called from within the broker runtime.
pub(crate) fn open_fifo(path: &Path) -> io::Result<pipe::Receiver> {
    if let Err(e) = mkfifo(path) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            return Err(e);
        }
        tracing::info!(path = %path.display(), "unlink existing fifo");
        std::fs::remove_file(path)?;
        mkfifo(path)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    pipe::Receiver::from_file(file)
}

/// Removes a resource fifo, logging failures.
pub(crate) fn remove_fifo(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "unable to unlink fifo");
    }
}

/// Splits bytes read from a resource fifo into message types.
pub(crate) fn decode(bytes: &[u8]) -> impl Iterator<Item = Option<MessageType>> + '_ {
    bytes.chunks_exact(4).map(|chunk| {
        let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        MessageType::from_raw(raw)
    })
}

/// Routes allocation notices to their owners.
pub(crate) struct Notifier {
    pid: u32,
    fifo_dir: PathBuf,
    local: LocalBrokers,
}

impl Notifier {
    pub(crate) fn new(pid: u32, fifo_dir: PathBuf, local: LocalBrokers) -> Self {
        Self {
            pid,
            fifo_dir,
            local,
        }
    }

    pub(crate) fn deliver(&self, notice: Notice) {
        let kind = MessageType::from(notice.kind);
        if notice.pid == self.pid {
            let sender = self.local.lock().get(&notice.user_id).cloned();
            let msg = match notice.kind {
                NoticeKind::Grant => BrokerMessage::Grant,
                NoticeKind::Revoke => BrokerMessage::Revoke,
            };
            match sender {
                Some(sender) if sender.try_send(msg).is_ok() => {
                    tracing::debug!(user_id = notice.user_id, ?kind, "notified same process");
                }
                _ => {
                    tracing::error!(user_id = notice.user_id, ?kind, "local broker unreachable");
                }
            }
            return;
        }
        let path = fifo_path(&self.fifo_dir, notice.user_id);
        match Self::write_fifo(&path, kind) {
            Ok(()) => tracing::debug!(
                pid = notice.pid,
                path = %path.display(),
                ?kind,
                "notified other process"
            ),
            Err(e) => tracing::error!(
                pid = notice.pid,
                path = %path.display(),
                error = %e,
                "unable to notify over fifo"
            ),
        }
    }

    fn write_fifo(path: &Path, kind: MessageType) -> io::Result<()> {
        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        fifo.write_all(&kind.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(MessageType::Revoke.encode(), [3, 0, 0, 0]);
        assert_eq!(MessageType::from_raw(4), Some(MessageType::Terminate));
        assert_eq!(MessageType::from_raw(5), None);
    }

    #[test]
    fn test_decode_splits_records() {
        let bytes = [2, 0, 0, 0, 3, 0, 0, 0, 9, 0, 0, 0, 1];
        let kinds: Vec<_> = decode(&bytes).collect();
        assert_eq!(
            kinds,
            vec![Some(MessageType::Grant), Some(MessageType::Revoke), None]
        );
    }

    #[test]
    fn test_fifo_path() {
        assert_eq!(
            fifo_path(Path::new("/tmp"), 2),
            PathBuf::from("/tmp/voice_resource_2")
        );
    }

    #[tokio::test]
    async fn test_fifo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(dir.path(), 1);
        std::fs::write(&path, b"stale").unwrap();

        let receiver = open_fifo(&path).unwrap();
        Notifier::write_fifo(&path, MessageType::Grant).unwrap();
        receiver.readable().await.unwrap();
        let mut buf = [0u8; 16];
        let n = receiver.try_read(&mut buf).unwrap();
        assert_eq!(decode(&buf[..n]).collect::<Vec<_>>(), vec![Some(MessageType::Grant)]);
        remove_fifo(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_without_reader_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(dir.path(), 0);
        assert!(Notifier::write_fifo(&path, MessageType::Revoke).is_err());
    }
}
