//! Receiving a file descriptor another process sends over a Unix socket.

#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use std::fs::File;
use std::io::{self, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Waits for one message carrying `SCM_RIGHTS` and adopts its first
/// descriptor. Fails when the peer hangs up without sending one.
pub fn receive(socket: &UnixStream) -> io::Result<File> {
    let mut data = [0u8; 64];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut space = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::empty(),
    )?;

    let mut received = None;
    for message in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = message {
            for fd in fds {
                // SAFETY: the kernel just installed `fd` in this process and
                // nothing else refers to it.
                let file = unsafe { File::from_raw_fd(fd) };
                received.get_or_insert(file);
            }
        }
    }
    received.ok_or_else(|| io::Error::other("no descriptor was passed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{ControlMessage, sendmsg};
    use std::io::{IoSlice, Read, Seek, SeekFrom, Write};

    #[test]
    fn adopts_a_passed_descriptor() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut backing = tempfile::tempfile().unwrap();
        backing.write_all(b"raw disk").unwrap();

        let fds = [backing.as_raw_fd()];
        sendmsg::<()>(
            theirs.as_raw_fd(),
            &[IoSlice::new(b"x")],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();

        let mut file = receive(&ours).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "raw disk");
    }

    #[test]
    fn hang_up_without_descriptor_fails() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        assert!(receive(&ours).is_err());
    }
}
