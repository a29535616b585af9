//! Per-socket framing: turns a vhost-user control socket into a stream of
//! (header, payload, ancillary fds) messages, and writes replies back.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessageOwned, MsgFlags};

use super::messages::{self, Header, HEADER_LEN};
use super::Error;

/// vhost-user caps ancillary fds at 8 per message (one SCM_RIGHTS block).
const MAX_FDS_PER_MESSAGE: usize = 8;

pub struct RecvResult {
    pub header: Header,
    pub payload: Vec<u8>,
    pub fds: Vec<RawFd>,
}

/// Reads one request off `fd`. Returns `Ok(None)` on a clean EOF (the
/// front-end closed the connection).
pub fn recv_message(fd: RawFd) -> Result<Option<RecvResult>, Error> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let mut iov = [IoSliceMut::new(&mut hdr_buf)];
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())?;

    if msg.bytes == 0 {
        return Ok(None);
    }
    if msg.bytes < HEADER_LEN {
        return Err(Error::ShortRead);
    }

    let fds: Vec<RawFd> = msg
        .cmsgs()
        .map_err(|_| Error::ShortRead)?
        .filter_map(|c| match c {
            ControlMessageOwned::ScmRights(fds) => Some(fds),
            _ => None,
        })
        .flatten()
        .collect();

    let header = Header::parse(&hdr_buf);
    let mut payload = vec![0u8; header.size as usize];
    if header.size > 0 {
        let mut iov2 = [IoSliceMut::new(&mut payload)];
        let msg2 = recvmsg::<()>(fd, &mut iov2, None, MsgFlags::empty())?;
        if msg2.bytes < header.size as usize {
            return Err(Error::ShortRead);
        }
    }

    Ok(Some(RecvResult { header, payload, fds }))
}

/// Sends a reply frame carrying the `REPLY` flag, echoing `request`.
pub fn send_reply(fd: RawFd, request: u32, payload: &[u8]) -> Result<(), Error> {
    let frame = messages::encode_reply(request, payload);
    let iov = [IoSlice::new(&frame)];
    sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?;
    Ok(())
}
