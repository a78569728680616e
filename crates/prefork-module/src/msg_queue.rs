//! `MessageQueue` — SysV message queue shared between worker processes.
//!
//! The kernel keeps the queue alive independently of any process. Dropping a
//! `MessageQueue` only forgets the local id; `destroy()` removes the queue
//! for every process that opened the same key.
//!
//! Message layout matches `struct msgbuf`: a `long` type followed by the
//! payload. Each push/pop builds its own buffer; the two paths never share
//! memory.

use prefork_core::constants::MSG_MAX;
use prefork_core::error::{errno, Error, Result};
use prefork_core::kwarn;

use std::ffi::CString;
use std::path::Path;

/// Raw `msgbuf` with a fixed-capacity payload
#[repr(C)]
struct MessageBuffer {
    mtype: libc::c_long,
    mtext: [u8; MSG_MAX],
}

impl MessageBuffer {
    fn boxed(mtype: libc::c_long) -> Box<Self> {
        Box::new(Self { mtype, mtext: [0u8; MSG_MAX] })
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStat {
    /// Messages currently queued
    pub count: usize,
    /// Payload bytes currently queued
    pub bytes: usize,
}

#[derive(Debug)]
pub struct MessageQueue {
    key: libc::key_t,
    id: libc::c_int,
    blocking: bool,
}

impl MessageQueue {
    /// Attach to the queue for `key`, creating it when absent
    pub fn open(key: libc::key_t, blocking: bool) -> Result<Self> {
        let id = unsafe { libc::msgget(key, libc::IPC_CREAT | 0o666) };
        if id < 0 {
            let e = errno();
            kwarn!("msgget(key={:#x}) failed: errno {}", key, e);
            return Err(Error::Syscall(e));
        }
        Ok(Self { key, id, blocking })
    }

    #[inline]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    #[inline]
    pub fn id(&self) -> libc::c_int {
        self.id
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn flags(&self) -> libc::c_int {
        if self.blocking {
            0
        } else {
            libc::IPC_NOWAIT
        }
    }

    /// Enqueue `data` with message type `mtype` (must be > 0)
    pub fn push(&self, mtype: i64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParams("the data to push is empty"));
        }
        if data.len() >= MSG_MAX {
            return Err(Error::InvalidParams("the data to push is too big"));
        }
        if mtype <= 0 {
            return Err(Error::InvalidParams("message type must be positive"));
        }
        let mut msg = MessageBuffer::boxed(mtype as libc::c_long);
        msg.mtext[..data.len()].copy_from_slice(data);

        let ret = unsafe {
            libc::msgsnd(
                self.id,
                &*msg as *const MessageBuffer as *const libc::c_void,
                data.len(),
                self.flags(),
            )
        };
        if ret < 0 {
            let e = errno();
            if e != libc::EAGAIN {
                kwarn!("msgsnd(id={}, len={}) failed: errno {}", self.id, data.len(), e);
            }
            return Err(Error::Syscall(e));
        }
        Ok(())
    }

    /// Dequeue one message.
    ///
    /// `mtype == 0` takes the oldest message of any type; a positive value
    /// takes the oldest message of exactly that type. On an empty queue a
    /// non-blocking handle fails with `Syscall(ENOMSG)`.
    pub fn pop(&self, mtype: i64, max_len: usize) -> Result<Vec<u8>> {
        let max_len = if max_len == 0 || max_len > MSG_MAX { MSG_MAX } else { max_len };
        let mut msg = MessageBuffer::boxed(0);

        let n = unsafe {
            libc::msgrcv(
                self.id,
                &mut *msg as *mut MessageBuffer as *mut libc::c_void,
                max_len,
                mtype as libc::c_long,
                self.flags(),
            )
        };
        if n < 0 {
            let e = errno();
            if e != libc::ENOMSG && e != libc::EINTR {
                kwarn!("msgrcv(id={}, type={}) failed: errno {}", self.id, mtype, e);
            }
            return Err(Error::Syscall(e));
        }
        Ok(msg.mtext[..n as usize].to_vec())
    }

    fn ctl_stat(&self) -> Result<libc::msqid_ds> {
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(Error::last_os());
        }
        Ok(ds)
    }

    pub fn stat(&self) -> Result<QueueStat> {
        let ds = self.ctl_stat()?;
        Ok(QueueStat {
            count: ds.msg_qnum as usize,
            bytes: ds.__msg_cbytes as usize,
        })
    }

    /// Set the maximum number of bytes the queue may hold (`msg_qbytes`).
    /// Raising it above the system limit needs CAP_SYS_RESOURCE.
    pub fn set_capacity(&self, bytes: usize) -> Result<()> {
        let mut ds = self.ctl_stat()?;
        ds.msg_qbytes = bytes as libc::msglen_t;
        if unsafe { libc::msgctl(self.id, libc::IPC_SET, &mut ds) } < 0 {
            let e = errno();
            kwarn!("msgctl(id={}, IPC_SET, qbytes={}) failed: errno {}", self.id, bytes, e);
            return Err(Error::Syscall(e));
        }
        Ok(())
    }

    /// Remove the queue from the system. Affects every process using the key.
    pub fn destroy(&self) -> Result<()> {
        if unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) } < 0 {
            let e = errno();
            kwarn!("msgctl(id={}, IPC_RMID) failed: errno {}", self.id, e);
            return Err(Error::Syscall(e));
        }
        Ok(())
    }
}

/// Derive a SysV IPC key from an existing file path (`ftok`)
pub fn ftok_key(path: &Path, proj_id: u8) -> Result<libc::key_t> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::InvalidParams("path contains a NUL byte"))?;
    let key = unsafe { libc::ftok(cpath.as_ptr(), proj_id as libc::c_int) };
    if key == -1 {
        return Err(Error::last_os());
    }
    Ok(key)
}
