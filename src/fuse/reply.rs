// Reply protocol between the dispatcher and the kernel transport
//
// A reply object stands for one pending request. Sending consumes it, so a
// request can be answered at most once; the dispatcher answers on every path
// so it is answered at least once.

/// Whether a reply reached the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The kernel had already abandoned the request (the write failed with
    /// ENOENT). Anything the reply handed out was never received.
    Aborted,
}

impl Delivery {
    /// Interpret the status of a reply write on the kernel channel
    pub fn from_write_status(errno: Option<i32>) -> Self {
        match errno {
            Some(libc::ENOENT) => Delivery::Aborted,
            _ => Delivery::Delivered,
        }
    }

    pub fn is_aborted(self) -> bool {
        self == Delivery::Aborted
    }
}

/// Reply slot for a request answered with a payload of type `T` or an errno
pub trait Reply<T> {
    fn send(self, payload: T) -> Delivery;

    fn fail(self, errno: i32) -> Delivery;
}

/// Reply slot for a request that takes no answer (forget)
pub trait ReplyNone {
    fn none(self);
}

/// Identity of the process behind a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Kernel-assigned request tag
    pub unique: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl From<&fuser::Request<'_>> for RequestContext {
    fn from(req: &fuser::Request<'_>) -> Self {
        Self { unique: req.unique(), uid: req.uid(), gid: req.gid(), pid: req.pid() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_from_write_status() {
        assert_eq!(Delivery::from_write_status(None), Delivery::Delivered);
        assert_eq!(Delivery::from_write_status(Some(libc::ENOENT)), Delivery::Aborted);
        assert_eq!(Delivery::from_write_status(Some(libc::EINVAL)), Delivery::Delivered);
        assert!(Delivery::Aborted.is_aborted());
        assert!(!Delivery::Delivered.is_aborted());
    }
}
