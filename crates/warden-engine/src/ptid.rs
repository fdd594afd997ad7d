/// Identifier naming a specific thread of a debuggee process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptid {
    /// Process id.
    pub pid: i32,

    /// OS thread id within the process.
    pub tid: i64,
}

impl Ptid {
    /// Creates a ptid naming the given thread of the given process.
    pub const fn new(pid: i32, tid: i64) -> Self {
        Self { pid, tid }
    }

    /// Creates a ptid naming the main thread of a freshly created process.
    ///
    /// By convention the main thread's id equals the process id.
    pub const fn main(pid: i32) -> Self {
        Self {
            pid,
            tid: pid as i64,
        }
    }
}

impl core::fmt::Display for Ptid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.pid, self.tid)
    }
}

/// Scope of a resume or wait operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeScope {
    /// A single thread.
    Thread(Ptid),

    /// Every thread of one process.
    Process(i32),

    /// Every thread of every process.
    All,
}

impl ResumeScope {
    /// Returns whether the given thread is named by this scope.
    pub fn contains(&self, ptid: Ptid) -> bool {
        match *self {
            Self::Thread(t) => t == ptid,
            Self::Process(pid) => pid == ptid.pid,
            Self::All => true,
        }
    }
}

impl core::fmt::Display for ResumeScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Thread(ptid) => write!(f, "{ptid}"),
            Self::Process(pid) => write!(f, "{pid}.*"),
            Self::All => write!(f, "*.*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Ptid, ResumeScope};

    #[test]
    fn scope_containment() {
        let t1 = Ptid::new(100, 100);
        let t2 = Ptid::new(100, 101);
        let other = Ptid::new(200, 200);

        assert!(ResumeScope::Thread(t1).contains(t1));
        assert!(!ResumeScope::Thread(t1).contains(t2));

        assert!(ResumeScope::Process(100).contains(t1));
        assert!(ResumeScope::Process(100).contains(t2));
        assert!(!ResumeScope::Process(100).contains(other));

        assert!(ResumeScope::All.contains(t1));
        assert!(ResumeScope::All.contains(other));
    }

    #[test]
    fn display() {
        assert_eq!(Ptid::new(42, 43).to_string(), "42.43");
        assert_eq!(ResumeScope::Process(42).to_string(), "42.*");
        assert_eq!(ResumeScope::All.to_string(), "*.*");
    }
}
