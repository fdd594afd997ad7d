use std::collections::HashMap;

/// Backend-agnostic signal number.
///
/// The engine never interprets host signal numbers directly; backends are
/// expected to translate to this portable numbering (which happens to match
/// the common Linux values for the signals the engine cares about).
///
/// The default value is [`Sig::NONE`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sig(pub i32);

impl Sig {
    /// Absence of a signal (fabricated stops, finished steps).
    pub const NONE: Self = Self(0);

    /// Hangup.
    pub const HUP: Self = Self(1);
    /// Terminal interrupt.
    pub const INT: Self = Self(2);
    /// Illegal instruction.
    pub const ILL: Self = Self(4);
    /// Trace/breakpoint trap.
    pub const TRAP: Self = Self(5);
    /// Abort.
    pub const ABRT: Self = Self(6);
    /// Arithmetic exception.
    pub const FPE: Self = Self(8);
    /// Kill.
    pub const KILL: Self = Self(9);
    /// Invalid memory reference.
    pub const SEGV: Self = Self(11);
    /// Broken pipe.
    pub const PIPE: Self = Self(13);
    /// Alarm clock.
    pub const ALRM: Self = Self(14);
    /// Termination request.
    pub const TERM: Self = Self(15);
    /// Child status changed.
    pub const CHLD: Self = Self(17);
    /// Stop (not from a terminal).
    pub const STOP: Self = Self(19);
    /// Urgent socket condition.
    pub const URG: Self = Self(23);
    /// Virtual-time alarm.
    pub const VTALRM: Self = Self(26);
    /// Profiling timer alarm.
    pub const PROF: Self = Self(27);
    /// Window size changed.
    pub const WINCH: Self = Self(28);
    /// I/O possible.
    pub const IO: Self = Self(29);
}

impl core::fmt::Display for Sig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::NONE => f.write_str("none"),
            Self::INT => f.write_str("SIGINT"),
            Self::TRAP => f.write_str("SIGTRAP"),
            Self::SEGV => f.write_str("SIGSEGV"),
            Self::STOP => f.write_str("SIGSTOP"),
            Self(n) => write!(f, "signal {n}"),
        }
    }
}

/// Per-signal handling of a random (unexplained) stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disposition {
    /// Whether the stop is surfaced to the user.
    pub stop: bool,

    /// Whether the signal is delivered to the debuggee on resume.
    pub pass: bool,
}

/// Table deciding how random signals are handled, per signal number.
///
/// Signals without an explicit entry use the default of
/// `{ stop: true, pass: true }`.
#[derive(Clone, Debug)]
pub struct SignalDispositions {
    overrides: HashMap<Sig, Disposition>,
}

impl SignalDispositions {
    /// Returns the disposition of the given signal.
    pub fn get(&self, sig: Sig) -> Disposition {
        self.overrides
            .get(&sig)
            .copied()
            .unwrap_or(Disposition {
                stop: true,
                pass: true,
            })
    }

    /// Overrides the disposition of the given signal.
    pub fn set(&mut self, sig: Sig, disposition: Disposition) {
        self.overrides.insert(sig, disposition);
    }
}

impl Default for SignalDispositions {
    /// Default table: timer/job-control noise is passed through without
    /// stopping, while SIGTRAP and SIGINT belong to the debugger and are
    /// never re-delivered.
    fn default() -> Self {
        const NOSTOP_PASS: Disposition = Disposition {
            stop: false,
            pass: true,
        };
        const STOP_NOPASS: Disposition = Disposition {
            stop: true,
            pass: false,
        };

        let mut overrides = HashMap::new();

        for sig in [
            Sig::ALRM,
            Sig::VTALRM,
            Sig::PROF,
            Sig::CHLD,
            Sig::URG,
            Sig::WINCH,
            Sig::IO,
        ] {
            overrides.insert(sig, NOSTOP_PASS);
        }

        overrides.insert(Sig::TRAP, STOP_NOPASS);
        overrides.insert(Sig::INT, STOP_NOPASS);

        Self { overrides }
    }
}

#[cfg(test)]
mod tests {
    use super::{Disposition, Sig, SignalDispositions};

    #[test]
    fn default_dispositions() {
        let table = SignalDispositions::default();

        // debugger-owned signals stop and are swallowed
        assert_eq!(table.get(Sig::TRAP), Disposition { stop: true, pass: false });
        assert_eq!(table.get(Sig::INT), Disposition { stop: true, pass: false });

        // background noise is passed through silently
        for sig in [Sig::ALRM, Sig::CHLD, Sig::WINCH] {
            assert_eq!(table.get(sig), Disposition { stop: false, pass: true });
        }

        // everything else stops and is re-delivered
        assert_eq!(table.get(Sig::SEGV), Disposition { stop: true, pass: true });
        assert_eq!(table.get(Sig::TERM), Disposition { stop: true, pass: true });
    }

    #[test]
    fn overrides() {
        let mut table = SignalDispositions::default();
        table.set(Sig::SEGV, Disposition { stop: false, pass: true });

        assert_eq!(table.get(Sig::SEGV), Disposition { stop: false, pass: true });
    }
}
