macro_rules! count {
    () => (0usize);
    ( $x:tt $($xs:tt)* ) => (1usize + count!($($xs)*));
}

/// https://stackoverflow.com/a/64678145/10854888
macro_rules! iterable_enum {
    ($(#[$derives:meta])* $(vis $visibility:vis)? enum $name:ident { $($(#[$nested_meta:meta])* $member:ident),* }) => {
        const COUNT_MEMBERS: usize = count!($($member)*);
        $(#[$derives])*
        $($visibility)? enum $name {
            $($(#[$nested_meta])* $member),*
        }
        impl $name {
            pub const COUNT: usize = COUNT_MEMBERS;

            pub const fn iter() -> [$name; COUNT_MEMBERS] {
                [$($name::$member,)*]
            }
        }
    };
}

iterable_enum! {
    /// Outcome of one invocation of a program. Every invocation ends in
    /// exactly one of these.
    #[cfg_attr(feature = "user", derive(serde::Serialize))]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    #[repr(u32)]
    vis pub enum Metrics {
        /// Existing aggregation entry incremented
        Sample_Counted,
        /// First occurrence of a sample key
        Sample_NewKey,
        /// Lost the insert race for a new sample key, sample dropped
        Sample_KeyRace,

        /// New pid inserted as `Unknown` and reported
        TraceMgmt_NewPid,
        /// Another cpu inserted the pid first
        TraceMgmt_NewPidRace,
        /// The pid config table is full, the pid can't be reported
        ErrSample_PidsFull,

        /// Tail call into a specialized unwinder
        Sample_TailCall,
        /// No program registered at the requested slot
        ErrSample_TailCallMissing,

        ErrSample_NoPid,
        ErrSample_NoTask,
        /// task->flags could not be read
        ErrSample_TaskRead,
        ErrSample_KernelThread,
        /// Controller hasn't resolved the pid yet
        ErrSample_PolicyUnknown,
        /// Controller rejected the pid
        ErrSample_PolicyError,
        /// Unrecognised profile type byte
        ErrSample_PolicyInvalid,

        Lifecycle_PidDead,
        /// Controlling terminal detached without the process exiting
        Lifecycle_NotExiting,
        Lifecycle_Exec,
        ErrLifecycle_NoPid,

        /// Enum Max
        Max
    }
}

impl Metrics {
    /// Outcomes where no data was produced
    pub fn is_err(&self) -> bool {
        matches!(
            self,
            Self::Sample_KeyRace
                | Self::TraceMgmt_NewPidRace
                | Self::ErrSample_PidsFull
                | Self::ErrSample_TailCallMissing
                | Self::ErrSample_NoPid
                | Self::ErrSample_NoTask
                | Self::ErrSample_TaskRead
                | Self::ErrSample_KernelThread
                | Self::ErrSample_PolicyUnknown
                | Self::ErrSample_PolicyError
                | Self::ErrSample_PolicyInvalid
                | Self::Lifecycle_NotExiting
                | Self::ErrLifecycle_NoPid
        )
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::iter().into_iter().find(|m| *m as u32 == v)
    }
}
