//! Event-type catalogue
//!
//! Event types are 0-indexed in userspace. Index 0 is `Unknown`, which the
//! kernel never emits: statistics map keys start at 1.

/// Kernel event types tracked by the perf buffer statistics
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Unknown = 0,
    FileOpen,
    FileMkdir,
    FileLink,
    FileRename,
    FileUnlink,
    FileRmdir,
    FileChmod,
    FileChown,
    FileUtime,
    FileSetXAttr,
    FileRemoveXAttr,
    FileMount,
    FileUmount,
    Fork,
    Exec,
    Exit,
    InvalidateDentry,
    Setuid,
    Setgid,
    Capset,
    ArgsEnvs,
    MountReleased,
    SELinux,
    Bpf,
}

/// Number of event types, the size of every per-event-type array
pub const MAX_EVENT_TYPE: usize = EventType::ALL.len();

impl EventType {
    /// Every event type, ordered by index
    pub const ALL: [EventType; 25] = [
        EventType::Unknown,
        EventType::FileOpen,
        EventType::FileMkdir,
        EventType::FileLink,
        EventType::FileRename,
        EventType::FileUnlink,
        EventType::FileRmdir,
        EventType::FileChmod,
        EventType::FileChown,
        EventType::FileUtime,
        EventType::FileSetXAttr,
        EventType::FileRemoveXAttr,
        EventType::FileMount,
        EventType::FileUmount,
        EventType::Fork,
        EventType::Exec,
        EventType::Exit,
        EventType::InvalidateDentry,
        EventType::Setuid,
        EventType::Setgid,
        EventType::Capset,
        EventType::ArgsEnvs,
        EventType::MountReleased,
        EventType::SELinux,
        EventType::Bpf,
    ];

    /// Look up an event type by its numeric id
    pub fn from_index(index: u32) -> Option<EventType> {
        Self::ALL.get(index as usize).copied()
    }

    /// Numeric id of the event type
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in metric tags and notifications
    pub fn name(self) -> &'static str {
        match self {
            EventType::Unknown => "unknown",
            EventType::FileOpen => "open",
            EventType::FileMkdir => "mkdir",
            EventType::FileLink => "link",
            EventType::FileRename => "rename",
            EventType::FileUnlink => "unlink",
            EventType::FileRmdir => "rmdir",
            EventType::FileChmod => "chmod",
            EventType::FileChown => "chown",
            EventType::FileUtime => "utimes",
            EventType::FileSetXAttr => "setxattr",
            EventType::FileRemoveXAttr => "removexattr",
            EventType::FileMount => "mount",
            EventType::FileUmount => "umount",
            EventType::Fork => "fork",
            EventType::Exec => "exec",
            EventType::Exit => "exit",
            EventType::InvalidateDentry => "invalidate_dentry",
            EventType::Setuid => "setuid",
            EventType::Setgid => "setgid",
            EventType::Capset => "capset",
            EventType::ArgsEnvs => "args_envs",
            EventType::MountReleased => "mount_released",
            EventType::SELinux => "selinux",
            EventType::Bpf => "bpf",
        }
    }

    /// Rename, unlink and rmdir invalidate cached path resolutions
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            EventType::FileRename | EventType::FileUnlink | EventType::FileRmdir
        )
    }

    /// Iterate over every event type, ordered by index
    pub fn iter() -> impl Iterator<Item = EventType> {
        Self::ALL.into_iter()
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ALL must list the variants in discriminant order
const _: () = {
    let mut i = 0;
    while i < EventType::ALL.len() {
        assert!(EventType::ALL[i] as usize == i);
        i += 1;
    }
};
