//! Filesystem change events.

use drift_wire::FileDescriptor;

/// One observed change to the shared tree.
///
/// File events inline the full descriptor so a consumer can reproduce the
/// change without a follow-up query. Paths are relative to the share root,
/// `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file appeared.
    FileCreate {
        /// Path relative to the share root.
        path_name: String,
        /// Descriptor of the complete file.
        descriptor: FileDescriptor,
    },
    /// A file's content (or timestamp) changed.
    FileModify {
        /// Path relative to the share root.
        path_name: String,
        /// Descriptor of the new content.
        descriptor: FileDescriptor,
    },
    /// A file disappeared.
    FileDelete {
        /// Path relative to the share root.
        path_name: String,
        /// Descriptor the file had when last seen.
        descriptor: FileDescriptor,
    },
    /// A directory appeared.
    DirectoryCreate {
        /// Path relative to the share root.
        path_name: String,
    },
    /// A directory disappeared.
    DirectoryDelete {
        /// Path relative to the share root.
        path_name: String,
    },
}

impl FsEvent {
    /// The path this event is about.
    pub fn path_name(&self) -> &str {
        match self {
            FsEvent::FileCreate { path_name, .. }
            | FsEvent::FileModify { path_name, .. }
            | FsEvent::FileDelete { path_name, .. }
            | FsEvent::DirectoryCreate { path_name }
            | FsEvent::DirectoryDelete { path_name } => path_name,
        }
    }

    /// Number of path components. Creation batches sort ascending by this
    /// (parents announced before children); deletion batches descending
    /// (children before ancestors).
    pub fn depth(&self) -> usize {
        self.path_name().split('/').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_counts_components() {
        let ev = FsEvent::DirectoryCreate {
            path_name: "a/b/c".to_string(),
        };
        assert_eq!(ev.depth(), 3);

        let ev = FsEvent::DirectoryCreate {
            path_name: "top".to_string(),
        };
        assert_eq!(ev.depth(), 1);
    }

    #[test]
    fn path_name_is_uniform_across_variants() {
        let fd = FileDescriptor::new("00", 0, 0);
        let events = [
            FsEvent::FileCreate {
                path_name: "p".to_string(),
                descriptor: fd.clone(),
            },
            FsEvent::FileModify {
                path_name: "p".to_string(),
                descriptor: fd.clone(),
            },
            FsEvent::FileDelete {
                path_name: "p".to_string(),
                descriptor: fd,
            },
            FsEvent::DirectoryCreate {
                path_name: "p".to_string(),
            },
            FsEvent::DirectoryDelete {
                path_name: "p".to_string(),
            },
        ];
        for ev in &events {
            assert_eq!(ev.path_name(), "p");
        }
    }
}
