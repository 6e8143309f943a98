use opin_fs_types::Sector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("bad user address")]
    BadAddress,
    #[error("no free sector on the file system device")]
    OutOfBlocks,
    #[error("no evictable frame found")]
    OutOfFrames,
    #[error("no free swap slot")]
    OutOfSwap,
    #[error("no free file descriptor")]
    OutOfFds,
    #[error("file system entry not found")]
    EntryNotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("directory in use: {0}")]
    DirectoryInUse(Sector),
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file too large")]
    FileTooLarge,
    #[error("writes denied on inode {0}")]
    WriteDenied(Sector),
    #[error("name longer than NAME_MAX")]
    NameTooLong,
    #[error("memory mapping overlaps an existing region")]
    MapOverlap,
    #[error("resource busy")]
    Busy,
    #[error("process not found")]
    ProcessNotFound,
    #[error("invalid argument")]
    InvalidArgument,
}
