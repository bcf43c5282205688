use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const INTEGERKEY = 0x08;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const CURRENT = 0x40;
        const APPEND = 0x20000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
    }
}

// Transaction state
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TxnState: u32 {
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const RESET = 0x04;
    }
}

// Internal node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        const BIGDATA = 0x01;
        const SUBDATA = 0x02;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

/// Page size used for every environment
pub const PAGE_SIZE: usize = 4096;
/// Magic number for lumodb files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// On-disk format version
pub const DATA_VERSION: u32 = 1;
/// Number of meta pages at the start of the file
pub const META_PAGES: usize = 2;
/// Smallest usable map, in pages
pub const MIN_MAP_PAGES: usize = 4;
/// Default map size (1 MiB)
pub const DEFAULT_MAP_SIZE: usize = 1 << 20;
/// Default maximum number of named databases
pub const DEFAULT_MAX_DBS: u32 = 0;
/// Default size of the reader table
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = 511;
/// Name of the data file inside an environment directory
pub const DATA_FILE_NAME: &str = "data.mdb";
/// Handle of the unnamed main database
pub const MAIN_DBI: u32 = 0;
/// Page number used for "no page"
pub const P_INVALID: u64 = 0;
