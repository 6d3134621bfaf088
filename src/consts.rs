//! VM parameters

/* MODULE CONTAINER */

/// Header magic, `"SBC0"` little-endian.
pub const MODULE_MAGIC: u32 = 0x3043_4253;

/// The one supported container version.
pub const MODULE_VERSION: u16 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Fixed section table entry size in bytes.
pub const SECTION_ENTRY_SIZE: usize = 16;

/// Sentinel for a void return type in signatures.
pub const VOID_TYPE: u32 = u32::MAX;

/// Sentinel for a global without an init constant.
pub const NO_INIT: u32 = u32::MAX;

/// Sentinel in a function record for "no upvalue descriptor".
pub const NO_UPVAL_DESC: u32 = 0;

/* EXECUTION */

/// Value-stack capacity used when the header's `stack_max` is zero.
pub const DEFAULT_STACK_MAX: u32 = 1024;

/// Hard bound on call depth, independent of stack_max.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Function entry count after which the profiler marks a function hot
/// when `enable_jit` is set.
pub const JIT_HOT_THRESHOLD: u64 = 1_000;

/* HEAP */

/// Live-byte threshold of the first GC cycle; doubles after each cycle.
pub const GC_INITIAL_THRESHOLD: usize = 256 * 1024;

/// Smallest backing capacity a list allocates.
pub const LIST_MIN_CAPACITY: u32 = 4;

/* HOST */

/// First file descriptor handed out by core.fs (0..2 mirror stdio).
pub const FIRST_USER_FD: i32 = 3;
