//! Error types for the execution core

use thiserror::Error;

/// Result alias used by the top-level crates
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Umbrella error type
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("PPU error: {0}")]
    Ppu(#[from] PpuError),

    #[error("recompiler error: {0}")]
    Jit(#[from] JitError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Guest memory access errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {size} bytes at 0x{addr:08x} is outside guest memory")]
    OutOfRange { addr: u32, size: u32 },

    #[error("address 0x{addr:08x} is not mapped")]
    Unmapped { addr: u32 },

    #[error("address 0x{addr:08x} is read-only")]
    ReadOnly { addr: u32 },

    #[error("mapping of {size} bytes at 0x{addr:08x} overlaps an existing region")]
    Overlap { addr: u32, size: u32 },

    #[error("mapping base 0x{addr:08x} is not aligned to a cache line")]
    Misaligned { addr: u32 },

    #[error("guest memory exhausted allocating {size} bytes")]
    OutOfMemory { size: u32 },
}

/// PPU execution errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PpuError {
    #[error("invalid instruction 0x{opcode:08x} at 0x{addr:08x}")]
    InvalidInstruction { addr: u32, opcode: u32 },

    #[error("illegal instruction 0x{opcode:08x} at 0x{addr:08x}")]
    IllegalInstruction { addr: u32, opcode: u32 },

    #[error("trap at 0x{addr:08x}")]
    Trap { addr: u32 },

    #[error("reservation access of {size} bytes at 0x{addr:08x} is misaligned")]
    UnalignedReservation { addr: u32, size: u32 },

    #[error("reservation address 0x{addr:08x} is outside guest memory")]
    ReservationOutOfRange { addr: u32 },

    #[error("thread {id} terminated: {reason}")]
    ThreadTerminated { id: u32, reason: String },

    #[error("escape requested without an active gateway frame")]
    NoGatewayFrame,

    #[error("invalid thread command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Recompiler errors
#[derive(Debug, Error)]
pub enum JitError {
    #[error("module '{module}' is too large ({size} bytes, limit {limit})")]
    ModuleTooLarge { module: String, size: u64, limit: u64 },

    #[error("module '{module}' is malformed: {reason}")]
    MalformedModule { module: String, reason: String },

    #[error("verification of {chunk} failed at function 0x{function:08x}: {reason}")]
    Verification { chunk: String, function: u32, reason: String },

    #[error("backend failed on {chunk}: {reason}")]
    Backend { chunk: String, reason: String },

    #[error("compilation cancelled")]
    Cancelled,

    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("object serialization failed: {0}")]
    Serialization(String),
}

/// Kernel collaborator errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("unknown syscall {0}")]
    UnknownSyscall(u64),

    #[error("kernel call failed: {0}")]
    Failed(String),
}

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PpuError::UnalignedReservation { addr: 0x1002, size: 4 };
        assert_eq!(
            err.to_string(),
            "reservation access of 4 bytes at 0x00001002 is misaligned"
        );

        let err: EmulatorError = MemoryError::Unmapped { addr: 0x10 }.into();
        assert!(err.to_string().contains("0x00000010"));
    }

    #[test]
    fn test_memory_error_into_ppu_error() {
        let err: PpuError = MemoryError::ReadOnly { addr: 4 }.into();
        assert!(matches!(err, PpuError::Memory(MemoryError::ReadOnly { addr: 4 })));
    }
}
