use std::fmt;
use std::io::{self, Read};

use crate::types::Addr;

/// Descriptor of a memory region a symbolic dereference reads from. The
/// region's concrete contents at evaluation time travel separately, as the
/// snapshot bytes nested in the dereference node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicObject {
    start: Addr,
    size: usize,
}

impl SymbolicObject {
    pub fn new(start: Addr, size: usize) -> Self {
        Self { start, size }
    }

    pub fn start(&self) -> Addr {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.start + self.size as Addr
    }

    /// Wire format: `<start:u64> <size:u64>`, little-endian.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&(self.size as u64).to_le_bytes());
    }

    pub fn parse(r: &mut impl Read) -> io::Result<Self> {
        let mut word = [0u8; 8];
        r.read_exact(&mut word)?;
        let start = u64::from_le_bytes(word);
        r.read_exact(&mut word)?;
        let size = u64::from_le_bytes(word) as usize;
        Ok(Self { start, size })
    }
}

impl fmt::Display for SymbolicObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start, self.start + self.size as Addr)
    }
}
