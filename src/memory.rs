/// Size of a memory word in bytes.
pub const WORD_SIZE: u32 = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("address {addr:#x} out of bounds (size {size:#x})")]
    OutOfBounds { addr: u32, size: usize },
    #[error("address {addr:#x} is not word aligned")]
    Misaligned { addr: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Space {
    /// Shared by the wavefronts of one work-group.
    Local,
    /// Shared by the whole dispatch.
    Global,
}

/// Byte-addressed memory accessed in 32-bit words.
#[derive(Clone, PartialEq, Eq)]
pub struct Memory {
    words: Vec<u32>,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.size())
            .finish()
    }
}

impl Memory {
    /// Zero initialized memory of `size` bytes, rounded up to whole words.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(WORD_SIZE as usize)],
        }
    }

    /// Memory of `size` bytes starting with `words`.
    pub fn with_contents(size: usize, words: &[u32]) -> Result<Self, Error> {
        let mut memory = Self::new(size);
        if words.len() > memory.words.len() {
            return Err(Error::OutOfBounds {
                addr: u32::try_from(words.len() * WORD_SIZE as usize).unwrap_or(u32::MAX),
                size: memory.size(),
            });
        }
        memory.words[..words.len()].copy_from_slice(words);
        Ok(memory)
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * WORD_SIZE as usize
    }

    fn index(&self, addr: u32) -> Result<usize, Error> {
        if addr % WORD_SIZE != 0 {
            return Err(Error::Misaligned { addr });
        }
        let index = (addr / WORD_SIZE) as usize;
        if index >= self.words.len() {
            return Err(Error::OutOfBounds {
                addr,
                size: self.size(),
            });
        }
        Ok(index)
    }

    pub fn read(&self, addr: u32) -> Result<u32, Error> {
        let index = self.index(addr)?;
        Ok(self.words[index])
    }

    pub fn write(&mut self, addr: u32, value: u32) -> Result<(), Error> {
        let index = self.index(addr)?;
        self.words[index] = value;
        Ok(())
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Memory};

    #[test]
    fn test_read_write() {
        let mut mem = Memory::new(16);
        assert_eq!(mem.size(), 16);
        mem.write(8, 42).unwrap();
        assert_eq!(mem.read(8), Ok(42));
        assert_eq!(mem.words(), &[0, 0, 42, 0]);
    }

    #[test]
    fn test_faults() {
        let mut mem = Memory::new(16);
        assert_eq!(mem.read(2), Err(Error::Misaligned { addr: 2 }));
        assert_eq!(
            mem.write(16, 1),
            Err(Error::OutOfBounds { addr: 16, size: 16 })
        );
    }

    #[test]
    fn test_with_contents() {
        let mem = Memory::with_contents(16, &[1, 2]).unwrap();
        assert_eq!(mem.words(), &[1, 2, 0, 0]);
        assert!(Memory::with_contents(4, &[1, 2]).is_err());
    }
}
