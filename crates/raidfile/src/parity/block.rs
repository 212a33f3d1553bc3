use std::ops::{BitXor, BitXorAssign};

/// Block is one stripe-width buffer taking part in a parity computation.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Block(Vec<u8>);

impl Block {
    #[inline]
    #[must_use]
    pub fn zero(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    #[inline]
    #[must_use]
    pub const fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    #[inline]
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    /// XOR `rhs` into this block.
    ///
    /// # Arguments
    /// * `rhs` - The block to XOR into this one; only the common prefix is combined.
    pub fn xor_in_place(&mut self, rhs: &Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= *b;
        }
    }
}

impl From<Vec<u8>> for Block {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl BitXor<&Self> for Block {
    type Output = Self;
    #[inline]
    fn bitxor(mut self, rhs: &Self) -> Self::Output {
        self.xor_in_place(rhs);
        self
    }
}

impl BitXorAssign<&Self> for Block {
    #[inline]
    fn bitxor_assign(&mut self, rhs: &Self) {
        self.xor_in_place(rhs);
    }
}
