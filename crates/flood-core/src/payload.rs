use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// The single byte delimiting a request/response on the wire.
pub const LINE_SEP: u8 = b'\n';

/// Pool of random request bytes. One backing buffer of `range` bytes is
/// filled on construction with capital letters and a trailing separator;
/// each block aliases a random suffix of it, so every block is 1..=range
/// bytes long and always ends with the separator.
pub struct Payload {
    data: Bytes,
    rng: SmallRng,
}

impl Payload {
    pub fn new(range: usize) -> Self {
        assert!(range >= 1, "message size range must be at least 1");
        let mut rng = SmallRng::from_entropy();
        let mut data = vec![0u8; range];
        for byte in &mut data[..range - 1] {
            *byte = rng.gen_range(b'A'..=b'Z');
        }
        data[range - 1] = LINE_SEP;
        Self {
            data: Bytes::from(data),
            rng,
        }
    }

    /// A fresh block at a uniformly drawn offset. Zero-copy: the block
    /// borrows the backing buffer by reference count.
    pub fn block(&mut self) -> Bytes {
        let offset = self.rng.gen_range(0..self.data.len());
        self.data.slice(offset..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_end_with_separator() {
        let mut payload = Payload::new(100);
        for _ in 0..1000 {
            let block = payload.block();
            assert!(!block.is_empty());
            assert!(block.len() <= 100);
            assert_eq!(*block.last().unwrap(), LINE_SEP);
        }
    }

    #[test]
    fn blocks_are_suffixes_of_the_backing_buffer() {
        let mut payload = Payload::new(64);
        let base = payload.data.clone();
        for _ in 0..100 {
            let block = payload.block();
            assert_eq!(block, base.slice(base.len() - block.len()..));
        }
    }

    #[test]
    fn unit_range_always_yields_the_separator() {
        let mut payload = Payload::new(1);
        for _ in 0..10 {
            assert_eq!(payload.block().as_ref(), &[LINE_SEP]);
        }
    }

    #[test]
    fn body_is_capital_letters() {
        let mut payload = Payload::new(32);
        let block = payload.block();
        for &byte in &block[..block.len() - 1] {
            assert!(byte.is_ascii_uppercase());
        }
    }
}
