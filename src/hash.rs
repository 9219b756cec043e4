//! Content hashing used for fragment identity, section folding, build-ids
//! and cardinality estimation

/// SipHash-1-3 over a byte stream. One compression round and three
/// finalization rounds are plenty for hash-table keying and give a
/// noticeably shorter inner loop than the reference 2-4 parameters.
pub struct SipHash13 {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
    buf: [u8; 8],
    buflen: usize,
    sum: u8,
}

impl SipHash13 {
    pub fn new(k0: u64, k1: u64) -> Self {
        SipHash13 {
            v0: 0x736f6d6570736575 ^ k0,
            v1: 0x646f72616e646f6d ^ k1,
            v2: 0x6c7967656e657261 ^ k0,
            v3: 0x7465646279746573 ^ k1,
            buf: [0; 8],
            buflen: 0,
            sum: 0,
        }
    }

    pub fn update(&mut self, mut msg: &[u8]) {
        self.sum = self.sum.wrapping_add(msg.len() as u8);

        if self.buflen > 0 {
            if self.buflen + msg.len() < 8 {
                self.buf[self.buflen..self.buflen + msg.len()].copy_from_slice(msg);
                self.buflen += msg.len();
                return;
            }
            let j = 8 - self.buflen;
            self.buf[self.buflen..].copy_from_slice(&msg[..j]);
            let m = u64::from_le_bytes(self.buf);
            self.compress(m);
            msg = &msg[j..];
            self.buflen = 0;
        }

        while msg.len() >= 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&msg[..8]);
            self.compress(u64::from_le_bytes(bytes));
            msg = &msg[8..];
        }

        self.buf[..msg.len()].copy_from_slice(msg);
        self.buflen = msg.len();
    }

    pub fn finish(mut self) -> u64 {
        for i in self.buflen..8 {
            self.buf[i] = 0;
        }
        let m = ((self.sum as u64) << 56) | u64::from_le_bytes(self.buf);
        self.compress(m);

        self.v2 ^= 0xff;
        for _ in 0..3 {
            self.round();
        }
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    fn compress(&mut self, m: u64) {
        self.v3 ^= m;
        self.round();
        self.v0 ^= m;
    }
}

/// Hash a byte string with a fixed key
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut h = SipHash13::new(0x9ae16a3b2f90404f, 0xc3a5c85c97cb3127);
    h.update(data);
    h.finish()
}

/// Probabilistic distinct-value counter. Mergeable-section maps are sized
/// from the estimate before fragments are inserted for real, so the hash
/// tables rarely need to rehash.
#[derive(Debug)]
pub struct HyperLogLog {
    buckets: Vec<u8>,
}

impl HyperLogLog {
    const NUM_BUCKETS: usize = 2048;
    const ALPHA: f64 = 0.79402;

    pub fn new() -> Self {
        HyperLogLog {
            buckets: vec![0; Self::NUM_BUCKETS],
        }
    }

    /// Feed one 64-bit content hash
    pub fn insert(&mut self, hash: u64) {
        let idx = (hash >> (64 - 11)) as usize;
        let rank = (hash << 11 | 1 << 10).leading_zeros() as u8 + 1;
        if self.buckets[idx] < rank {
            self.buckets[idx] = rank;
        }
    }

    pub fn estimate(&self) -> usize {
        let mut z: f64 = 0.0;
        for &count in &self.buckets {
            z += 1.0 / f64::from(1u32 << count);
        }
        let m = Self::NUM_BUCKETS as f64;
        (Self::ALPHA * m * m / z) as usize
    }

    pub fn merge(&mut self, other: &HyperLogLog) {
        for (a, b) in self.buckets.iter_mut().zip(&other.buckets) {
            *a = (*a).max(*b);
        }
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_siphash_is_stable_and_spreads() {
        let a = hash_bytes(b"hello");
        let b = hash_bytes(b"hello");
        let c = hash_bytes(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Streaming in pieces must match a one-shot hash.
        let mut h = SipHash13::new(0x9ae16a3b2f90404f, 0xc3a5c85c97cb3127);
        h.update(b"he");
        h.update(b"l");
        h.update(b"lo");
        assert_eq!(h.finish(), a);
    }

    #[test]
    fn test_hyperloglog_estimate_is_in_the_ballpark() {
        let mut hll = HyperLogLog::new();
        let n = 50_000u64;
        for i in 0..n {
            hll.insert(hash_bytes(&i.to_le_bytes()));
        }
        let got = hll.estimate() as f64;
        let want = n as f64;
        assert!((got - want).abs() / want < 0.10, "estimate {got} for {want}");
    }
}
