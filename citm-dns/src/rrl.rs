//! Response rate limiting.
//!
//! Other servers rate-limit on (source, question); we key on the source
//! alone, because there is nothing in our tiny zone worth asking many
//! times.  IPv6 sources are folded to their /64, since the rest of the
//! address space is attacker-controlled.
//!
//! Each bucket is one byte: 5 bits of 32-second-window timestamp and 3
//! bits of count.  A stale stamp resets the bucket; a count that
//! saturates denies until the window rolls.

use std::net::IpAddr;

pub struct Rrl {
    buckets: Vec<u8>,
}

impl Rrl {
    pub fn new(nbuckets: usize) -> Rrl {
        Rrl { buckets: vec![0; nbuckets] }
    }

    /// True if this source is still under its limit for the current
    /// window; at most 8 trues per source per window.
    pub fn check(&mut self, source: IpAddr, now_secs: u64) -> bool {
        if self.buckets.is_empty() {
            return true;
        }
        let hash = hash_addr(source) as usize % self.buckets.len();
        let window = ((now_secs / 32) & 0x1f) as u8;
        let bucket = self.buckets[hash];
        let stamp = (bucket >> 3) & 0x1f;
        if stamp != window {
            self.buckets[hash] = window << 3;
            return true;
        }
        let count = bucket & 0x7;
        if count == 7 {
            return false;
        }
        self.buckets[hash] = (window << 3) | (count + 1);
        true
    }
}

/// Robert Jenkins' 32-bit mix plus Knuth's multiplicative step.
fn hash_u32(mut key: u32) -> u32 {
    key = key.wrapping_add(key << 12);
    key ^= key >> 22;
    key = key.wrapping_add(key << 4);
    key ^= key >> 9;
    key = key.wrapping_add(key << 10);
    key ^= key >> 2;
    key = key.wrapping_add(key << 7);
    key ^= key >> 12;
    ((key >> 3).wrapping_mul(2654435761)) & 0xFFFFFFFF
}

fn hash_addr(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => hash_u32(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => {
            // only the /64 prefix; the host half is free for an
            // attacker to vary
            let o = v6.octets();
            let a = u32::from_be_bytes([o[0], o[1], o[2], o[3]]);
            let b = u32::from_be_bytes([o[4], o[5], o[6], o[7]]);
            hash_u32(a) ^ hash_u32(b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const NOW: u64 = 1_000_000;

    #[test]
    fn at_most_eight_per_window() {
        let mut rrl = Rrl::new(1024);
        let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let mut allowed = 0;
        for _ in 0..50 {
            if rrl.check(ip, NOW) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 8);
    }

    #[test]
    fn window_roll_resets() {
        let mut rrl = Rrl::new(1024);
        let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        for _ in 0..20 {
            rrl.check(ip, NOW);
        }
        assert!(!rrl.check(ip, NOW));
        assert!(rrl.check(ip, NOW + 32));
    }

    #[test]
    fn sources_are_independent() {
        let mut rrl = Rrl::new(1 << 16);
        let a: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        for _ in 0..8 {
            assert!(rrl.check(a, NOW));
        }
        assert!(!rrl.check(a, NOW));
        assert!(rrl.check(b, NOW));
    }

    #[test]
    fn ipv6_host_bits_share_a_bucket() {
        let mut rrl = Rrl::new(1 << 16);
        let base: Ipv6Addr = "2001:db8:1:2::1".parse().unwrap();
        let same_64: Ipv6Addr = "2001:db8:1:2::ffff".parse().unwrap();
        for _ in 0..8 {
            rrl.check(base.into(), NOW);
        }
        // varying the low 64 bits does not buy a fresh bucket
        assert!(!rrl.check(same_64.into(), NOW));
    }

    #[test]
    fn zero_buckets_always_allows() {
        let mut rrl = Rrl::new(0);
        let ip: IpAddr = Ipv4Addr::new(1, 1, 1, 1).into();
        for _ in 0..100 {
            assert!(rrl.check(ip, NOW));
        }
    }
}
