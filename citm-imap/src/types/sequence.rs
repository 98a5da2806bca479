use std::collections::BTreeSet;
use std::fmt;

use crate::error::ImapError;

/// One `seq-number:seq-number` range; 0 stands for `*` (the highest
/// number in the mailbox, supplied by the caller at iteration time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqRange {
    pub a: u32,
    pub b: u32,
}

impl SeqRange {
    pub fn single(n: u32) -> SeqRange {
        SeqRange { a: n, b: n }
    }
}

/// A nonempty sequence set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqSet(Vec<SeqRange>);

impl SeqSet {
    pub fn new(ranges: Vec<SeqRange>) -> Result<SeqSet, ImapError> {
        if ranges.is_empty() {
            return Err(ImapError::Value("empty sequence set".into()));
        }
        Ok(SeqSet(ranges))
    }

    pub fn single(n: u32) -> SeqSet {
        SeqSet(vec![SeqRange::single(n)])
    }

    pub fn range(a: u32, b: u32) -> SeqSet {
        SeqSet(vec![SeqRange { a, b }])
    }

    /// Build a set from explicit numbers, coalescing adjacent runs.
    pub fn from_uids(uids: &[u32]) -> Option<SeqSet> {
        let sorted: BTreeSet<u32> = uids.iter().copied().collect();
        let mut ranges: Vec<SeqRange> = Vec::new();
        for n in sorted {
            match ranges.last_mut() {
                Some(r) if r.b + 1 == n => r.b = n,
                _ => ranges.push(SeqRange::single(n)),
            }
        }
        SeqSet::new(ranges).ok()
    }

    pub fn ranges(&self) -> &[SeqRange] {
        &self.0
    }

    pub fn contains_star(&self) -> bool {
        self.0.iter().any(|r| r.a == 0 || r.b == 0)
    }

    /// True if `n` falls in the set, given the current highest number.
    pub fn contains(&self, n: u32, max: u32) -> bool {
        self.0.iter().any(|r| {
            let (a, b) = resolve(r, max);
            n >= a && n <= b
        })
    }

    /// The ordered, de-duplicated expansion, clamped to `[min, max]`.
    /// `*` resolves to `max`.
    pub fn iter(&self, min: u32, max: u32) -> impl Iterator<Item = u32> {
        let mut out: BTreeSet<u32> = BTreeSet::new();
        for r in &self.0 {
            let (a, b) = resolve(r, max);
            let lo = a.max(min);
            let hi = b.min(max);
            if lo == 0 {
                continue;
            }
            for n in lo..=hi {
                out.insert(n);
            }
        }
        out.into_iter()
    }
}

fn resolve(r: &SeqRange, max: u32) -> (u32, u32) {
    let a = if r.a == 0 { max } else { r.a };
    let b = if r.b == 0 { max } else { r.b };
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl fmt::Display for SeqSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let num = |n: u32| -> String {
                if n == 0 {
                    "*".into()
                } else {
                    n.to_string()
                }
            };
            if r.a == r.b {
                f.write_str(&num(r.a))?;
            } else {
                write!(f, "{}:{}", num(r.a), num(r.b))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(set: &SeqSet, min: u32, max: u32) -> Vec<u32> {
        set.iter(min, max).collect()
    }

    #[test]
    fn expansion_is_sorted_and_deduped() {
        let set = SeqSet::new(vec![
            SeqRange { a: 5, b: 3 },
            SeqRange::single(4),
            SeqRange { a: 9, b: 0 },
        ])
        .unwrap();
        // 5:3 normalizes to 3..5, * -> 12
        assert_eq!(expand(&set, 1, 12), vec![3, 4, 5, 9, 10, 11, 12]);
    }

    #[test]
    fn expansion_respects_bounds() {
        let set = SeqSet::range(1, 100);
        assert_eq!(expand(&set, 40, 42), vec![40, 41, 42]);
        let star = SeqSet::single(0);
        assert_eq!(expand(&star, 1, 7), vec![7]);
    }

    #[test]
    fn star_past_max_clamps() {
        // 50:* with max=10 means 10:50, clamped to 10
        let set = SeqSet::range(50, 0);
        assert_eq!(expand(&set, 1, 10), vec![10]);
    }

    #[test]
    fn empty_rejected() {
        assert!(SeqSet::new(vec![]).is_err());
    }

    #[test]
    fn from_uids_coalesces() {
        let set = SeqSet::from_uids(&[3, 5, 1, 2]).unwrap();
        assert_eq!(set.to_string(), "1:3,5");
        assert!(SeqSet::from_uids(&[]).is_none());
    }

    #[test]
    fn display_star() {
        assert_eq!(SeqSet::range(1, 0).to_string(), "1:*");
    }
}
