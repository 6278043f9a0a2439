//! Per-module edge coverage sets and the set algebra the engine runs on.

use crate::{HashMap, HashSet};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

// upper bounds applied when deserializing untrusted data
const MAX_MODULE_NAME_LEN: u32 = 4096;
const MAX_MODULE_EDGES: u64 = 1 << 32;

#[derive(Debug, Error)]
pub enum CoverageReadError {
    #[error("truncated coverage data: {0}")]
    Io(#[from] io::Error),
    #[error("malformed coverage data")]
    Malformed,
}

/// A set of `(module, offset)` edges, grouped by module.
///
/// One edge is one instrumented control-flow location. No ordering is
/// exposed; the engine only ever needs union, difference, intersection
/// and containment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    modules: HashMap<String, HashSet<u64>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, module: &str, offset: u64) {
        if let Some(offsets) = self.modules.get_mut(module) {
            offsets.insert(offset);
        } else {
            let mut offsets = HashSet::default();
            offsets.insert(offset);
            self.modules.insert(module.to_string(), offsets);
        }
    }

    pub fn has_edge(&self, module: &str, offset: u64) -> bool {
        self.modules
            .get(module)
            .map(|offsets| offsets.contains(&offset))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.values().all(|offsets| offsets.is_empty())
    }

    pub fn num_edges(&self) -> usize {
        self.modules.values().map(|offsets| offsets.len()).sum()
    }

    /// `self <- self U other`.
    pub fn merge(&mut self, other: &Coverage) {
        for (module, offsets) in other.modules.iter() {
            if offsets.is_empty() {
                continue;
            }
            if let Some(known) = self.modules.get_mut(module) {
                known.extend(offsets.iter().copied());
            } else {
                self.modules.insert(module.clone(), offsets.clone());
            }
        }
    }

    /// Edges of `self` that are not in `other`.
    pub fn difference(&self, other: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for (module, offsets) in self.modules.iter() {
            let new: HashSet<u64> = match other.modules.get(module) {
                Some(known) => offsets.difference(known).copied().collect(),
                None => offsets.clone(),
            };
            if !new.is_empty() {
                out.modules.insert(module.clone(), new);
            }
        }
        out
    }

    /// Edges present in both `self` and `other`.
    pub fn intersection(&self, other: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for (module, offsets) in self.modules.iter() {
            if let Some(theirs) = other.modules.get(module) {
                let common: HashSet<u64> = offsets.intersection(theirs).copied().collect();
                if !common.is_empty() {
                    out.modules.insert(module.clone(), common);
                }
            }
        }
        out
    }

    /// True iff every edge of `sub` is also in `self`.
    pub fn contains(&self, sub: &Coverage) -> bool {
        for (module, offsets) in sub.modules.iter() {
            match self.modules.get(module) {
                Some(known) => {
                    if !offsets.is_subset(known) {
                        return false;
                    }
                }
                None => {
                    if !offsets.is_empty() {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn iter_edges(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.modules.iter().flat_map(|(module, offsets)| {
            offsets.iter().map(move |offset| (module.as_str(), *offset))
        })
    }

    /// Little-endian binary form: module count, then per module the name
    /// length, name bytes, edge count and offsets. Symmetric with
    /// [`Coverage::read_from`]; stable within one engine version.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.modules.len() as u32)?;
        for (module, offsets) in self.modules.iter() {
            w.write_u32::<LittleEndian>(module.len() as u32)?;
            w.write_all(module.as_bytes())?;
            w.write_u64::<LittleEndian>(offsets.len() as u64)?;
            for offset in offsets.iter() {
                w.write_u64::<LittleEndian>(*offset)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Coverage, CoverageReadError> {
        let mut out = Coverage::new();
        let num_modules = r.read_u32::<LittleEndian>()?;
        for _ in 0..num_modules {
            let name_len = r.read_u32::<LittleEndian>()?;
            if name_len > MAX_MODULE_NAME_LEN {
                return Err(CoverageReadError::Malformed);
            }
            let mut name = vec![0u8; name_len as usize];
            r.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| CoverageReadError::Malformed)?;
            let num_offsets = r.read_u64::<LittleEndian>()?;
            if num_offsets > MAX_MODULE_EDGES {
                return Err(CoverageReadError::Malformed);
            }
            let mut offsets = HashSet::default();
            for _ in 0..num_offsets {
                offsets.insert(r.read_u64::<LittleEndian>()?);
            }
            out.modules.insert(name, offsets);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn coverage(edges: &[(&str, u64)]) -> Coverage {
        let mut cov = Coverage::new();
        for (module, offset) in edges {
            cov.add_edge(module, *offset);
        }
        cov
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = coverage(&[("a", 1), ("a", 2), ("b", 7)]);
        let snapshot = a.clone();
        a.merge(&snapshot);
        assert_eq!(a, snapshot);

        a.merge(&coverage(&[("b", 8), ("c", 1)]));
        assert_eq!(a.num_edges(), 5);
        assert!(a.has_edge("c", 1));
    }

    #[test]
    fn difference_with_self_is_empty() {
        let a = coverage(&[("a", 1), ("b", 2)]);
        assert!(a.difference(&a).is_empty());

        let b = coverage(&[("a", 1)]);
        let d = a.difference(&b);
        assert_eq!(d.num_edges(), 1);
        assert!(d.has_edge("b", 2));
    }

    #[test]
    fn intersection_is_subset_of_both() {
        let a = coverage(&[("a", 1), ("a", 2), ("b", 3)]);
        let b = coverage(&[("a", 2), ("b", 3), ("c", 9)]);
        let i = a.intersection(&b);
        assert!(a.contains(&i));
        assert!(b.contains(&i));
        assert_eq!(i.num_edges(), 2);
    }

    #[test]
    fn contains_requires_every_edge() {
        let a = coverage(&[("a", 1), ("a", 2)]);
        assert!(a.contains(&coverage(&[("a", 1)])));
        assert!(a.contains(&Coverage::new()));
        assert!(!a.contains(&coverage(&[("a", 3)])));
        assert!(!a.contains(&coverage(&[("b", 1)])));
    }

    #[test]
    fn binary_round_trip() {
        let a = coverage(&[("a", 1), ("a", 0xdeadbeef), ("libfoo.so", 42)]);
        let mut buf = Vec::new();
        a.write_to(&mut buf).unwrap();
        let b = Coverage::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(a, b);

        let empty = Coverage::new();
        let mut buf = Vec::new();
        empty.write_to(&mut buf).unwrap();
        let back = Coverage::read_from(&mut Cursor::new(&buf)).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn read_rejects_garbage() {
        let garbage = [0xffu8; 16];
        assert!(Coverage::read_from(&mut Cursor::new(&garbage)).is_err());
    }
}
