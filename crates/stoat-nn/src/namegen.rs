use std::collections::HashMap;

/// Per-kind name counters scoped to one graph-build session.
///
/// Layer names like `input1`, `add2`, `affine1` come from here. The
/// counters belong to the graph being built, so two graphs built in the
/// same process number their layers independently.
#[derive(Debug, Default, Clone)]
pub struct NameAllocator {
    counters: HashMap<String, usize>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next name for a layer of the given kind: `kind1`, `kind2`, ...
    pub fn next(&mut self, kind: &str) -> String {
        let n = self.counters.entry(kind.to_string()).or_insert(0);
        *n += 1;
        format!("{}{}", kind, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_kind() {
        let mut names = NameAllocator::new();
        assert_eq!(names.next("input"), "input1");
        assert_eq!(names.next("add"), "add1");
        assert_eq!(names.next("input"), "input2");
        assert_eq!(names.next("add"), "add2");
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut a = NameAllocator::new();
        let mut b = NameAllocator::new();
        assert_eq!(a.next("affine"), "affine1");
        assert_eq!(b.next("affine"), "affine1");
    }
}
