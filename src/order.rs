//! Composable total orders.
//!
//! The engine requires only a total order on `SK` and `TK` (`spec.md` §3);
//! this module gives that order a first-class representation so it can be
//! composed lexicographically and, where §4.5 needs it, extended with a
//! synthetic tiebreak ("instructions precede existing rows at identical
//! keys") that has no counterpart in the user-visible key type at all.

use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over `T`, represented as a cloneable function object so it
/// can be threaded through sorters, cursors, and executors without
/// monomorphizing every component over a concrete `Ord` impl.
#[derive(Clone)]
pub struct Comparator<T: ?Sized>(Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>);

impl<T: ?Sized> Comparator<T> {
    /// Wraps an arbitrary comparison closure.
    pub fn new(f: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Comparator(Arc::new(f))
    }

    /// Compares two values.
    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.0)(a, b)
    }

    /// Reverses the order.
    pub fn reverse(&self) -> Self {
        let inner = self.0.clone();
        Comparator::new(move |a, b| inner(a, b).reverse())
    }

    /// Lexicographic composition: `self`, falling back to `other` on ties.
    pub fn then(&self, other: Comparator<T>) -> Self {
        let a = self.0.clone();
        let b = other.0.clone();
        Comparator::new(move |x, y| match a(x, y) {
            Ordering::Equal => b(x, y),
            ord => ord,
        })
    }
}

impl<T: Ord> Comparator<T> {
    /// The natural order of `T`.
    pub fn natural() -> Self {
        Comparator::new(|a, b| a.cmp(b))
    }
}

impl<T: ?Sized> std::fmt::Debug for Comparator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Comparator(..)")
    }
}

/// Builds the secondary tiebreak used by §4.5's KeyMappings executor and
/// §4.6's Content executor: for two rows agreeing on the "real" key,
/// instructions sort before existing persisted rows. `is_instruction`
/// distinguishes the two kinds for each side of the comparison.
pub fn instructions_before_existing<T: Clone>(
    primary: Comparator<T>,
    is_instruction: impl Fn(&T) -> bool + Send + Sync + 'static,
) -> Comparator<T> {
    primary.then(Comparator::new(move |a, b| {
        match (is_instruction(a), is_instruction(b)) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_agrees_with_ord() {
        let cmp = Comparator::<i32>::natural();
        assert_eq!(cmp.compare(&1, &2), Ordering::Less);
        assert_eq!(cmp.compare(&2, &1), Ordering::Greater);
        assert_eq!(cmp.compare(&1, &1), Ordering::Equal);
    }

    #[test]
    fn reverse_flips_order() {
        let cmp = Comparator::<i32>::natural().reverse();
        assert_eq!(cmp.compare(&1, &2), Ordering::Greater);
    }

    #[test]
    fn then_breaks_ties() {
        let primary = Comparator::<(i32, i32)>::new(|a, b| a.0.cmp(&b.0));
        let secondary = Comparator::<(i32, i32)>::new(|a, b| a.1.cmp(&b.1));
        let composite = primary.then(secondary);
        assert_eq!(composite.compare(&(1, 2), &(1, 1)), Ordering::Greater);
        assert_eq!(composite.compare(&(1, 2), &(2, 0)), Ordering::Less);
    }

    #[test]
    fn instruction_tiebreak_precedes_existing() {
        #[derive(Clone)]
        enum Row {
            Instr(i32),
            Existing(i32),
        }
        let key = |r: &Row| match r {
            Row::Instr(k) | Row::Existing(k) => *k,
        };
        let primary = Comparator::<Row>::new(move |a, b| key(a).cmp(&key(b)));
        let cmp = instructions_before_existing(primary, |r| matches!(r, Row::Instr(_)));
        assert_eq!(
            cmp.compare(&Row::Instr(1), &Row::Existing(1)),
            Ordering::Less
        );
        assert_eq!(
            cmp.compare(&Row::Existing(1), &Row::Instr(1)),
            Ordering::Greater
        );
    }
}
