//! Sorted-set difference used for SyncConnections reconciliation

/// Elements of `a` that are absent from `b`.
///
/// Both inputs must be sorted ascending. Runs a single two-pointer merge.
pub fn ordered_difference(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < a.len() {
        if j >= b.len() {
            result.extend_from_slice(&a[i..]);
            break;
        }

        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                result.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Greater => j += 1,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_stale_connections() {
        assert_eq!(ordered_difference(&[3, 5, 20], &[3]), vec![5, 20]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(ordered_difference(&[], &[]).is_empty());
        assert!(ordered_difference(&[], &[1, 2]).is_empty());
        assert_eq!(ordered_difference(&[1, 2], &[]), vec![1, 2]);
    }

    #[test]
    fn test_interleaved() {
        assert_eq!(
            ordered_difference(&[1, 4, 6, 9, 12], &[2, 4, 5, 9, 13]),
            vec![1, 6, 12]
        );
    }

    fn sorted_set() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::btree_set(-1000i64..1000, 0..64).prop_map(|s| s.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_matches_set_difference(a in sorted_set(), b in sorted_set()) {
            let expected: Vec<i64> = a
                .iter()
                .copied()
                .filter(|x| !b.contains(x))
                .collect();
            prop_assert_eq!(ordered_difference(&a, &b), expected);
        }

        #[test]
        fn prop_self_difference_is_empty(a in sorted_set()) {
            prop_assert!(ordered_difference(&a, &a).is_empty());
        }

        #[test]
        fn prop_superset_difference_is_empty(a in sorted_set(), extra in sorted_set()) {
            let superset: Vec<i64> = a
                .iter()
                .chain(extra.iter())
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            prop_assert!(ordered_difference(&a, &superset).is_empty());
        }

        #[test]
        fn prop_single_extra_element(a in sorted_set(), x in 1000i64..2000) {
            let mut with_x = a.clone();
            with_x.push(x);
            prop_assert_eq!(ordered_difference(&with_x, &a), vec![x]);
        }
    }
}
