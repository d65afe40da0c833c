//! Value combination rules shared by every backend.
//!
//! `add` and `subtract` read the current entry, combine it with the delta
//! here, and write the result back. Keeping the rules in one place
//! guarantees the in-memory and SQLite backends agree on semantics.

use magnetite_types::{Data, DataKind};

use crate::BackendError;

/// Identity value for `delta`'s type, used when the key is absent.
fn identity_for(delta: &Data) -> Data {
    match delta.kind() {
        DataKind::Count => Data::Count(0),
        DataKind::Integer => Data::Integer(0),
        DataKind::Real => Data::Real(0.0),
        DataKind::Text => Data::Text(String::new()),
        DataKind::Set => Data::Set(Default::default()),
        DataKind::Table => Data::Table(Default::default()),
        DataKind::Vector => Data::Vector(Vec::new()),
        // Scalar deltas aimed at a set: absent key starts as an empty set
        // only when the existing entry says so; with no entry, fall back
        // to the delta itself being the first value.
        _ => Data::None,
    }
}

fn clash(op: &'static str, existing: &Data, delta: &Data) -> BackendError {
    BackendError::TypeClash {
        op,
        existing: existing.kind(),
        delta: delta.kind(),
    }
}

/// Computes `existing + delta`. `None` existing behaves as the identity of
/// `delta`'s type.
pub fn add(existing: Option<Data>, delta: &Data) -> Result<Data, BackendError> {
    let existing = existing.unwrap_or_else(|| identity_for(delta));
    match (existing, delta) {
        (Data::Count(a), Data::Count(b)) => Ok(Data::Count(a.wrapping_add(*b))),
        (Data::Integer(a), Data::Integer(b)) => Ok(Data::Integer(a.wrapping_add(*b))),
        (Data::Real(a), Data::Real(b)) => Ok(Data::Real(a + b)),
        (Data::Text(mut a), Data::Text(b)) => {
            a.push_str(b);
            Ok(Data::Text(a))
        }
        (Data::Set(mut a), Data::Set(b)) => {
            a.extend(b.iter().cloned());
            Ok(Data::Set(a))
        }
        // set ∪ {delta}: a scalar delta joins the set as an element.
        (Data::Set(mut a), b) => {
            a.insert(b.clone());
            Ok(Data::Set(a))
        }
        (Data::Vector(mut a), Data::Vector(b)) => {
            a.extend(b.iter().cloned());
            Ok(Data::Vector(a))
        }
        // Right side wins on key collision.
        (Data::Table(mut a), Data::Table(b)) => {
            for (k, v) in b {
                a.insert(k.clone(), v.clone());
            }
            Ok(Data::Table(a))
        }
        (existing, delta) => Err(clash("add", &existing, delta)),
    }
}

/// Computes `existing - delta` where the operation has an inverse.
/// `Count` saturates at zero instead of wrapping.
pub fn subtract(existing: Option<Data>, delta: &Data) -> Result<Data, BackendError> {
    let existing = existing.unwrap_or_else(|| identity_for(delta));
    match (existing, delta) {
        (Data::Count(a), Data::Count(b)) => Ok(Data::Count(a.saturating_sub(*b))),
        (Data::Integer(a), Data::Integer(b)) => Ok(Data::Integer(a.wrapping_sub(*b))),
        (Data::Real(a), Data::Real(b)) => Ok(Data::Real(a - b)),
        (Data::Set(mut a), Data::Set(b)) => {
            for x in b {
                a.remove(x);
            }
            Ok(Data::Set(a))
        }
        // set ∖ {delta}
        (Data::Set(mut a), b) => {
            a.remove(b);
            Ok(Data::Set(a))
        }
        (Data::Table(mut a), Data::Table(b)) => {
            for k in b.keys() {
                a.remove(k);
            }
            Ok(Data::Table(a))
        }
        (Data::Table(mut a), Data::Set(b)) => {
            for k in b {
                a.remove(k);
            }
            Ok(Data::Table(a))
        }
        // table ∖ {delta}: remove a single key.
        (Data::Table(mut a), b) => {
            a.remove(b);
            Ok(Data::Table(a))
        }
        (existing, delta) => Err(clash("subtract", &existing, delta)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    #[test]
    fn numeric_addition() {
        assert_eq!(
            add(Some(Data::Count(1)), &Data::Count(2)).unwrap(),
            Data::Count(3)
        );
        assert_eq!(
            add(Some(Data::Integer(-1)), &Data::Integer(3)).unwrap(),
            Data::Integer(2)
        );
        assert_eq!(
            add(Some(Data::Real(0.5)), &Data::Real(0.25)).unwrap(),
            Data::Real(0.75)
        );
    }

    #[test]
    fn absent_key_is_identity() {
        assert_eq!(add(None, &Data::Count(5)).unwrap(), Data::Count(5));
        assert_eq!(
            add(None, &Data::Text("hi".into())).unwrap(),
            Data::Text("hi".into())
        );
        assert_eq!(subtract(None, &Data::Count(5)).unwrap(), Data::Count(0));
        assert_eq!(
            subtract(None, &Data::Integer(5)).unwrap(),
            Data::Integer(-5)
        );
    }

    #[test]
    fn text_concatenation() {
        assert_eq!(
            add(Some(Data::from("foo")), &Data::from("bar")).unwrap(),
            Data::from("foobar")
        );
        assert!(matches!(
            subtract(Some(Data::from("foo")), &Data::from("o")),
            Err(BackendError::TypeClash { .. })
        ));
    }

    #[test]
    fn set_union_and_element_insertion() {
        let set: BTreeSet<_> = [Data::Count(1)].into();
        let more: BTreeSet<_> = [Data::Count(2)].into();
        let union = add(Some(Data::Set(set.clone())), &Data::Set(more)).unwrap();
        assert_eq!(
            union,
            Data::Set([Data::Count(1), Data::Count(2)].into())
        );

        let inserted = add(Some(Data::Set(set)), &Data::Count(7)).unwrap();
        assert_eq!(
            inserted,
            Data::Set([Data::Count(1), Data::Count(7)].into())
        );
    }

    #[test]
    fn set_difference() {
        let set: BTreeSet<_> = [Data::Count(1), Data::Count(2)].into();
        let out = subtract(Some(Data::Set(set)), &Data::Count(1)).unwrap();
        assert_eq!(out, Data::Set([Data::Count(2)].into()));
    }

    #[test]
    fn table_union_right_wins() {
        let mut left = BTreeMap::new();
        left.insert(Data::from("k"), Data::Count(1));
        let mut right = BTreeMap::new();
        right.insert(Data::from("k"), Data::Count(2));
        right.insert(Data::from("l"), Data::Count(3));

        let merged = add(Some(Data::Table(left)), &Data::Table(right)).unwrap();
        if let Data::Table(t) = merged {
            assert_eq!(t.get(&Data::from("k")), Some(&Data::Count(2)));
            assert_eq!(t.get(&Data::from("l")), Some(&Data::Count(3)));
        } else {
            panic!("expected table");
        }
    }

    #[test]
    fn table_key_removal() {
        let mut table = BTreeMap::new();
        table.insert(Data::from("a"), Data::Count(1));
        table.insert(Data::from("b"), Data::Count(2));

        let out = subtract(Some(Data::Table(table)), &Data::from("a")).unwrap();
        if let Data::Table(t) = out {
            assert!(!t.contains_key(&Data::from("a")));
            assert!(t.contains_key(&Data::from("b")));
        } else {
            panic!("expected table");
        }
    }

    #[test]
    fn vector_concatenation_only() {
        let out = add(
            Some(Data::Vector(vec![Data::Count(1)])),
            &Data::Vector(vec![Data::Count(2)]),
        )
        .unwrap();
        assert_eq!(out, Data::Vector(vec![Data::Count(1), Data::Count(2)]));

        assert!(matches!(
            subtract(Some(Data::Vector(vec![])), &Data::Vector(vec![])),
            Err(BackendError::TypeClash { .. })
        ));
    }

    #[test]
    fn incompatible_operands_clash() {
        let err = add(Some(Data::from("hello")), &Data::Integer(5)).unwrap_err();
        match err {
            BackendError::TypeClash { existing, delta, .. } => {
                assert_eq!(existing, DataKind::Text);
                assert_eq!(delta, DataKind::Integer);
            }
            other => panic!("expected type clash, got {other:?}"),
        }
    }

    #[test]
    fn count_subtraction_saturates() {
        assert_eq!(
            subtract(Some(Data::Count(1)), &Data::Count(5)).unwrap(),
            Data::Count(0)
        );
    }
}
