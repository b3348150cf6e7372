//! Index key collation.

use serde_json::Value;
use std::cmp::Ordering;

/// The ordering used to compare view index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// CouchDB default: type order (null < booleans < numbers < strings <
    /// arrays < objects), strings case-insensitively before case.
    #[default]
    Unicode,
    /// Compare the serialised JSON text bytewise.
    Raw,
    /// Like `Unicode` but strings compare by raw code points, so all
    /// uppercase letters sort before lowercase.
    Ascii,
}

/// Rank of a JSON value in the CouchDB type ordering.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_strings(a: &str, b: &str, collation: Collation) -> Ordering {
    match collation {
        Collation::Ascii | Collation::Raw => a.cmp(b),
        Collation::Unicode => {
            // Case-insensitive first, raw code points as the tie breaker, an
            // approximation of ICU collation good enough for index keys.
            let folded = a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase));
            folded.then_with(|| a.cmp(b))
        }
    }
}

/// Compares two JSON keys under the given collation.
#[must_use]
pub fn collate(a: &Value, b: &Value, collation: Collation) -> Ordering {
    if collation == Collation::Raw {
        let left = serde_json::to_string(a).unwrap_or_default();
        let right = serde_json::to_string(b).unwrap_or_default();
        return left.cmp(&right);
    }

    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Null, Value::Null) | (Value::Bool(_), Value::Bool(_)) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => compare_strings(x, y, collation),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = collate(xi, yi, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Objects rarely appear as keys; compare entry by entry in
            // serialised order.
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| collate(xv, yv, collation));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_order() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(0),
            json!("a"),
            json!([1]),
            json!({"k": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                collate(&pair[0], &pair[1], Collation::Unicode),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(
            collate(&json!(2), &json!(10), Collation::Unicode),
            Ordering::Less
        );
        assert_eq!(
            collate(&json!(2.5), &json!(2), Collation::Unicode),
            Ordering::Greater
        );
    }

    #[test]
    fn unicode_strings_fold_case() {
        assert_eq!(
            collate(&json!("apple"), &json!("Banana"), Collation::Unicode),
            Ordering::Less
        );
        // ASCII collation puts uppercase first.
        assert_eq!(
            collate(&json!("apple"), &json!("Banana"), Collation::Ascii),
            Ordering::Greater
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_length() {
        assert_eq!(
            collate(&json!([1, 2]), &json!([1, 3]), Collation::Unicode),
            Ordering::Less
        );
        assert_eq!(
            collate(&json!([1, 2]), &json!([1, 2, 0]), Collation::Unicode),
            Ordering::Less
        );
    }

    #[test]
    fn raw_compares_serialised_text() {
        // "10" < "2" bytewise.
        assert_eq!(
            collate(&json!(10), &json!(2), Collation::Raw),
            Ordering::Less
        );
    }

    #[test]
    fn equal_keys_collate_equal() {
        for v in [json!(null), json!(7), json!("x"), json!([1, "a"])] {
            assert_eq!(collate(&v, &v, Collation::Unicode), Ordering::Equal);
            assert_eq!(collate(&v, &v, Collation::Raw), Ordering::Equal);
        }
    }
}
