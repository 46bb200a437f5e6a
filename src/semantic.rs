//! Semantic equality for API objects.
//!
//! Two values are equal when their JSON forms match after dropping nulls,
//! empty arrays and empty objects. Map key order never matters; array order
//! does. Resource quantities compare by amount, so `0.5` equals `500m`.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use serde_json::Value;

/// Maps whose values are all quantities.
const QUANTITY_MAPS: [&str; 3] = ["limits", "requests", "overhead"];
/// Fields holding a single quantity.
const QUANTITY_FIELDS: [&str; 1] = ["sizeLimit"];

const BINARY_SUFFIXES: [(&str, u32); 6] =
    [("Ki", 10), ("Mi", 20), ("Gi", 30), ("Ti", 40), ("Pi", 50), ("Ei", 60)];
const DECIMAL_SUFFIXES: [(&str, i32); 10] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
    ("", 0),
];

/// The amount of a quantity string in units of 10^-9, rounded up the way the
/// API server rounds. None if it does not parse or does not fit.
pub fn quantity_nanos(quantity: &str) -> Option<i128> {
    let quantity = quantity.trim();
    let number_len = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(number_len);

    let (negative, number) = match number.as_bytes().first() {
        Some(&b'-') => (true, &number[1..]),
        Some(&b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (mut exp10, exp2) = if let Some((_, bits)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        (0, *bits)
    } else if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        (*exp, 0)
    } else if let Some(exp) = suffix.strip_prefix(|c: char| c == 'e' || c == 'E') {
        (exp.parse::<i32>().ok()?, 0)
    } else {
        return None;
    };
    exp10 += 9 - i32::try_from(fraction.len()).ok()?;

    let digits = format!("{}{}", whole, fraction);
    let digits = digits.trim_start_matches('0');
    let mut amount: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    amount = amount.checked_mul(1i128.checked_shl(exp2)?)?;
    if exp10 >= 0 {
        amount = amount.checked_mul(10i128.checked_pow(u32::try_from(exp10).ok()?)?)?;
    } else {
        let divisor = 10i128.checked_pow(u32::try_from(-exp10).ok()?)?;
        amount = (amount + divisor - 1) / divisor;
    }
    Some(if negative { -amount } else { amount })
}

fn canonical_quantity(value: Value) -> Value {
    match value {
        Value::String(q) => match quantity_nanos(&q) {
            Some(nanos) => Value::String(format!("{}n", nanos)),
            None => Value::String(q),
        },
        other => other,
    }
}

fn canonical_field(key: &str, value: Value) -> Value {
    if QUANTITY_FIELDS.contains(&key) {
        return canonical_quantity(value);
    }
    match value {
        Value::Object(map) if QUANTITY_MAPS.contains(&key) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, canonical_quantity(v)))
                .collect(),
        ),
        other => other,
    }
}

fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let items: Vec<Value> = items
                .into_iter()
                .map(|v| prune(v).unwrap_or(Value::Null))
                .collect();
            if items.is_empty() {
                None
            } else {
                Some(Value::Array(items))
            }
        }
        Value::Object(map) => {
            let map: serde_json::Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    let v = canonical_field(&k, v);
                    prune(v).map(|v| (k, v))
                })
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other),
    }
}

fn normalized<T: Serialize + ?Sized>(value: &T) -> Option<Value> {
    // Only maps with non-string keys fail to serialize.
    let value = serde_json::to_value(value).ok()?;
    if std::any::type_name::<T>() == std::any::type_name::<Quantity>() {
        return prune(canonical_quantity(value));
    }
    prune(value)
}

/// Whether `a` and `b` are the same object once defaulting noise is ignored.
pub fn semantic_eq<T: Serialize + ?Sized>(a: &T, b: &T) -> bool {
    normalized(a) == normalized(b)
}
