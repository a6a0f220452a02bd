use serde::{Deserialize, Deserializer, Serializer};

/// Largest integer an f64 holds without losing precision.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Writes whole floats as JSON integers, so a document read with `10` is written back
/// with `10` instead of `10.0`.
pub fn whole_number<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.is_finite() && value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Reads an explicit `null` as `Some(None)`. Paired with `#[serde(default)]` so an absent
/// field stays `None` and a field can be cleared on purpose.
pub fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
