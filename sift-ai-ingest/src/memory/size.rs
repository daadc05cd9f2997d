//! Approximate in-memory size of batch items.
//!
//! Estimates only need to be good enough to rank items against each other and against a
//! byte budget. Text is counted at two bytes per byte of UTF-8, which approximates the
//! wide-string representations most ingestion sources hand us.

use half::f16;
use serde_json::Value;

/// Estimate used when an item cannot be measured.
pub const FALLBACK_ITEM_BYTES: usize = 1024;

/// Approximate number of bytes an item occupies while it is being processed.
pub trait EstimateSize {
    fn estimated_bytes(&self) -> usize;
}

impl EstimateSize for str {
    fn estimated_bytes(&self) -> usize {
        self.len() * 2
    }
}

impl EstimateSize for String {
    fn estimated_bytes(&self) -> usize {
        self.as_str().estimated_bytes()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for &T {
    fn estimated_bytes(&self) -> usize {
        (**self).estimated_bytes()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn estimated_bytes(&self) -> usize {
        (**self).estimated_bytes()
    }
}

impl<T: EstimateSize> EstimateSize for [T] {
    fn estimated_bytes(&self) -> usize {
        self.iter().map(EstimateSize::estimated_bytes).sum()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_bytes(&self) -> usize {
        self.as_slice().estimated_bytes()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_bytes(&self) -> usize {
        self.as_ref().map_or(0, EstimateSize::estimated_bytes)
    }
}

macro_rules! fixed_size {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EstimateSize for $ty {
                fn estimated_bytes(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

fixed_size!(
    bool, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, f16,
);

impl EstimateSize for Value {
    fn estimated_bytes(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 4,
            Value::Number(_) => 8,
            Value::String(s) => s.estimated_bytes(),
            Value::Array(values) if is_numeric_vector(values) => values.len() * 8,
            Value::Object(map) => {
                if let Some(Value::Array(chunks)) = map.get("chunks") {
                    return chunks.iter().map(EstimateSize::estimated_bytes).sum();
                }
                let text = ["text", "content"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str));
                match text {
                    Some(text) => {
                        let extra = map.get("metadata").map_or(0, json_bytes);
                        text.estimated_bytes() + extra
                    }
                    None => json_bytes(self),
                }
            }
            Value::Array(_) => json_bytes(self),
        }
    }
}

fn is_numeric_vector(values: &[Value]) -> bool {
    !values.is_empty() && values.iter().all(Value::is_number)
}

fn json_bytes(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|s| s.len() * 2)
        .unwrap_or(FALLBACK_ITEM_BYTES)
}

/// Indices of up to `samples` items spread evenly across a collection of `len` items.
pub fn sample_indices(len: usize, samples: usize) -> impl Iterator<Item = usize> {
    let count = samples.min(len);
    (0..count).map(move |i| i * len / count)
}

/// Average estimated size of up to `samples` evenly spaced items; `None` when empty.
pub fn sampled_average_bytes<T: EstimateSize>(items: &[T], samples: usize) -> Option<usize> {
    if items.is_empty() || samples == 0 {
        return None;
    }
    let (total, count) = sample_indices(items.len(), samples)
        .map(|i| items[i].estimated_bytes())
        .fold((0usize, 0usize), |(total, count), bytes| (total + bytes, count + 1));
    Some(total / count.max(1))
}
