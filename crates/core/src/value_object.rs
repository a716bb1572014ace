//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attributes. A message
/// payload is one: two payloads with the same subject, body and format are the
/// same payload, and a batch unit carries its own copy rather than a reference.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
