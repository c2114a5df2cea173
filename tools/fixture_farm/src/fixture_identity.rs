use crate::model::RecordKey;

/// Exclusive upper bound of keys produced by [`identify`].
pub const MAX_FIXTURE_KEY: i64 = (1 << 30) - 1;

/// Deterministic primary key for the fixture labelled `label`: the zlib CRC32
/// of the label, reduced below [`MAX_FIXTURE_KEY`]. Matches the keys a Rails
/// fixture loader assigns, so records seeded from these files map back to
/// their labels.
pub fn identify(label: &str) -> RecordKey {
    i64::from(crc32fast::hash(label.as_bytes())) % MAX_FIXTURE_KEY
}
