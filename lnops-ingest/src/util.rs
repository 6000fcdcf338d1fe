use time::OffsetDateTime;

/// Render a packed 64-bit short channel id as `block x tx x output`.
pub fn convert_lnd_short_channel_id(id: u64) -> String {
    let block_height = id >> 40;
    let tx_index = (id >> 16) & 0xFF_FFFF;
    let output_index = id & 0xFFFF;
    format!("{}x{}x{}", block_height, tx_index, output_index)
}

/// Nanoseconds since the epoch, rounded half up to the microsecond.
pub fn time_from_nanos(ns: u64) -> OffsetDateTime {
    let micros = (ns as i128 + 500) / 1000;
    OffsetDateTime::from_unix_timestamp_nanos(micros * 1000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn time_from_secs(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Saturating conversion for values persisted as signed 64-bit integers.
pub fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
