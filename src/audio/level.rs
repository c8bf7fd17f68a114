//! Conversion from full-scale decibels to the caller-facing sound level

/// Lowest value reported by the metering API (silence)
pub const METER_FLOOR_DB: f32 = -160.0;

/// Offset that maps 0 dBFS to the top of the level band
pub const LEVEL_OFFSET_DB: f32 = 90.0;

/// Highest sound level a reading can carry
pub const MAX_LEVEL: i32 = 90;

/// Converts a raw dBFS reading into an integer sound level in `0..=90`.
///
/// NaN and negative infinity are treated as silence.
pub fn sound_level(raw_db: f32) -> i32 {
    let db = if raw_db.is_nan() {
        METER_FLOOR_DB
    } else {
        raw_db.clamp(METER_FLOOR_DB, 0.0)
    };

    ((db + LEVEL_OFFSET_DB).round() as i32).clamp(0, MAX_LEVEL)
}

/// Converts a linear peak amplitude (0.0 ..= 1.0) into dBFS
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 || amplitude.is_nan() {
        return METER_FLOOR_DB;
    }
    (20.0 * amplitude.log10()).max(METER_FLOOR_DB)
}
