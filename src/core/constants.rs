//! Physical constants and radio parameters

/// Speed of light in air (m/s)
pub const SPEED_OF_LIGHT_AIR: f64 = 299_702_547.0;

/// Radio counter ticks per microsecond (128 × 499.2 MHz)
pub const RADIO_UNITS_PER_MICROSECOND: f64 = 63_897.6;

/// Metres travelled by a radio signal during one counter tick
pub const DISTANCE_PER_RADIO_UNIT_M: f64 =
    SPEED_OF_LIGHT_AIR / (RADIO_UNITS_PER_MICROSECOND * 1_000_000.0);

/// Width of the radio counter in bits
pub const RADIO_TIMESTAMP_BITS: u32 = 40;

/// Bit flagging an address as a tag's
pub const TAG_ADDRESS_FLAG: u16 = 1 << 15;

/// Radio counter ticks per millisecond
pub const RADIO_UNITS_PER_MILLISECOND: u64 = 63_897_600;

/// Intervals at or above this many ticks are read as negative
pub const RADIO_HALF_RANGE: u64 = 1 << (RADIO_TIMESTAMP_BITS - 1);
