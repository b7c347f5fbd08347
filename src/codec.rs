// Intensity codec shared by the render path and the edit path. A weight of -1.0 maps to black, 0.0
// to mid grey and 1.0 to (almost) white. Both directions are pure and the same weight always lands
// on the same byte.

/// Multiplier between one unit of weight and one step of the grey ramp.
pub const SCALE: f32 = 127.0;

/// How many colour steps one unit of change moves the diff ramp.
pub const DIFF_GAIN: i32 = 8;

/// The smallest weight difference the codec can distinguish.
pub const STEP: f32 = 1.0 / SCALE;

// floor(127 * (w + 1)), saturated into the byte range. Anything outside roughly [-1, 1] clips to
// black or white rather than wrapping around.
pub fn encode(weight: f32) -> u8 {
    let value = (SCALE * (weight + 1.0)).floor();
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 255.0) as u8
}

// Inverse of encode. Because encode truncates, decode(encode(w)) can sit up to one STEP below w.
pub fn decode(byte: u8) -> f32 {
    byte as f32 / SCALE - 1.0
}

// Map a signed change in grey level onto a two-tone ramp: negative changes fade from white towards
// blue, positive changes fade from white towards red. Channels saturate at the byte range.
pub fn diff_ramp(delta: i32) -> [u8; 4] {
    let shift = (DIFF_GAIN * delta.abs()).min(255);
    let faded = (255 - shift) as u8;
    if delta < 0 {
        [faded, faded, 255, 255]
    } else {
        [255, faded, faded, 255]
    }
}
