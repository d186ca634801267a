use crate::TrackId;

/// Display colour of untracked boxes.
pub const UNTRACKED_COLOR: [u8; 3] = [200, 200, 200];

/// Stable RGB colour for a track. Every channel falls in 100..=255 so boxes
/// stay readable on dark footage.
pub fn track_color(track: TrackId) -> [u8; 3] {
    if track <= 0 {
        return UNTRACKED_COLOR;
    }
    let mut state = track as u64;
    let mut channel = || {
        // splitmix64
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        100 + (z % 156) as u8
    };
    [channel(), channel(), channel()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colours_are_stable_and_bright() {
        for track in 1..200 {
            let c = track_color(track);
            assert_eq!(c, track_color(track));
            assert!(c.iter().all(|v| *v >= 100));
        }
        assert_ne!(track_color(1), track_color(2));
        assert_eq!(track_color(0), UNTRACKED_COLOR);
    }
}
