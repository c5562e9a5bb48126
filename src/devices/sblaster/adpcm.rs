//! Creative ADPCM decoders (2, 2.6 and 4 bit).
//!
//! The scale/adjust tables come from the SB firmware behaviour; the
//! reference byte variant seeds the predictor with the first DMA byte
//! and resets the step size.

#[derive(Debug, Default, Clone, Copy)]
pub struct AdpcmState {
    pub reference: u8,
    pub step_size: i32,
    pub have_reference: bool,
}

impl AdpcmState {
    fn advance(&mut self, samp: i32, scale: &[i8], adjust: &[u8]) -> u8 {
        let samp = samp.clamp(0, scale.len() as i32 - 1) as usize;
        let reference = self.reference as i32 + scale[samp] as i32;
        self.reference = reference.clamp(0, 0xFF) as u8;
        self.step_size = (self.step_size + adjust[samp] as i8 as i32) & 0xFF;
        self.reference
    }

    pub fn decode_2(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 24] = [
            0, 1, 0, -1, 1, 3, -1, -3, //
            2, 6, -2, -6, 4, 12, -4, -12, //
            8, 24, -8, -24, 16, 48, -16, -48,
        ];
        const ADJUST: [u8; 24] = [
            0, 4, 0, 4, //
            252, 4, 252, 4, 252, 4, 252, 4, //
            252, 4, 252, 4, 252, 4, 252, 4, //
            252, 0, 252, 0,
        ];
        self.advance(sample as i32 + self.step_size, &SCALE, &ADJUST)
    }

    pub fn decode_3(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 40] = [
            0, 1, 2, 3, 0, -1, -2, -3, //
            1, 3, 5, 7, -1, -3, -5, -7, //
            2, 6, 10, 14, -2, -6, -10, -14, //
            4, 12, 20, 28, -4, -12, -20, -28, //
            5, 15, 25, 35, -5, -15, -25, -35,
        ];
        const ADJUST: [u8; 40] = [
            0, 0, 0, 8, 0, 0, 0, 8, //
            248, 0, 0, 8, 248, 0, 0, 8, //
            248, 0, 0, 8, 248, 0, 0, 8, //
            248, 0, 0, 8, 248, 0, 0, 8, //
            248, 0, 0, 0, 248, 0, 0, 0,
        ];
        self.advance(sample as i32 + self.step_size, &SCALE, &ADJUST)
    }

    pub fn decode_4(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 64] = [
            0, 1, 2, 3, 4, 5, 6, 7, 0, -1, -2, -3, -4, -5, -6, -7, //
            1, 3, 5, 7, 9, 11, 13, 15, -1, -3, -5, -7, -9, -11, -13, -15, //
            2, 6, 10, 14, 18, 22, 26, 30, -2, -6, -10, -14, -18, -22, -26, -30, //
            4, 12, 20, 28, 36, 44, 52, 60, -4, -12, -20, -28, -36, -44, -52, -60,
        ];
        const ADJUST: [u8; 64] = [
            0, 0, 0, 0, 0, 16, 16, 16, //
            0, 0, 0, 0, 0, 16, 16, 16, //
            240, 0, 0, 0, 0, 16, 16, 16, //
            240, 0, 0, 0, 0, 16, 16, 16, //
            240, 0, 0, 0, 0, 16, 16, 16, //
            240, 0, 0, 0, 0, 16, 16, 16, //
            240, 0, 0, 0, 0, 0, 0, 0, //
            240, 0, 0, 0, 0, 0, 0, 0,
        ];
        self.advance(sample as i32 + self.step_size, &SCALE, &ADJUST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_tracks_reference() {
        let mut st = AdpcmState {
            reference: 0x80,
            ..AdpcmState::default()
        };
        // positive nibbles push the predictor up
        let a = st.decode_4(0x05);
        assert!(a > 0x80);
        // step size adapted upwards for large codes
        assert!(st.step_size > 0);
    }

    #[test]
    fn decoder_saturates_at_bounds() {
        let mut st = AdpcmState {
            reference: 0xFE,
            ..AdpcmState::default()
        };
        for _ in 0..10 {
            st.decode_2(1); // +1 steps
        }
        assert_eq!(st.reference, 0xFF);
        let mut st = AdpcmState::default();
        for _ in 0..10 {
            st.decode_2(3); // -1 steps
        }
        assert_eq!(st.reference, 0x00);
    }
}
