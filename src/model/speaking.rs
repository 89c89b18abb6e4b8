use bitflags::bitflags;

bitflags! {
    /// Flags describing why a connection is transmitting audio.
    ///
    /// The wire representation is the bitwise OR of the active flags; an
    /// absent or empty set reduces to `0`.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SpeakingMode: u32 {
        /// Normal transmission of voice audio.
        const MICROPHONE = 1;
        /// Transmission of context audio for video, no speaking indicator.
        const SOUNDSHARE = 1 << 1;
        /// Priority speaker, lowering the volume of other speakers.
        const PRIORITY = 1 << 2;
    }
}

impl SpeakingMode {
    /// Reduces an optional flag set to its wire mask.
    pub fn to_mask(mode: Option<SpeakingMode>) -> u32 {
        mode.unwrap_or_else(SpeakingMode::empty).bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_bitwise_or_of_members() {
        assert_eq!(SpeakingMode::to_mask(None), 0);
        assert_eq!(SpeakingMode::to_mask(Some(SpeakingMode::empty())), 0);
        assert_eq!(SpeakingMode::to_mask(Some(SpeakingMode::MICROPHONE)), 1);
        assert_eq!(
            SpeakingMode::to_mask(Some(SpeakingMode::MICROPHONE | SpeakingMode::PRIORITY)),
            5
        );
        assert_eq!(SpeakingMode::to_mask(Some(SpeakingMode::all())), 7);
    }
}
