// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bluetooth profile bit flags, card-profile identity, and the route
//! enumeration (C8, SPEC_FULL.md §4.5).

/// Profile bit flags a remote device may support, and their unions.
pub mod flags {
    pub const BAP_SINK: u32 = 1 << 0;
    pub const BAP_SOURCE: u32 = 1 << 1;
    pub const A2DP_SINK: u32 = 1 << 2;
    pub const A2DP_SOURCE: u32 = 1 << 3;
    pub const ASHA_SINK: u32 = 1 << 4;
    pub const HSP_HS: u32 = 1 << 5;
    pub const HSP_AG: u32 = 1 << 6;
    pub const HFP_HF: u32 = 1 << 7;
    pub const HFP_AG: u32 = 1 << 8;
    pub const BAP_BROADCAST_SOURCE: u32 = 1 << 9;
    pub const BAP_BROADCAST_SINK: u32 = 1 << 10;

    pub const A2DP_DUPLEX: u32 = A2DP_SINK | A2DP_SOURCE;
    pub const BAP_DUPLEX: u32 = BAP_SINK | BAP_SOURCE;
    pub const HEADSET_HEAD_UNIT: u32 = HSP_HS | HFP_HF;
    pub const HEADSET_AUDIO_GATEWAY: u32 = HSP_AG | HFP_AG;
    pub const HEADSET_AUDIO: u32 = HEADSET_HEAD_UNIT | HEADSET_AUDIO_GATEWAY;
    pub const BAP_AUDIO: u32 = BAP_SINK | BAP_SOURCE | BAP_BROADCAST_SOURCE | BAP_BROADCAST_SINK;
    pub const MEDIA_SINK: u32 = A2DP_SINK | BAP_SINK | BAP_BROADCAST_SINK;
    pub const MEDIA_SOURCE: u32 = A2DP_SOURCE | BAP_SOURCE | BAP_BROADCAST_SOURCE;
}

/// The base category of a card profile, independent of codec choice.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceProfile {
    Off,
    Ag,
    A2dp,
    Bap,
    HspHfp,
}

pub const DEVICE_PROFILE_LAST: u32 = 4;

impl DeviceProfile {
    fn from_index(index: u32) -> Option<Self> {
        Some(match index {
            0 => Self::Off,
            1 => Self::Ag,
            2 => Self::A2dp,
            3 => Self::Bap,
            4 => Self::HspHfp,
            _ => return None,
        })
    }

    fn as_index(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Ag => 1,
            Self::A2dp => 2,
            Self::Bap => 3,
            Self::HspHfp => 4,
        }
    }

    /// Whether this base category admits a codec choice at all (`Off`
    /// and `Ag` are fixed, codec-less profiles).
    pub fn has_codec(self) -> bool {
        matches!(self, Self::A2dp | Self::Bap | Self::HspHfp)
    }
}

/// `(device_profile, codec_id)`, the user-visible identity of a card
/// profile. `codec_id == 0` means "base profile, codec unspecified/any".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CardProfileId {
    pub device_profile: DeviceProfile,
    pub codec_id: u32,
}

impl CardProfileId {
    pub fn base(device_profile: DeviceProfile) -> Self {
        Self { device_profile, codec_id: 0 }
    }

    /// Encodes this identity as the card's enumerable profile index: the
    /// first `LAST+1` indices are the base profiles (one per
    /// `DeviceProfile` variant); indices beyond that encode
    /// `codec_id + LAST` for whichever profile category is currently
    /// selected as the codec-bearing one.
    pub fn to_index(self) -> u32 {
        if self.codec_id == 0 {
            self.device_profile.as_index()
        } else {
            DEVICE_PROFILE_LAST + self.codec_id
        }
    }

    /// Decodes a card profile index back to an identity. Codec indices
    /// (beyond the base range) are ambiguous about *which* base category
    /// they refine, so the caller supplies the currently active one
    /// (e.g. the profile most recently selected via its base index).
    pub fn from_index(index: u32, active_base: DeviceProfile) -> Option<Self> {
        if index <= DEVICE_PROFILE_LAST {
            Some(Self::base(DeviceProfile::from_index(index)?))
        } else {
            Some(Self { device_profile: active_base, codec_id: index - DEVICE_PROFILE_LAST })
        }
    }

    /// The next greater index that names a codec present in
    /// `codec_table` (or a base profile), for UI "next profile" actions.
    pub fn next_valid_index(current: u32, codec_table: &[u32]) -> Option<u32> {
        let candidates = valid_indices(codec_table);
        candidates.iter().copied().find(|&idx| idx > current)
    }

    pub fn prev_valid_index(current: u32, codec_table: &[u32]) -> Option<u32> {
        valid_indices(codec_table).into_iter().rev().find(|&idx| idx < current)
    }
}

fn valid_indices(codec_table: &[u32]) -> Vec<u32> {
    let mut indices: Vec<u32> = (0..=DEVICE_PROFILE_LAST).collect();
    indices.extend(codec_table.iter().map(|&codec_id| DEVICE_PROFILE_LAST + codec_id));
    indices.sort_unstable();
    indices
}

/// The six enumerable ports a Bluetooth card exposes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RouteKind {
    Input,
    Output,
    HfpInput,
    HfpOutput,
    SetInput,
    SetOutput,
}

impl RouteKind {
    pub const ALL: [Self; 6] =
        [Self::Input, Self::Output, Self::HfpInput, Self::HfpOutput, Self::SetInput, Self::SetOutput];

    /// The profile bits that, if connected, make this route meaningful.
    pub fn covering_profiles(self) -> u32 {
        use flags::*;
        match self {
            Self::Input => MEDIA_SOURCE | ASHA_SINK,
            Self::Output => MEDIA_SINK,
            Self::HfpInput => HEADSET_AUDIO,
            Self::HfpOutput => HEADSET_AUDIO,
            Self::SetInput => BAP_SOURCE | BAP_BROADCAST_SOURCE,
            Self::SetOutput => BAP_SINK | BAP_BROADCAST_SINK,
        }
    }

    /// Set-routes only ever appear on a device-set leader.
    pub fn requires_set_leader(self) -> bool {
        matches!(self, Self::SetInput | Self::SetOutput)
    }

    /// A route is reported `available=no` unless the *currently active*
    /// profile actually covers it (not just the device's full
    /// capability set).
    pub fn available_under(self, active_profile_mask: u32) -> bool {
        self.covering_profiles() & active_profile_mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_profile_round_trips_through_index() {
        for base in [DeviceProfile::Off, DeviceProfile::Ag, DeviceProfile::A2dp, DeviceProfile::Bap, DeviceProfile::HspHfp] {
            let id = CardProfileId::base(base);
            let index = id.to_index();
            assert_eq!(CardProfileId::from_index(index, DeviceProfile::Off), Some(id));
        }
    }

    #[test]
    fn codec_profile_round_trips_given_active_base() {
        let id = CardProfileId { device_profile: DeviceProfile::A2dp, codec_id: 3 };
        let index = id.to_index();
        assert_eq!(index, DEVICE_PROFILE_LAST + 3);
        assert_eq!(CardProfileId::from_index(index, DeviceProfile::A2dp), Some(id));
    }

    #[test]
    fn neighbor_indices_walk_codec_table() {
        let codecs = [1, 2, 5];
        let first_codec_index = DEVICE_PROFILE_LAST + 1;
        assert_eq!(CardProfileId::next_valid_index(DEVICE_PROFILE_LAST, &codecs), Some(first_codec_index));
        assert_eq!(CardProfileId::prev_valid_index(first_codec_index, &codecs), Some(DEVICE_PROFILE_LAST));
    }

    #[test]
    fn route_unavailable_when_current_profile_does_not_cover_it() {
        let route = RouteKind::HfpOutput;
        assert!(!route.available_under(flags::A2DP_SINK));
        assert!(route.available_under(flags::HFP_AG));
    }

    #[test]
    fn set_routes_require_leader_flag() {
        assert!(RouteKind::SetInput.requires_set_leader());
        assert!(!RouteKind::Input.requires_set_leader());
    }
}
