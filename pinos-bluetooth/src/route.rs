// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Route enumeration, volume ownership, and profile-switch orchestration
//! (SPEC_FULL.md §4.5).

use std::collections::HashMap;

use pinos_wire::volume::{hw_to_linear, linear_to_hw};

use crate::codec_switch::{Action as CodecAction, CodecSwitch};
use crate::device::{BtDevice, DeviceRegistry};
use crate::error::Error;
use crate::profile::{CardProfileId, DeviceProfile, RouteKind};

/// One enumerated route on a card, as reported to the session manager.
#[derive(Clone, Debug)]
pub struct Route {
    pub kind: RouteKind,
    pub available: bool,
    pub devices: Vec<String>,
}

pub struct RouteTable;

impl RouteTable {
    /// Enumerates all six routes against every device the registry
    /// knows about, matching `original_source/spa/plugins/bluez5`'s
    /// device-enumerated-route behavior: a route is available if *any*
    /// device exposes it.
    pub fn enumerate(registry: &DeviceRegistry) -> Vec<Route> {
        RouteKind::ALL
            .into_iter()
            .map(|kind| {
                let devices: Vec<String> =
                    registry.iter().filter(|d| d.route_available(kind)).map(|d| d.address.clone()).collect();
                Route { available: !devices.is_empty(), devices, kind }
            })
            .collect()
    }
}

/// Volume ownership split (§4.5): the hardware side reports its own
/// 0..=hw_volume_max range; the session manager deals exclusively in
/// the linear [0.0, 1.0] domain. This struct is the one seam where the
/// two are reconciled.
#[derive(Clone, Copy, Debug, Default)]
pub struct RouteVolume {
    pub hw_volume: u32,
    pub hw_volume_max: u32,
}

impl RouteVolume {
    pub fn linear(&self) -> f64 {
        hw_to_linear(self.hw_volume, self.hw_volume_max)
    }

    /// Sets the hardware volume from a linear value coming from the
    /// session manager; returns the quantized hardware value actually
    /// applied, since the hardware's integer range is coarser than the
    /// linear domain.
    pub fn set_linear(&mut self, linear: f64) -> u32 {
        self.hw_volume = linear_to_hw(linear, self.hw_volume_max);
        self.hw_volume
    }
}

/// What the caller must do next in response to a [`ProfileStore`]
/// step, per §4.5's 5-step profile switch.
#[derive(Debug, PartialEq)]
pub enum ProfileSwitchAction {
    /// Step 2: emit `remove` for every current RT node and release
    /// every transport (refcount to 0, close fds) on this device, then
    /// call [`ProfileStore::continue_after_teardown`].
    TearDown { address: String },
    /// Step 3: issue `SetConfiguration` for this codec; feed the
    /// D-Bus reply back through [`ProfileStore::on_codec_reply`].
    RequestCodec { address: String, codec_id: u32 },
    /// Step 4: re-enumerate transports, emit `object_info` for the new
    /// RT nodes, restore cached volumes, emit param-info changes.
    Switched { address: String, profile: CardProfileId },
    /// Step 5's fallbacks were exhausted; the device is parked at `Off`.
    Failed { address: String },
}

/// Which fallback (§4.5 step 5) a retry is attempting, tracked so a
/// second failure knows to fall through to `Off` rather than loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FallbackStage {
    None,
    SameProfileCodec0,
    Off,
}

struct PendingSwitch {
    target: CardProfileId,
    save: bool,
    fallback: FallbackStage,
    codec_switch: Option<CodecSwitch>,
}

/// Remembers the last profile explicitly selected per device, for
/// devices whose switch was requested with `save = true` (in-memory
/// half of profile persistence), and drives the in-flight profile
/// switch state machine of §4.5.
#[derive(Default)]
pub struct ProfileStore {
    saved: HashMap<String, CardProfileId>,
    in_progress: HashMap<String, PendingSwitch>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_for(&self, address: &str) -> Option<CardProfileId> {
        self.saved.get(address).copied()
    }

    /// Step 1 (validate) of a `set_profile(index, save)` request;
    /// `index` decodes relative to the device's currently active base
    /// profile (§4.5's bijective index scheme). Returns the
    /// [`ProfileSwitchAction::TearDown`] the caller must perform before
    /// calling [`Self::continue_after_teardown`].
    pub fn set_profile(&mut self, device: &mut BtDevice, index: u32, save: bool) -> Result<ProfileSwitchAction, Error> {
        if device.switching_codec {
            return Err(Error::NotAvailable(format!("profile switch already in progress on {}", device.address)));
        }
        let target = CardProfileId::from_index(index, device.active_profile)
            .ok_or_else(|| Error::NotAvailable(format!("no profile at index {index}")))?;
        if !device.supports_active_profile(target.device_profile) {
            return Err(Error::NotAvailable(format!("profile not connected on {}", device.address)));
        }
        device.switching_codec = true;
        self.in_progress
            .insert(device.address.clone(), PendingSwitch { target, save, fallback: FallbackStage::None, codec_switch: None });
        Ok(ProfileSwitchAction::TearDown { address: device.address.clone() })
    }

    /// Step 2 is complete (RT nodes removed, transports released);
    /// proceeds to step 3, the codec-switch coroutine.
    pub fn continue_after_teardown(&mut self, device: &mut BtDevice) -> Result<ProfileSwitchAction, Error> {
        let pending = self
            .in_progress
            .get(&device.address)
            .ok_or_else(|| Error::NotAvailable(format!("no profile switch pending on {}", device.address)))?;
        let (target, save, fallback) = (pending.target, pending.save, pending.fallback);
        Ok(self.start_codec_switch(device, target, save, fallback))
    }

    /// Feeds back a `SetConfiguration` D-Bus reply for the codec most
    /// recently requested for `device`.
    pub fn on_codec_reply(&mut self, device: &mut BtDevice, errno: i32) -> Result<ProfileSwitchAction, Error> {
        let pending = self
            .in_progress
            .get_mut(&device.address)
            .ok_or_else(|| Error::NotAvailable(format!("no profile switch pending on {}", device.address)))?;
        let cs = pending
            .codec_switch
            .as_mut()
            .ok_or_else(|| Error::NotAvailable(format!("no codec switch in flight on {}", device.address)))?;
        Ok(match cs.on_reply(errno) {
            CodecAction::RequestCodec(codec_id) => ProfileSwitchAction::RequestCodec { address: device.address.clone(), codec_id },
            CodecAction::Finished(Ok(_)) => self.finish_switch(device, true),
            CodecAction::Finished(Err(_)) => self.finish_switch(device, false),
        })
    }

    /// `Off` and codec-less base profiles (`Ag`) skip negotiation
    /// entirely and succeed immediately; profiles with a codec id kick
    /// off a single-candidate [`CodecSwitch`] (§4.6).
    fn start_codec_switch(&mut self, device: &mut BtDevice, target: CardProfileId, save: bool, fallback: FallbackStage) -> ProfileSwitchAction {
        if !target.device_profile.has_codec() || target.codec_id == 0 {
            self.in_progress.insert(device.address.clone(), PendingSwitch { target, save, fallback, codec_switch: None });
            return self.finish_switch(device, true);
        }
        let mut cs = CodecSwitch::new(device.address.clone(), vec![target.codec_id]);
        let first = cs.poll();
        self.in_progress.insert(device.address.clone(), PendingSwitch { target, save, fallback, codec_switch: Some(cs) });
        match first {
            CodecAction::RequestCodec(codec_id) => ProfileSwitchAction::RequestCodec { address: device.address.clone(), codec_id },
            CodecAction::Finished(_) => unreachable!("a single-candidate switch always requests that candidate first"),
        }
    }

    /// Steps 4/5: applies the result, or walks the fallback ladder
    /// (same profile at codec 0, then `Off`) on failure.
    fn finish_switch(&mut self, device: &mut BtDevice, ok: bool) -> ProfileSwitchAction {
        let Some(pending) = self.in_progress.remove(&device.address) else {
            device.switching_codec = false;
            return ProfileSwitchAction::Failed { address: device.address.clone() };
        };
        // Re-check connectivity here too: the device may have
        // disconnected the target profile while negotiation was in
        // flight, in which case this "success" must still fall back.
        if ok && device.set_active_profile(pending.target).is_ok() {
            device.switching_codec = false;
            if pending.save {
                self.saved.insert(device.address.clone(), pending.target);
            }
            return ProfileSwitchAction::Switched { address: device.address.clone(), profile: pending.target };
        }
        match pending.fallback {
            FallbackStage::None if pending.target.codec_id != 0 => {
                let fallback_target = CardProfileId { device_profile: pending.target.device_profile, codec_id: 0 };
                self.start_codec_switch(device, fallback_target, false, FallbackStage::SameProfileCodec0)
            }
            FallbackStage::Off => {
                device.switching_codec = false;
                device.active_profile = DeviceProfile::Off;
                device.active_codec_id = 0;
                ProfileSwitchAction::Failed { address: device.address.clone() }
            }
            _ => self.start_codec_switch(device, CardProfileId::base(DeviceProfile::Off), false, FallbackStage::Off),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::flags;

    #[test]
    fn route_table_lists_available_and_empty_devices() {
        let mut registry = DeviceRegistry::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);
        registry.upsert(dev);

        let routes = RouteTable::enumerate(&registry);
        let output = routes.iter().find(|r| r.kind == RouteKind::Output).unwrap();
        assert!(output.available);
        assert_eq!(output.devices, vec!["AA:BB".to_string()]);

        let hfp = routes.iter().find(|r| r.kind == RouteKind::HfpOutput).unwrap();
        assert!(!hfp.available);
    }

    #[test]
    fn volume_round_trips_through_hw_domain() {
        let mut v = RouteVolume { hw_volume: 0, hw_volume_max: 127 };
        let applied = v.set_linear(0.5);
        assert_eq!(applied, v.hw_volume);
        assert!((v.linear() - 0.5).abs() < 0.05);
    }

    fn switch_to_base_profile(store: &mut ProfileStore, dev: &mut BtDevice, profile: DeviceProfile, save: bool) -> ProfileSwitchAction {
        let index = CardProfileId::base(profile).to_index();
        let action = store.set_profile(dev, index, save).unwrap();
        assert_eq!(action, ProfileSwitchAction::TearDown { address: dev.address.clone() });
        store.continue_after_teardown(dev).unwrap()
    }

    #[test]
    fn profile_store_remembers_only_when_saved() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);

        // A codec-less (base, `codec_id == 0`) switch finishes without
        // any D-Bus round trip.
        let action = switch_to_base_profile(&mut store, &mut dev, DeviceProfile::A2dp, false);
        assert!(matches!(action, ProfileSwitchAction::Switched { .. }));
        assert!(store.saved_for("AA:BB").is_none());
        assert!(!dev.switching_codec);

        switch_to_base_profile(&mut store, &mut dev, DeviceProfile::A2dp, true);
        assert!(store.saved_for("AA:BB").is_some());
    }

    #[test]
    fn unconnected_profile_is_rejected_before_any_teardown() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::HEADSET_HEAD_UNIT);
        let index = CardProfileId::base(DeviceProfile::A2dp).to_index();
        assert!(store.set_profile(&mut dev, index, false).is_err());
        assert!(!dev.switching_codec);
    }

    #[test]
    fn codec_negotiation_round_trips_through_request_and_reply() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);

        let target = CardProfileId { device_profile: DeviceProfile::A2dp, codec_id: 2 };
        let action = store.set_profile(&mut dev, target.to_index(), false).unwrap();
        assert_eq!(action, ProfileSwitchAction::TearDown { address: "AA:BB".into() });
        assert!(dev.switching_codec);

        let action = store.continue_after_teardown(&mut dev).unwrap();
        assert_eq!(action, ProfileSwitchAction::RequestCodec { address: "AA:BB".into(), codec_id: 2 });

        let action = store.on_codec_reply(&mut dev, 0).unwrap();
        assert_eq!(action, ProfileSwitchAction::Switched { address: "AA:BB".into(), profile: target });
        assert!(!dev.switching_codec);
        assert_eq!(dev.current_card_profile(), target);
    }

    #[test]
    fn failed_codec_negotiation_falls_back_to_same_profile_then_off() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);

        let target = CardProfileId { device_profile: DeviceProfile::A2dp, codec_id: 2 };
        store.set_profile(&mut dev, target.to_index(), false).unwrap();
        store.continue_after_teardown(&mut dev).unwrap();

        // First refusal: falls back to the same profile at codec 0,
        // which needs no further negotiation and succeeds immediately.
        let action = store.on_codec_reply(&mut dev, -(libc::EINVAL)).unwrap();
        assert_eq!(
            action,
            ProfileSwitchAction::Switched { address: "AA:BB".into(), profile: CardProfileId::base(DeviceProfile::A2dp) }
        );
        assert!(!dev.switching_codec);
    }

    #[test]
    fn profile_disconnected_mid_switch_falls_all_the_way_to_off() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);

        let target = CardProfileId { device_profile: DeviceProfile::A2dp, codec_id: 2 };
        store.set_profile(&mut dev, target.to_index(), false).unwrap();
        store.continue_after_teardown(&mut dev).unwrap();

        // The peer drops the profile entirely while the codec reply is
        // in flight, so neither the requested codec nor the same
        // profile's codec=0 fallback can actually apply — only `Off`
        // (which needs no connected profile bit) can.
        dev.set_profile_connected(flags::A2DP_SINK, false);
        let action = store.on_codec_reply(&mut dev, 0).unwrap();
        assert_eq!(action, ProfileSwitchAction::Switched { address: "AA:BB".into(), profile: CardProfileId::base(DeviceProfile::Off) });
        assert_eq!(dev.active_profile, DeviceProfile::Off);
        assert!(!dev.switching_codec);
    }

    #[test]
    fn a_switch_already_in_progress_defers_further_requests() {
        let mut store = ProfileStore::new();
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);

        let target = CardProfileId { device_profile: DeviceProfile::A2dp, codec_id: 2 };
        store.set_profile(&mut dev, target.to_index(), false).unwrap();
        assert!(store.set_profile(&mut dev, target.to_index(), false).is_err());
    }
}
