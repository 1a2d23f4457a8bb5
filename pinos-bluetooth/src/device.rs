// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Bluetooth device model (C8, SPEC_FULL.md §3/§4.5): a device's
//! connected/supported profiles, its active transport, and — for BAP —
//! the device-set it belongs to.

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::error::Error;
use crate::profile::{CardProfileId, DeviceProfile, RouteKind};

/// Channel-position ids, matching `SPA_AUDIO_CHANNEL_*` in
/// `original_source/spa/plugins/bluez5/bluez5-device.c`.
pub const SPA_AUDIO_CHANNEL_MONO: u32 = 0;
pub const SPA_AUDIO_CHANNEL_FL: u32 = 1;
pub const SPA_AUDIO_CHANNEL_FR: u32 = 2;

/// A transport's life cycle, mirroring BlueZ's `MediaTransport1.State`
/// property plus a local `Error` state for a twice-failed acquire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Pending,
    Active,
    Error,
}

/// A live SCO/A2DP/BAP media transport acquired from BlueZ for one
/// device's currently active profile. `fd` is only `Some` while
/// `acquire_refcount > 0`; releasing drops it to `None` and closes it.
#[derive(Clone, Debug)]
pub struct BtTransport {
    pub path: String,
    pub device: String,
    pub profile: u32,
    pub codec_id: u32,
    pub state: TransportState,
    pub configuration: Vec<u8>,
    pub fd: Option<RawFd>,
    pub read_mtu: u16,
    pub write_mtu: u16,
    pub delay_us: u32,
    pub acquire_refcount: u32,
    pub keepalive: bool,
    pub n_channels: u8,
    /// Channel-position codes (`SPA_AUDIO_CHANNEL_*`-style ids), one per
    /// `n_channels`; `volumes` below is the corresponding per-channel
    /// hardware volume, not a channel map, so the two are kept separate.
    pub channels: Vec<u32>,
    pub volumes: Vec<u16>,
}

impl BtTransport {
    pub fn new(path: impl Into<String>, device: impl Into<String>, profile: u32, codec_id: u32) -> Self {
        Self {
            path: path.into(),
            device: device.into(),
            profile,
            codec_id,
            state: TransportState::Idle,
            configuration: Vec::new(),
            fd: None,
            read_mtu: 0,
            write_mtu: 0,
            delay_us: 0,
            acquire_refcount: 0,
            keepalive: false,
            n_channels: 0,
            channels: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Sets the channel map and sizes `volumes` to match, per BlueZ's
    /// `MediaTransport1.Channels` property on attach.
    pub fn set_channels(&mut self, channels: Vec<u32>) {
        self.n_channels = channels.len() as u8;
        self.volumes = vec![0; channels.len()];
        self.channels = channels;
    }

    /// Step 2 of §4.5's profile switch and BlueZ's own `Acquire()`
    /// contract: the fd is only handed out on the 0→1 transition.
    pub fn acquire(&mut self, fd: RawFd) {
        self.acquire_refcount += 1;
        if self.acquire_refcount == 1 {
            self.fd = Some(fd);
            self.state = TransportState::Active;
        }
    }

    /// Releases one reference; on the last release (refcount hits 0)
    /// the fd is closed and the transport returns to `Idle`. Returns
    /// the fd to close, if this was the last reference.
    pub fn release(&mut self) -> Option<RawFd> {
        if self.acquire_refcount == 0 {
            return None;
        }
        self.acquire_refcount -= 1;
        if self.acquire_refcount == 0 {
            self.state = TransportState::Idle;
            return self.fd.take();
        }
        None
    }

    pub fn is_acquired(&self) -> bool {
        self.acquire_refcount > 0
    }
}

/// This device's membership in a BAP device-set, if any. A set has
/// exactly one leader, which owns the aggregate stream parameters; the
/// other members mirror its profile/volume decisions.
#[derive(Clone, Debug)]
pub struct SetMember {
    pub set_id: String,
    pub is_leader: bool,
    pub peers: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct BtDevice {
    pub address: String,
    pub name: Option<String>,
    pub profiles_supported: u32,
    pub profiles_connected: u32,
    pub active_profile: DeviceProfile,
    pub active_codec_id: u32,
    pub battery_percent: Option<u8>,
    pub transport: Option<BtTransport>,
    pub set: Option<SetMember>,
    pub hw_volume: u32,
    pub hw_volume_max: u32,
    /// Set for the duration of a profile switch's codec-negotiation
    /// step (§4.5 step 3); further `set_profile` requests are refused
    /// while this is true.
    pub switching_codec: bool,
}

impl BtDevice {
    pub fn new(address: impl Into<String>, profiles_supported: u32) -> Self {
        Self {
            address: address.into(),
            name: None,
            profiles_supported,
            profiles_connected: 0,
            active_profile: DeviceProfile::Off,
            active_codec_id: 0,
            battery_percent: None,
            transport: None,
            set: None,
            hw_volume: 0,
            hw_volume_max: 0,
            switching_codec: false,
        }
    }

    /// Step 1 of §4.5's profile switch: whether at least one connected
    /// profile covers `device_profile` (`Off` is always reachable).
    pub fn supports_active_profile(&self, device_profile: DeviceProfile) -> bool {
        let bit = profile_bits_for(device_profile);
        bit == 0 || self.profiles_connected & bit != 0
    }

    pub fn is_set_leader(&self) -> bool {
        self.set.as_ref().is_some_and(|s| s.is_leader)
    }

    pub fn current_card_profile(&self) -> CardProfileId {
        CardProfileId { device_profile: self.active_profile, codec_id: self.active_codec_id }
    }

    /// Applies a BlueZ `ProfileConnected`/`ProfileDisconnected` signal.
    pub fn set_profile_connected(&mut self, profile_bit: u32, connected: bool) {
        if connected {
            self.profiles_connected |= profile_bit;
        } else {
            self.profiles_connected &= !profile_bit;
            if self.active_profile != DeviceProfile::Off && self.transport.as_ref().is_some_and(|t| t.profile == profile_bit) {
                self.transport = None;
            }
        }
    }

    /// Whether `route` is currently usable on this device: the
    /// device must support the covering profile, and — for the
    /// `Set*` routes — must be the set's leader (§4.5).
    pub fn route_available(&self, route: RouteKind) -> bool {
        if route.requires_set_leader() && !self.is_set_leader() {
            return false;
        }
        route.available_under(self.profiles_connected)
    }

    pub fn set_active_profile(&mut self, id: CardProfileId) -> Result<(), Error> {
        let bit = profile_bits_for(id.device_profile);
        if bit != 0 && self.profiles_connected & bit == 0 {
            return Err(Error::NotAvailable(format!("profile not connected on {}", self.address)));
        }
        self.active_profile = id.device_profile;
        self.active_codec_id = id.codec_id;
        Ok(())
    }
}

/// The subset of [`super::profile::flags`] a [`DeviceProfile`] category
/// maps to, used to check "is this base profile actually connected".
fn profile_bits_for(device_profile: DeviceProfile) -> u32 {
    use crate::profile::flags::*;
    match device_profile {
        DeviceProfile::Off => 0,
        DeviceProfile::Ag => HEADSET_AUDIO_GATEWAY,
        DeviceProfile::A2dp => A2DP_DUPLEX,
        DeviceProfile::Bap => BAP_AUDIO,
        DeviceProfile::HspHfp => HEADSET_HEAD_UNIT,
    }
}

/// All devices known to the adapter, keyed by address. Owns device-set
/// aggregation: when every expected member of a set has joined, the
/// leader's routes become available.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, BtDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, device: BtDevice) {
        self.devices.insert(device.address.clone(), device);
    }

    pub fn get(&self, address: &str) -> Option<&BtDevice> {
        self.devices.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut BtDevice> {
        self.devices.get_mut(address)
    }

    pub fn remove(&mut self, address: &str) -> Option<BtDevice> {
        self.devices.remove(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BtDevice> {
        self.devices.values()
    }

    /// Groups `members` (addresses) into one [`SetMember`] set with
    /// `leader` as the aggregate owner. Devices not present yet are
    /// skipped; the caller is expected to have already `upsert`ed them.
    pub fn form_set(&mut self, set_id: &str, leader: &str, members: &[String]) {
        let peers: Vec<String> = members.iter().filter(|m| *m != leader).cloned().collect();
        if let Some(dev) = self.devices.get_mut(leader) {
            dev.set = Some(SetMember { set_id: set_id.to_string(), is_leader: true, peers: peers.clone() });
        }
        for member in &peers {
            if let Some(dev) = self.devices.get_mut(member) {
                dev.set = Some(SetMember {
                    set_id: set_id.to_string(),
                    is_leader: false,
                    peers: members.iter().filter(|m| *m != member).cloned().collect(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::flags;

    #[test]
    fn disconnecting_active_profile_drops_its_transport() {
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        dev.set_profile_connected(flags::A2DP_SINK, true);
        dev.transport = Some(BtTransport::new("/org/bluez/hci0/dev_AA_BB/sep1/fd0", "AA:BB", flags::A2DP_SINK, 1));
        dev.set_profile_connected(flags::A2DP_SINK, false);
        assert!(dev.transport.is_none());
        assert_eq!(dev.profiles_connected, 0);
    }

    #[test]
    fn set_active_profile_rejects_profile_not_connected() {
        let mut dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        let err = dev.set_active_profile(CardProfileId::base(DeviceProfile::A2dp));
        assert!(matches!(err, Err(Error::NotAvailable(_))));
    }

    #[test]
    fn transport_acquire_is_refcounted() {
        let mut t = BtTransport::new("/org/bluez/hci0/dev_AA_BB/fd0", "AA:BB", flags::A2DP_SINK, 1);
        t.acquire(10);
        t.acquire(10);
        assert_eq!(t.acquire_refcount, 2);
        assert!(t.is_acquired());
        assert_eq!(t.release(), None, "still one reference held");
        assert!(t.is_acquired());
        assert_eq!(t.release(), Some(10), "last release hands back the fd to close");
        assert!(!t.is_acquired());
        assert_eq!(t.state, TransportState::Idle);
    }

    #[test]
    fn set_channels_sizes_volumes_to_match() {
        let mut t = BtTransport::new("/org/bluez/hci0/dev_AA_BB/fd0", "AA:BB", flags::A2DP_SINK, 1);
        t.set_channels(vec![crate::device::SPA_AUDIO_CHANNEL_FL, crate::device::SPA_AUDIO_CHANNEL_FR]);
        assert_eq!(t.n_channels, 2);
        assert_eq!(t.volumes.len(), 2);
        assert_eq!(t.channels.len(), 2);
    }

    #[test]
    fn supports_active_profile_allows_off_unconditionally() {
        let dev = BtDevice::new("AA:BB", flags::A2DP_DUPLEX);
        assert!(dev.supports_active_profile(DeviceProfile::Off));
        assert!(!dev.supports_active_profile(DeviceProfile::A2dp));
    }

    #[test]
    fn set_routes_only_available_to_leader() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(BtDevice::new("leader", flags::BAP_AUDIO));
        registry.upsert(BtDevice::new("member", flags::BAP_AUDIO));
        registry.form_set("set0", "leader", &["leader".into(), "member".into()]);

        let leader = registry.get_mut("leader").unwrap();
        leader.set_profile_connected(flags::BAP_SINK, true);
        assert!(leader.route_available(RouteKind::SetOutput));

        let member = registry.get_mut("member").unwrap();
        member.set_profile_connected(flags::BAP_SINK, true);
        assert!(!member.route_available(RouteKind::SetOutput));
        assert_eq!(member.set.as_ref().unwrap().peers, vec!["leader".to_string()]);
    }
}
