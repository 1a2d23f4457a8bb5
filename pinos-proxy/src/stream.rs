// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-stream lifecycle state machine (C7): `UNCONNECTED -> CONNECTING ->
//! CONFIGURE -> READY -> PAUSED -> STREAMING`, plus the one-shot-per-
//! `CONFIGURE` format negotiation and the hardware/soft volume split.

use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unconnected,
    Connecting,
    Configure,
    Ready,
    Paused,
    Streaming,
    Error(String),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "UNCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Configure => "CONFIGURE",
            Self::Ready => "READY",
            Self::Paused => "PAUSED",
            Self::Streaming => "STREAMING",
            Self::Error(_) => "ERROR",
        }
    }
}

/// Per-port volume state (SPEC_FULL.md §4.4).
#[derive(Clone, Debug, Default)]
pub struct PortVolume {
    pub volumes: Vec<f64>,
    pub soft_volumes: Vec<f64>,
    pub mute: bool,
    pub channels: Vec<u32>,
    pub latency_offset: i64,
}

/// Drives one stream through its lifecycle. Transition acks
/// (`AsyncComplete`) and `state_changed`/`format_changed` notifications
/// are delivered through the installed callbacks rather than returned,
/// matching how the RT path posts results asynchronously instead of
/// returning them synchronously (§7: "The RT path never surfaces errors
/// synchronously").
pub struct Stream {
    state: State,
    /// Set while a `set_format` is awaiting its `finish_format` echo;
    /// format negotiation is one-shot per CONFIGURE entry.
    pending_format_seq: Option<u32>,
    cached_format: Option<Vec<u8>>,
    pub hw_volume_owned: bool,
    pub port: PortVolume,
    pub on_state_changed: Option<Box<dyn FnMut(&State)>>,
    pub on_format_changed: Option<Box<dyn FnMut(&[u8])>>,
    pub on_async_complete: Option<Box<dyn FnMut(u32, i32)>>,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        Self {
            state: State::Unconnected,
            pending_format_seq: None,
            cached_format: None,
            hw_volume_owned: false,
            port: PortVolume::default(),
            on_state_changed: None,
            on_format_changed: None,
            on_async_complete: None,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    fn set_state(&mut self, new: State) {
        if new == self.state {
            return;
        }
        log::debug!("stream {} -> {}", self.state.name(), new.name());
        self.state = new;
        if let Some(cb) = &mut self.on_state_changed {
            cb(&self.state);
        }
    }

    fn complete(&mut self, seq: u32, result: i32) {
        if let Some(cb) = &mut self.on_async_complete {
            cb(seq, result);
        }
    }

    fn require(&self, allowed: &[State], action: &'static str) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition { state: self.state.name(), action })
        }
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        self.require(&[State::Unconnected], "connect")?;
        self.set_state(State::Connecting);
        Ok(())
    }

    pub fn transport_attached(&mut self) -> Result<(), Error> {
        self.require(&[State::Connecting], "attach transport")?;
        self.set_state(State::Configure);
        Ok(())
    }

    /// Begins format negotiation: caches `format` (deep copy, since the
    /// caller's wire buffer is reused for the next message), emits
    /// `format_changed`, and remembers `seq` so a later `finish_format`
    /// can be matched and acked.
    pub fn set_format(&mut self, seq: u32, format: &[u8]) -> Result<(), Error> {
        self.require(&[State::Configure], "set_format")?;
        self.cached_format = Some(format.to_vec());
        self.pending_format_seq = Some(seq);
        if let Some(cb) = &mut self.on_format_changed {
            cb(format);
        }
        Ok(())
    }

    /// The consumer's answer to a pending `set_format`. On success the
    /// stream advances to READY; on failure it stays in CONFIGURE so the
    /// peer can retry with a different format.
    pub fn finish_format(&mut self, seq: u32, result: i32) -> Result<(), Error> {
        self.require(&[State::Configure], "finish_format")?;
        let pending = self.pending_format_seq.take();
        if pending != Some(seq) {
            // Stale or mismatched ack; log and ignore rather than fail
            // the connection (protocol errors here are non-fatal, §7).
            log::warn!("finish_format seq {seq} does not match pending {pending:?}, ignoring");
            self.pending_format_seq = pending;
            return Ok(());
        }
        self.complete(seq, result);
        if result >= 0 {
            self.set_state(State::Ready);
        }
        Ok(())
    }

    pub fn cached_format(&self) -> Option<&[u8]> {
        self.cached_format.as_deref()
    }

    pub fn use_buffers(&mut self, n_buffers: u32) -> Result<(), Error> {
        match (&self.state, n_buffers) {
            (State::Ready, n) if n > 0 => {
                self.set_state(State::Paused);
                Ok(())
            }
            (State::Paused, 0) => {
                self.set_state(State::Ready);
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition { state: self.state.name(), action: "use_buffers" }),
        }
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.require(&[State::Paused], "start")?;
        self.set_state(State::Streaming);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), Error> {
        self.require(&[State::Streaming], "pause")?;
        self.set_state(State::Paused);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.pending_format_seq = None;
        self.cached_format = None;
        self.set_state(State::Unconnected);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.set_state(State::Error(reason.into()));
    }

    /// Applies a volume write (SPEC_FULL.md §4.4). When the remote owns
    /// hardware volume, returns the hardware value to send it: the
    /// loudest channel becomes the hardware gain and the rest is folded
    /// into `soft_volumes` as a per-channel residual so the DSP can still
    /// apply relative balance. When the local side owns it, `soft_volumes`
    /// is `volumes * boost` directly and `None` is returned (nothing to
    /// send upstream).
    pub fn set_volumes(&mut self, volumes: &[f64], boost: f64) -> Option<f64> {
        self.port.volumes = volumes.to_vec();
        if self.hw_volume_owned {
            let hw = volumes.iter().cloned().fold(0.0_f64, f64::max);
            self.port.soft_volumes = volumes
                .iter()
                .map(|v| if hw > 0.0 { v / hw } else { 0.0 })
                .collect();
            Some(hw)
        } else {
            self.port.soft_volumes = volumes.iter().map(|v| v * boost).collect();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_connect_to_streaming_in_bounded_calls() {
        let mut s = Stream::new();
        s.connect().unwrap();
        s.transport_attached().unwrap();
        s.set_format(1, &[1, 2, 3]).unwrap();
        s.finish_format(1, 0).unwrap();
        s.use_buffers(4).unwrap();
        s.start().unwrap();
        assert_eq!(*s.state(), State::Streaming);
    }

    #[test]
    fn failed_finish_format_stays_in_configure() {
        let mut s = Stream::new();
        s.connect().unwrap();
        s.transport_attached().unwrap();
        s.set_format(1, &[1]).unwrap();
        s.finish_format(1, -1).unwrap();
        assert_eq!(*s.state(), State::Configure);
        // A second attempt with a different format is allowed.
        s.set_format(2, &[9]).unwrap();
        s.finish_format(2, 0).unwrap();
        assert_eq!(*s.state(), State::Ready);
    }

    #[test]
    fn state_changed_is_idempotent() {
        let mut s = Stream::new();
        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let count2 = count.clone();
        s.on_state_changed = Some(Box::new(move |_| count2.set(count2.get() + 1)));
        s.connect().unwrap();
        assert_eq!(count.get(), 1);
        // Re-entering the same state (a no-op transition) must not refire.
        let before = count.get();
        s.set_state(State::Connecting);
        assert_eq!(count.get(), before);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut s = Stream::new();
        assert!(s.start().is_err());
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let mut s = Stream::new();
        s.connect().unwrap();
        s.transport_attached().unwrap();
        s.set_format(1, &[]).unwrap();
        s.finish_format(1, 0).unwrap();
        s.use_buffers(2).unwrap();
        s.start().unwrap();
        s.pause().unwrap();
        assert_eq!(*s.state(), State::Paused);
        s.use_buffers(0).unwrap();
        assert_eq!(*s.state(), State::Ready);
    }

    #[test]
    fn disconnect_from_any_state_returns_to_unconnected() {
        let mut s = Stream::new();
        s.connect().unwrap();
        s.transport_attached().unwrap();
        s.disconnect();
        assert_eq!(*s.state(), State::Unconnected);
    }

    #[test]
    fn hw_owned_volume_splits_max_and_residual() {
        let mut s = Stream::new();
        s.hw_volume_owned = true;
        let hw = s.set_volumes(&[0.5, 0.25], 1.0).unwrap();
        assert_eq!(hw, 0.5);
        assert_eq!(s.port.soft_volumes, vec![1.0, 0.5]);
    }

    #[test]
    fn local_owned_volume_applies_boost_directly() {
        let mut s = Stream::new();
        assert!(s.set_volumes(&[0.5, 0.25], 2.0).is_none());
        assert_eq!(s.port.soft_volumes, vec![1.0, 0.5]);
    }
}
