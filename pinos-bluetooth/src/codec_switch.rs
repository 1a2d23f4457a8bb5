// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The codec-switch coroutine (SPEC_FULL.md §4.6): walks a candidate
//! codec list against BlueZ's `MediaEndpoint1.SetConfiguration`, falling
//! back to the next candidate on refusal, cooperatively and
//! non-blockingly driven by D-Bus method-reply callbacks from the main
//! loop — never by blocking on the reply itself.

use crate::error::Error;

/// What the driving loop should do next.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Issue `SetConfiguration` for this codec and call [`CodecSwitch::on_reply`]
    /// with the result when BlueZ replies.
    RequestCodec(u32),
    /// The switch is finished; no further action needed.
    Finished(Result<u32, SwitchError>),
}

#[derive(Debug, PartialEq)]
pub enum SwitchError {
    Cancelled,
    DeviceGone,
    NoCandidateAccepted,
}

impl From<SwitchError> for Error {
    fn from(e: SwitchError) -> Self {
        match e {
            SwitchError::Cancelled => Error::Cancelled,
            SwitchError::DeviceGone => Error::DeviceGone,
            SwitchError::NoCandidateAccepted => Error::NotAvailable("no candidate codec accepted".into()),
        }
    }
}

#[derive(Debug, PartialEq)]
enum State {
    Idle,
    AwaitingConfirm { codec_id: u32 },
    Done,
}

/// One in-flight codec switch for a single device. Owned by the caller
/// (typically alongside the device's [`crate::device::BtDevice`]);
/// `poll`/`on_reply` are called from the main loop's D-Bus dispatch, not
/// from any blocking wait.
pub struct CodecSwitch {
    device_address: String,
    remaining: Vec<u32>,
    state: State,
}

impl CodecSwitch {
    /// `candidates` is the preference-ordered list of codec ids to try,
    /// most preferred first (e.g. the device's advertised codecs
    /// intersected with ours, per §4.6).
    pub fn new(device_address: impl Into<String>, candidates: Vec<u32>) -> Self {
        Self { device_address: device_address.into(), remaining: candidates, state: State::Idle }
    }

    pub fn device_address(&self) -> &str {
        &self.device_address
    }

    /// Advances the coroutine: call once to start, and again after each
    /// [`Action::Finished`] is *not* returned — i.e. only `on_reply`
    /// drives further `poll` calls once a request is in flight.
    pub fn poll(&mut self) -> Action {
        match self.state {
            State::Done => Action::Finished(Err(SwitchError::NoCandidateAccepted)),
            State::AwaitingConfirm { codec_id } => Action::RequestCodec(codec_id),
            State::Idle => match self.remaining.first().copied() {
                Some(codec_id) => {
                    self.remaining.remove(0);
                    self.state = State::AwaitingConfirm { codec_id };
                    Action::RequestCodec(codec_id)
                }
                None => {
                    self.state = State::Done;
                    Action::Finished(Err(SwitchError::NoCandidateAccepted))
                }
            },
        }
    }

    /// Feeds back the result of a `SetConfiguration` D-Bus call made for
    /// the codec most recently returned by [`Self::poll`]. `errno` is a
    /// negative `-E*` value on failure, matching BlueZ's D-Bus error
    /// mapping, or `0` on success.
    pub fn on_reply(&mut self, errno: i32) -> Action {
        let State::AwaitingConfirm { codec_id } = self.state else {
            return self.poll();
        };
        if errno == 0 {
            self.state = State::Done;
            return Action::Finished(Ok(codec_id));
        }
        if errno == -libc::ECANCELED {
            self.state = State::Done;
            return Action::Finished(Err(SwitchError::Cancelled));
        }
        if errno == -libc::ENODEV {
            self.state = State::Done;
            return Action::Finished(Err(SwitchError::DeviceGone));
        }
        // Any other refusal (e.g. EINVAL, EBUSY from a concurrent
        // endpoint) falls through to the next candidate.
        self.state = State::Idle;
        self.poll()
    }

    pub fn cancel(&mut self) {
        self.state = State::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_candidates_and_succeeds_on_first() {
        let mut sw = CodecSwitch::new("AA:BB", vec![2, 1]);
        assert_eq!(sw.poll(), Action::RequestCodec(2));
        assert_eq!(sw.on_reply(0), Action::Finished(Ok(2)));
    }

    #[test]
    fn falls_back_to_next_candidate_on_refusal() {
        let mut sw = CodecSwitch::new("AA:BB", vec![2, 1]);
        assert_eq!(sw.poll(), Action::RequestCodec(2));
        assert_eq!(sw.on_reply(-(libc::EINVAL)), Action::RequestCodec(1));
        assert_eq!(sw.on_reply(0), Action::Finished(Ok(1)));
    }

    #[test]
    fn exhausting_candidates_reports_no_candidate_accepted() {
        let mut sw = CodecSwitch::new("AA:BB", vec![2]);
        sw.poll();
        assert_eq!(sw.on_reply(-(libc::EINVAL)), Action::Finished(Err(SwitchError::NoCandidateAccepted)));
    }

    #[test]
    fn cancellation_short_circuits_remaining_candidates() {
        let mut sw = CodecSwitch::new("AA:BB", vec![2, 1]);
        sw.poll();
        assert_eq!(sw.on_reply(-(libc::ECANCELED)), Action::Finished(Err(SwitchError::Cancelled)));
    }

    #[test]
    fn device_disconnect_aborts_switch() {
        let mut sw = CodecSwitch::new("AA:BB", vec![2, 1]);
        sw.poll();
        assert_eq!(sw.on_reply(-(libc::ENODEV)), Action::Finished(Err(SwitchError::DeviceGone)));
    }

    #[test]
    fn empty_candidate_list_finishes_immediately() {
        let mut sw = CodecSwitch::new("AA:BB", vec![]);
        assert_eq!(sw.poll(), Action::Finished(Err(SwitchError::NoCandidateAccepted)));
    }
}
