use super::client::{Awg, ChannelData};
use super::transport::ScpiTransport;
use crate::error::ScanError;
use crate::interface::{DeviceWarning, PulseGenerator};
use crate::pulse::PulseSequence;
use log::debug;

/// Maps a synthesized sequence onto the AWG's two waveform slots.
///
/// Control goes to output 1, signal to output 2; both share the marker track.
impl<T: ScpiTransport> PulseGenerator for Awg<T> {
    fn load_and_play(&mut self, sequence: &PulseSequence) -> Result<Vec<DeviceWarning>, ScanError> {
        let control = sequence.control.to_f32();
        let signal = sequence.signal.to_f32();
        let markers = sequence.marker_bytes();
        let (control_slot, signal_slot) = {
            let (c, s) = self.slots();
            (c.to_string(), s.to_string())
        };
        debug!(
            "Loading {} -> {control_slot}, {} -> {signal_slot}",
            sequence.control.name, sequence.signal.name
        );

        self.program_and_run(
            ChannelData {
                name: &control_slot,
                samples: &control,
                markers: &markers,
            },
            ChannelData {
                name: &signal_slot,
                samples: &signal,
                markers: &markers,
            },
        )
    }

    fn force_outputs_off(&mut self) -> Result<(), ScanError> {
        self.all_outputs_off()
    }
}
