//! Domain payload records
//!
//! These are the structured binary records that flow through a running
//! pipeline. The server never interprets sample values; it only needs the
//! header fields that determine how many trailing elements follow on the wire.

/// Fixed header preceding every acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcquisitionHeader {
    pub flags: u64,
    pub scan_counter: u32,
    pub time_stamp: u32,
    pub version: u16,
    pub number_of_samples: u16,
    pub active_channels: u16,
    pub trajectory_dimensions: u16,
    pub sample_time_us: f32,
    pub position: [f32; 3],
}

impl AcquisitionHeader {
    /// Number of trajectory values implied by the header
    pub fn trajectory_len(&self) -> usize {
        self.trajectory_dimensions as usize * self.number_of_samples as usize
    }

    /// Number of `f32` values (interleaved re/im) implied by the header
    pub fn data_len(&self) -> usize {
        2 * self.number_of_samples as usize * self.active_channels as usize
    }
}

/// One readout: header, k-space trajectory and complex samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acquisition {
    pub header: AcquisitionHeader,
    pub trajectory: Vec<f32>,
    /// Interleaved `(re, im)` pairs, channel-major
    pub data: Vec<f32>,
}

impl Acquisition {
    /// Build an acquisition with zeroed payload sized from `header`
    pub fn zeroed(header: AcquisitionHeader) -> Self {
        Self {
            trajectory: vec![0.0; header.trajectory_len()],
            data: vec![0.0; header.data_len()],
            header,
        }
    }

    /// Whether payload lengths agree with the header
    pub fn is_consistent(&self) -> bool {
        self.trajectory.len() == self.header.trajectory_len()
            && self.data.len() == self.header.data_len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveformHeader {
    pub version: u16,
    pub channels: u16,
    pub number_of_samples: u16,
    pub waveform_id: u16,
    pub scan_counter: u32,
    pub time_stamp: u32,
    pub sample_time_us: u32,
}

impl WaveformHeader {
    pub fn data_len(&self) -> usize {
        self.channels as usize * self.number_of_samples as usize
    }
}

/// Physiological signal (ECG, respiration) recorded alongside acquisitions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Waveform {
    pub header: WaveformHeader,
    pub data: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImageHeader {
    pub version: u16,
    pub data_type: u16,
    pub matrix_size: [u16; 3],
    pub channels: u16,
    pub image_index: u32,
    pub image_series_index: u32,
    pub field_of_view: [f32; 3],
}

impl ImageHeader {
    pub fn data_len(&self) -> usize {
        self.matrix_size.iter().map(|&d| d as usize).product::<usize>() * self.channels as usize
    }
}

/// Reconstructed image with free-form meta attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    pub header: ImageHeader,
    pub meta: String,
    pub data: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_lengths_follow_header() {
        let header = AcquisitionHeader {
            number_of_samples: 128,
            active_channels: 4,
            trajectory_dimensions: 2,
            ..Default::default()
        };
        let acq = Acquisition::zeroed(header);
        assert_eq!(acq.trajectory.len(), 256);
        assert_eq!(acq.data.len(), 1024);
        assert!(acq.is_consistent());
    }

    #[test]
    fn test_image_data_len_includes_channels() {
        let header = ImageHeader {
            matrix_size: [4, 4, 2],
            channels: 3,
            ..Default::default()
        };
        assert_eq!(header.data_len(), 96);
    }

    #[test]
    fn test_waveform_data_len() {
        let header = WaveformHeader {
            channels: 2,
            number_of_samples: 10,
            ..Default::default()
        };
        assert_eq!(header.data_len(), 20);
    }
}
