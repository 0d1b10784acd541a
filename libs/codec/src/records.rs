//! Fixed-layout record headers
//!
//! Wire headers are zerocopy structs built from explicit little-endian field
//! types, so they have alignment 1, no padding and an identical layout on
//! every host. The ergonomic counterparts live in `types::records`.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────┐
//! │ fixed header         │ element arrays sized by the header   │
//! │ (40 / 20 / 32 bytes) │ (no length prefix)                   │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```

use crate::error::{CodecError, CodecResult};
use std::io::{Read, Write};
use std::mem::size_of;
use types::{AcquisitionHeader, ImageHeader, WaveformHeader};
use zerocopy::byteorder::{LittleEndian, F32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;
type LeF32 = F32<LittleEndian>;

/// Acquisition header on the wire (40 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WireAcquisitionHeader {
    pub flags: Le64,
    pub scan_counter: Le32,
    pub time_stamp: Le32,
    pub version: Le16,
    pub number_of_samples: Le16,
    pub active_channels: Le16,
    pub trajectory_dimensions: Le16,
    pub sample_time_us: LeF32,
    pub position: [LeF32; 3],
}

/// Waveform header on the wire (20 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WireWaveformHeader {
    pub version: Le16,
    pub channels: Le16,
    pub number_of_samples: Le16,
    pub waveform_id: Le16,
    pub scan_counter: Le32,
    pub time_stamp: Le32,
    pub sample_time_us: Le32,
}

/// Image header on the wire (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WireImageHeader {
    pub version: Le16,
    pub data_type: Le16,
    pub matrix_size: [Le16; 3],
    pub channels: Le16,
    pub image_index: Le32,
    pub image_series_index: Le32,
    pub field_of_view: [LeF32; 3],
}

/// Read one fixed-size wire header
pub fn read_header<H, R>(stream: &mut R, context: &str) -> CodecResult<H>
where
    H: FromBytes,
    R: Read + ?Sized,
{
    let mut buffer = vec![0u8; size_of::<H>()];
    stream
        .read_exact(&mut buffer)
        .map_err(CodecError::io(context))?;
    H::read_from(&buffer[..]).ok_or_else(|| {
        CodecError::protocol(format!(
            "{context}: expected {} header bytes",
            size_of::<H>()
        ))
    })
}

pub fn write_header<H, W>(stream: &mut W, header: &H) -> CodecResult<()>
where
    H: AsBytes,
    W: Write + ?Sized,
{
    stream
        .write_all(header.as_bytes())
        .map_err(CodecError::io("writing record header"))
}

impl From<&AcquisitionHeader> for WireAcquisitionHeader {
    fn from(h: &AcquisitionHeader) -> Self {
        Self {
            flags: Le64::new(h.flags),
            scan_counter: Le32::new(h.scan_counter),
            time_stamp: Le32::new(h.time_stamp),
            version: Le16::new(h.version),
            number_of_samples: Le16::new(h.number_of_samples),
            active_channels: Le16::new(h.active_channels),
            trajectory_dimensions: Le16::new(h.trajectory_dimensions),
            sample_time_us: LeF32::new(h.sample_time_us),
            position: h.position.map(LeF32::new),
        }
    }
}

impl From<&WireAcquisitionHeader> for AcquisitionHeader {
    fn from(w: &WireAcquisitionHeader) -> Self {
        Self {
            flags: w.flags.get(),
            scan_counter: w.scan_counter.get(),
            time_stamp: w.time_stamp.get(),
            version: w.version.get(),
            number_of_samples: w.number_of_samples.get(),
            active_channels: w.active_channels.get(),
            trajectory_dimensions: w.trajectory_dimensions.get(),
            sample_time_us: w.sample_time_us.get(),
            position: w.position.map(|p| p.get()),
        }
    }
}

impl From<&WaveformHeader> for WireWaveformHeader {
    fn from(h: &WaveformHeader) -> Self {
        Self {
            version: Le16::new(h.version),
            channels: Le16::new(h.channels),
            number_of_samples: Le16::new(h.number_of_samples),
            waveform_id: Le16::new(h.waveform_id),
            scan_counter: Le32::new(h.scan_counter),
            time_stamp: Le32::new(h.time_stamp),
            sample_time_us: Le32::new(h.sample_time_us),
        }
    }
}

impl From<&WireWaveformHeader> for WaveformHeader {
    fn from(w: &WireWaveformHeader) -> Self {
        Self {
            version: w.version.get(),
            channels: w.channels.get(),
            number_of_samples: w.number_of_samples.get(),
            waveform_id: w.waveform_id.get(),
            scan_counter: w.scan_counter.get(),
            time_stamp: w.time_stamp.get(),
            sample_time_us: w.sample_time_us.get(),
        }
    }
}

impl From<&ImageHeader> for WireImageHeader {
    fn from(h: &ImageHeader) -> Self {
        Self {
            version: Le16::new(h.version),
            data_type: Le16::new(h.data_type),
            matrix_size: h.matrix_size.map(Le16::new),
            channels: Le16::new(h.channels),
            image_index: Le32::new(h.image_index),
            image_series_index: Le32::new(h.image_series_index),
            field_of_view: h.field_of_view.map(LeF32::new),
        }
    }
}

impl From<&WireImageHeader> for ImageHeader {
    fn from(w: &WireImageHeader) -> Self {
        Self {
            version: w.version.get(),
            data_type: w.data_type.get(),
            matrix_size: w.matrix_size.map(|d| d.get()),
            channels: w.channels.get(),
            image_index: w.image_index.get(),
            image_series_index: w.image_series_index.get(),
            field_of_view: w.field_of_view.map(|f| f.get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_wire_header_sizes() {
        assert_eq!(size_of::<WireAcquisitionHeader>(), 40);
        assert_eq!(size_of::<WireWaveformHeader>(), 20);
        assert_eq!(size_of::<WireImageHeader>(), 32);
    }

    #[test]
    fn test_acquisition_header_is_little_endian() {
        let header = AcquisitionHeader {
            scan_counter: 0x0102_0304,
            ..Default::default()
        };
        let wire = WireAcquisitionHeader::from(&header);
        // flags occupy bytes 0..8, scan_counter follows
        assert_eq!(&wire.as_bytes()[8..12], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_short_header_is_truncation() {
        let mut stream = Cursor::new(vec![0u8; 10]);
        let err = read_header::<WireImageHeader, _>(&mut stream, "IMAGE header").unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
