// Format conversion for CPAL audio streams
//
// The executor works on interleaved f32 blocks. Devices may want f32, i16 or
// u16, so the stream callbacks convert between the device buffer and an f32
// scratch buffer. Conversions are allocation-free.

use cpal::{FromSample, Sample};

/// Convert an interleaved f32 block into the device sample format.
///
/// Converts `min(src.len(), dst.len())` samples.
#[inline]
pub fn write_interleaved<T>(src: &[f32], dst: &mut [T])
where
    T: Sample + FromSample<f32>,
{
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = T::from_sample(sample);
    }
}

/// Convert an interleaved device block into f32.
#[inline]
pub fn read_interleaved<T>(src: &[T], dst: &mut [f32])
where
    T: Sample,
    f32: FromSample<T>,
{
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = f32::from_sample(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_passthrough() {
        let src = [0.0, 0.5, -0.5, 1.0];
        let mut dst = [0.0f32; 4];
        write_interleaved(&src, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_i16_conversion() {
        let src = [0.0f32, 1.0, -1.0];
        let mut dst = [1i16; 3];
        write_interleaved(&src, &mut dst);
        assert_eq!(dst[0], 0);
        assert!(dst[1] > 32000);
        assert!(dst[2] < -32000);

        let mut back = [9.0f32; 3];
        read_interleaved(&dst, &mut back);
        assert!(back[0].abs() < 1e-4);
        assert!((back[1] - 1.0).abs() < 1e-3);
        assert!((back[2] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_u16_zero_is_midpoint() {
        let mut dst = [0u16; 1];
        write_interleaved(&[0.0], &mut dst);
        assert!((dst[0] as i32 - 32768).abs() <= 1);
    }

    #[test]
    fn test_shorter_destination() {
        let mut dst = [0.0f32; 2];
        write_interleaved(&[0.1, 0.2, 0.3], &mut dst);
        assert_eq!(dst, [0.1, 0.2]);
    }
}
