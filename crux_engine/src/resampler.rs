use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

const CHUNK_SIZE: usize = 1024;

pub struct RateConverter;

impl RateConverter {
    /// Converts planar audio from `from_rate` to `to_rate` using sinc
    /// interpolation. The output is trimmed to the resampler's delay so it
    /// lines up with the input, and sized to `len * to_rate / from_rate`.
    pub fn convert(channels: &[Vec<f32>], from_rate: f64, to_rate: f64) -> Result<Vec<Vec<f32>>, anyhow::Error> {
        if from_rate <= 0.0 || to_rate <= 0.0 {
            return Err(anyhow::anyhow!("sample rates must be positive"));
        }
        let frames = channels.first().map(|c| c.len()).unwrap_or(0);
        if channels.is_empty() || frames == 0 || (from_rate - to_rate).abs() < f64::EPSILON {
            return Ok(channels.to_vec());
        }

        let ratio = to_rate / from_rate;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, channels.len())?;

        let delay = resampler.output_delay();
        let expected = (frames as f64 * ratio).ceil() as usize;
        let mut output: Vec<Vec<f32>> = (0..channels.len())
            .map(|_| Vec::with_capacity(expected + delay + CHUNK_SIZE))
            .collect();

        let mut pos = 0;
        // Keep feeding (zero padding past the end) until the delayed tail is out.
        while output[0].len() < expected + delay {
            let chunk: Vec<Vec<f32>> = channels
                .iter()
                .map(|c| {
                    let mut block = vec![0.0; CHUNK_SIZE];
                    if pos < frames {
                        let end = (pos + CHUNK_SIZE).min(frames);
                        block[..end - pos].copy_from_slice(&c[pos..end]);
                    }
                    block
                })
                .collect();
            let out = resampler.process(&chunk, None)?;
            for (dst, src) in output.iter_mut().zip(out) {
                dst.extend_from_slice(&src);
            }
            pos += CHUNK_SIZE;
        }

        Ok(output
            .into_iter()
            .map(|c| c[delay..delay + expected].to_vec())
            .collect())
    }
}
