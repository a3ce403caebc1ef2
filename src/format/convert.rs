//! Sample format conversion and frame (un)packing.

/// Converts f32 samples to i16.
///
/// Input should be in the range [-1.0, 1.0]. Values outside this range are clamped.
/// Uses × 32767 for symmetric scaling, so -1.0 maps to -32767.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Converts i16 samples to f32 in the range [-1.0, 1.0].
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Converts a 32-bit microphone sample to f32 in the range [-1.0, 1.0].
#[inline]
pub fn i32_to_f32(sample: i32) -> f32 {
    sample as f32 / 2_147_483_648.0
}

/// Keeps the 16 most significant bits of a 32-bit sample.
#[inline]
pub fn i32_to_i16(sample: i32) -> i16 {
    (sample >> 16) as i16
}

/// Splits an interleaved little-endian hardware frame into per-channel buffers.
///
/// `sample_size` is 2 or 4 bytes. Returns `(i16 channels, f32 channels, raw i32 channels)`;
/// the raw buffers are only filled for 32-bit input.
pub fn unpack_interleaved(
    data: &[u8],
    sample_size: u8,
    channel_qty: u8,
) -> (Vec<Vec<i16>>, Vec<Vec<f32>>, Vec<Vec<i32>>) {
    let chans = usize::from(channel_qty.max(1));
    let size = usize::from(sample_size);
    let per_chan = data.len() / size / chans;

    let mut ints = vec![Vec::with_capacity(per_chan); chans];
    let mut floats = vec![Vec::with_capacity(per_chan); chans];
    let mut raws = if size == 4 {
        vec![Vec::with_capacity(per_chan); chans]
    } else {
        Vec::new()
    };

    for (index, sample) in data.chunks_exact(size).enumerate() {
        let chan = index % chans;
        if size == 4 {
            let value = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
            ints[chan].push(i32_to_i16(value));
            floats[chan].push(i32_to_f32(value));
            raws[chan].push(value);
        } else {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            ints[chan].push(value);
            floats[chan].push(i16_to_f32(value));
        }
    }
    (ints, floats, raws)
}

/// Widens 16-bit samples to the 32-bit scale, the inverse of [`i32_to_i16`].
pub fn widen_i16(samples: &[i16]) -> Vec<i32> {
    samples.iter().map(|&s| i32::from(s) << 16).collect()
}

/// Interleaves per-channel 16-bit buffers into little-endian bytes.
pub fn pack_i16(channels: &[&[i16]]) -> Vec<u8> {
    let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * channels.len() * 2);
    for frame in 0..frames {
        for chan in channels {
            out.extend_from_slice(&chan[frame].to_le_bytes());
        }
    }
    out
}

/// Interleaves per-channel 32-bit buffers into little-endian bytes.
pub fn pack_i32(channels: &[&[i32]]) -> Vec<u8> {
    let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * channels.len() * 4);
    for frame in 0..frames {
        for chan in channels {
            out.extend_from_slice(&chan[frame].to_le_bytes());
        }
    }
    out
}

/// Serializes 16-bit samples as little-endian bytes.
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parses little-endian bytes into 16-bit samples (a trailing odd byte is ignored).
pub fn le_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Linear gain factor for a level in dB.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Scales 16-bit samples by a dB gain with saturation.
pub fn apply_gain_db(samples: &mut [i16], db: f32) {
    if db == 0.0 {
        return;
    }
    let factor = db_to_linear(db);
    for sample in samples.iter_mut() {
        *sample = (f32::from(*sample) * factor).clamp(-32768.0, 32767.0) as i16;
    }
}

/// Peak absolute level of a frame scaled to 0..=255.
pub fn peak_level(samples: &[i16]) -> u8 {
    let peak = samples
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .unwrap_or(0);
    (u32::from(peak) * 255 / 32768) as u8
}
