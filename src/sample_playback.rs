//! Sample streaming: interpolated reads, loop wrapping and boundary
//! crossfades.
//!
//! Playback position is a double so sub-sample accuracy survives long
//! playback at fractional pitch ratios. Two flag bits track the streaming
//! state of each voice sample: whether it is currently moving backwards and
//! whether it has entered its loop region.
//!
//! The boundary crossfade mixes the in-loop signal with the "tail" that
//! continues past the loop point, which keeps a loop seamless even when the
//! waveform is not zero-crossing-aligned at the boundary. The crossfade
//! curve is linear.

use crate::samplib::{AudioData, CheckedLoop, LoopMode};

pub mod loop_flags {
    pub const CURRENTLY_REVERSED: u32 = 1 << 0;
    pub const IN_LOOP: u32 = 1 << 1;
}

use loop_flags::{CURRENTLY_REVERSED, IN_LOOP};

/// Linear-interpolated stereo read, clamped to the file.
#[inline]
fn read_interpolated(audio: &AudioData, pos: f64) -> (f32, f32) {
    let clamped = pos.max(0.0);
    let index = clamped as u32;
    let frac = (clamped - index as f64) as f32;
    let (l0, r0) = audio.frame(index);
    let (l1, r1) = audio.frame(index + 1);
    (l0 + frac * (l1 - l0), r0 + frac * (r1 - r0))
}

/// Re-derive the streaming flags after a loop edit so a mid-flight voice
/// lands in a consistent state.
pub fn correct_loop_flags_if_needed(flags: u32, l: &CheckedLoop, pos: f64) -> u32 {
    let mut result = flags;
    if pos >= l.start_frame as f64 {
        result |= IN_LOOP;
    }
    if l.mode == LoopMode::PingPong && pos >= l.end_frame as f64 {
        result |= CURRENTLY_REVERSED;
    }
    result
}

/// Read the sample at `pos`, applying the loop-boundary crossfade when the
/// position is inside a crossfade window.
pub fn sample_get_data(
    audio: &AudioData,
    l: Option<&CheckedLoop>,
    flags: u32,
    pos: f64,
) -> (f32, f32) {
    let main = read_interpolated(audio, pos);

    let Some(l) = l else {
        return main;
    };
    if l.crossfade_frames == 0 {
        return main;
    }

    let start = l.start_frame as f64;
    let end = l.end_frame as f64;
    let crossfade = l.crossfade_frames as f64;
    let reversed = flags & CURRENTLY_REVERSED != 0;

    let (tail_pos, ratio) = if !reversed {
        let window_start = end - crossfade;
        if pos < window_start || pos >= end {
            return main;
        }
        let ratio = ((pos - window_start) / crossfade) as f32;
        let tail_pos = match l.mode {
            // The tail is the signal just before the loop start, about to be
            // wrapped to.
            LoopMode::Standard => pos - (end - start),
            // The tail is the reflection the bounce will continue into.
            LoopMode::PingPong => 2.0 * end - pos,
        };
        (tail_pos, ratio)
    } else {
        let window_end = start + crossfade;
        if pos < start || pos >= window_end {
            return main;
        }
        let ratio = ((window_end - pos) / crossfade) as f32;
        let tail_pos = match l.mode {
            LoopMode::Standard => pos + (end - start),
            LoopMode::PingPong => 2.0 * start - pos,
        };
        (tail_pos, ratio)
    };

    let tail = read_interpolated(audio, tail_pos);
    (
        main.0 + ratio * (tail.0 - main.0),
        main.1 + ratio * (tail.1 - main.1),
    )
}

/// Advance the playback position by `pitch_ratio` frames, handling loop
/// wrapping, ping-pong direction changes and end-of-stream. Returns false
/// once the stream is exhausted.
pub fn increment_playback_pos(
    l: Option<&CheckedLoop>,
    flags: &mut u32,
    pos: &mut f64,
    pitch_ratio: f64,
    num_frames: f64,
) -> bool {
    let reversed = *flags & CURRENTLY_REVERSED != 0;
    let mut new_pos = if reversed {
        *pos - pitch_ratio
    } else {
        *pos + pitch_ratio
    };

    match l {
        None => {
            if reversed {
                if new_pos < 0.0 {
                    return false;
                }
            } else if new_pos >= num_frames {
                return false;
            }
            *pos = new_pos;
            true
        }
        Some(l) => {
            let start = l.start_frame as f64;
            let end = l.end_frame as f64;
            let len = end - start;

            match l.mode {
                LoopMode::Standard => {
                    if !reversed {
                        if new_pos >= end {
                            new_pos = start + (new_pos - end) % len;
                            *flags |= IN_LOOP;
                        } else if new_pos >= start {
                            *flags |= IN_LOOP;
                        }
                    } else {
                        if new_pos <= end {
                            *flags |= IN_LOOP;
                        }
                        if new_pos < start {
                            if *flags & IN_LOOP != 0 {
                                new_pos = end - (start - new_pos) % len;
                            } else if new_pos < 0.0 {
                                return false;
                            }
                        }
                    }
                }
                LoopMode::PingPong => {
                    if !reversed {
                        if new_pos >= end {
                            new_pos = end - (new_pos - end).min(len);
                            *flags |= CURRENTLY_REVERSED | IN_LOOP;
                        } else if new_pos >= start {
                            *flags |= IN_LOOP;
                        }
                    } else {
                        if new_pos <= end {
                            *flags |= IN_LOOP;
                        }
                        if new_pos < start {
                            if *flags & IN_LOOP != 0 {
                                new_pos = start + (start - new_pos).min(len);
                                *flags &= !CURRENTLY_REVERSED;
                            } else if new_pos < 0.0 {
                                return false;
                            }
                        }
                    }
                }
            }

            *pos = new_pos.clamp(0.0, num_frames);
            true
        }
    }
}
