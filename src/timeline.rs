//! Maps the native player's in-part position to an absolute VOD offset.
//!
//! Archived VODs are split across parts: multi-part YouTube mirrors carry a
//! duration per part, game-chapter captures carry an absolute start time per
//! segment. Chat offsets are always absolute seconds since VOD start, so
//! every tick folds the part layout, the backend-derived fixed delay and the
//! user-adjustable delay into a single offset.

/// Substituted when a part's duration is unknown. Twelve hours outlasts any
/// single archived part.
pub const DEFAULT_PART_SECS: f64 = 43_200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    /// 1-based index into the part sequence.
    pub part: usize,
    /// Seconds into the current part as reported by the native player.
    pub timestamp_secs: f64,
    pub playing: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            part: 1,
            timestamp_secs: 0.0,
            playing: false,
        }
    }
}

/// How parts cover the VOD.
#[derive(Debug, Clone, PartialEq)]
pub enum PartLayout {
    /// Parts play back to back; each entry is the part duration, `None`
    /// when the source did not report one.
    Sequential(Vec<Option<f64>>),
    /// Each segment carries its absolute start offset within the VOD.
    Anchored(Vec<f64>),
}

impl PartLayout {
    pub fn part_count(&self) -> usize {
        match self {
            PartLayout::Sequential(parts) => parts.len(),
            PartLayout::Anchored(starts) => starts.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    layout: PartLayout,
    fixed_delay_secs: f64,
    default_part_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekTarget {
    /// 1-based part index.
    pub part: usize,
    /// Seconds into that part.
    pub position_secs: f64,
}

impl Timeline {
    pub fn new(layout: PartLayout, fixed_delay_secs: f64, default_part_secs: f64) -> Self {
        Self {
            layout,
            fixed_delay_secs,
            default_part_secs,
        }
    }

    /// Single-part fallback used for local file playback.
    pub fn single_part(fixed_delay_secs: f64) -> Self {
        Self::new(
            PartLayout::Sequential(vec![None]),
            fixed_delay_secs,
            DEFAULT_PART_SECS,
        )
    }

    pub fn fixed_delay_secs(&self) -> f64 {
        self.fixed_delay_secs
    }

    pub fn part_count(&self) -> usize {
        self.layout.part_count()
    }

    fn part_duration(&self, index: usize) -> f64 {
        match &self.layout {
            PartLayout::Sequential(parts) => parts
                .get(index)
                .copied()
                .flatten()
                .unwrap_or(self.default_part_secs),
            PartLayout::Anchored(_) => 0.0,
        }
    }

    /// Absolute VOD offset for the given 1-based part and in-part position.
    ///
    /// Pure function of its arguments; the player's position moves
    /// continuously, so the result is never cached.
    pub fn offset_at(&self, part: usize, native_pos_secs: f64, user_delay_secs: f64) -> f64 {
        let part = part.max(1);
        let base = match &self.layout {
            PartLayout::Sequential(parts) => (0..part - 1)
                .map(|i| {
                    parts
                        .get(i)
                        .copied()
                        .flatten()
                        .unwrap_or(self.default_part_secs)
                })
                .sum::<f64>(),
            PartLayout::Anchored(starts) => starts.get(part - 1).copied().unwrap_or(0.0),
        };
        base + native_pos_secs + self.fixed_delay_secs + user_delay_secs
    }

    /// Maps an absolute VOD offset back to a (part, position) pair, the way
    /// a `?t=` deep link is resolved before playback starts.
    pub fn locate(&self, target_secs: f64) -> SeekTarget {
        let mut remaining = target_secs.max(0.0);
        match &self.layout {
            PartLayout::Sequential(parts) => {
                for (i, _) in parts.iter().enumerate() {
                    let duration = self.part_duration(i);
                    if remaining < duration {
                        return SeekTarget {
                            part: i + 1,
                            position_secs: remaining,
                        };
                    }
                    remaining -= duration;
                }
                SeekTarget {
                    part: parts.len().max(1),
                    position_secs: remaining,
                }
            }
            PartLayout::Anchored(starts) => {
                let mut part = 1;
                for (i, start) in starts.iter().enumerate() {
                    if *start <= remaining {
                        part = i + 1;
                    } else {
                        break;
                    }
                }
                let start = starts.get(part - 1).copied().unwrap_or(0.0);
                SeekTarget {
                    part,
                    position_secs: (remaining - start).max(0.0),
                }
            }
        }
    }
}

/// Backend-derived chat delay: the stretch of the VOD that the mirrored
/// parts do not cover. Unknown part durations substitute the default so a
/// single missing value cannot produce a bogus negative delay.
pub fn fixed_delay_secs(
    vod_duration_secs: f64,
    part_durations: &[Option<f64>],
    default_part_secs: f64,
) -> f64 {
    let covered: f64 = part_durations
        .iter()
        .map(|d| d.unwrap_or(default_part_secs))
        .sum();
    (vod_duration_secs - covered).max(0.0)
}

/// Parses `"HH:MM:SS"` (or `"MM:SS"`) into seconds.
pub fn parse_hms(text: &str) -> Option<f64> {
    let mut fields = text.split(':').rev();
    let secs: f64 = fields.next()?.trim().parse().ok()?;
    let mins: f64 = match fields.next() {
        Some(field) => field.trim().parse().ok()?,
        None => 0.0,
    };
    let hours: f64 = match fields.next() {
        Some(field) => field.trim().parse().ok()?,
        None => 0.0,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + mins * 60.0 + secs)
}

/// Formats seconds as `HH:MM:SS`, the form chat timestamps are shown in.
pub fn format_hms(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_offset_sums_prior_parts() {
        let timeline = Timeline::new(
            PartLayout::Sequential(vec![Some(600.0), Some(580.0), Some(610.0)]),
            12.0,
            DEFAULT_PART_SECS,
        );
        assert_eq!(timeline.offset_at(1, 30.0, 0.0), 42.0);
        assert_eq!(timeline.offset_at(3, 30.0, 0.0), 600.0 + 580.0 + 30.0 + 12.0);
    }

    #[test]
    fn unknown_duration_substitutes_default() {
        let timeline = Timeline::new(
            PartLayout::Sequential(vec![Some(600.0), Some(580.0), Some(610.0), None]),
            5.0,
            DEFAULT_PART_SECS,
        );
        // The unknown duration sits on part 4 itself, so it does not affect
        // the prefix sum for positions inside part 4.
        assert_eq!(
            timeline.offset_at(4, 30.0, 0.0),
            600.0 + 580.0 + 610.0 + 30.0 + 5.0
        );
        // It does affect positions past it.
        let timeline = Timeline::new(
            PartLayout::Sequential(vec![Some(600.0), None, Some(610.0)]),
            0.0,
            DEFAULT_PART_SECS,
        );
        assert_eq!(
            timeline.offset_at(3, 0.0, 0.0),
            600.0 + DEFAULT_PART_SECS
        );
    }

    #[test]
    fn anchored_offset_uses_segment_start() {
        let timeline = Timeline::new(
            PartLayout::Anchored(vec![0.0, 3600.0, 7200.0]),
            0.0,
            DEFAULT_PART_SECS,
        );
        assert_eq!(timeline.offset_at(2, 90.0, 0.0), 3690.0);
    }

    #[test]
    fn user_delay_shifts_offset() {
        let timeline = Timeline::single_part(10.0);
        assert_eq!(timeline.offset_at(1, 100.0, -4.0), 106.0);
    }

    #[test]
    fn locate_walks_sequential_parts() {
        let timeline = Timeline::new(
            PartLayout::Sequential(vec![Some(600.0), Some(580.0), Some(610.0)]),
            0.0,
            DEFAULT_PART_SECS,
        );
        assert_eq!(
            timeline.locate(610.0),
            SeekTarget {
                part: 2,
                position_secs: 10.0
            }
        );
        assert_eq!(timeline.locate(0.0).part, 1);
    }

    #[test]
    fn locate_picks_last_started_anchor() {
        let timeline = Timeline::new(
            PartLayout::Anchored(vec![0.0, 3600.0, 7200.0]),
            0.0,
            DEFAULT_PART_SECS,
        );
        let target = timeline.locate(3700.0);
        assert_eq!(target.part, 2);
        assert_eq!(target.position_secs, 100.0);
    }

    #[test]
    fn fixed_delay_never_negative() {
        assert_eq!(fixed_delay_secs(1000.0, &[Some(600.0)], DEFAULT_PART_SECS), 400.0);
        assert_eq!(
            fixed_delay_secs(1000.0, &[Some(600.0), Some(600.0)], DEFAULT_PART_SECS),
            0.0
        );
        // Unknown durations substitute the default, swallowing the delay.
        assert_eq!(fixed_delay_secs(1000.0, &[None], DEFAULT_PART_SECS), 0.0);
    }

    #[test]
    fn hms_round_trip() {
        assert_eq!(parse_hms("01:02:03"), Some(3723.0));
        assert_eq!(parse_hms("12:30"), Some(750.0));
        assert_eq!(parse_hms("xx:yy"), None);
        assert_eq!(format_hms(3723.0), "01:02:03");
        assert_eq!(format_hms(-5.0), "00:00:00");
    }
}
